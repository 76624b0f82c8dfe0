//! Shared helpers for scenario tests: store seeding and random entity sets

#![allow(dead_code)]

use ostsync::storage::{to_row, EntityStore, Row};
use ostsync::{EntitySet, Experiment, NodeId, Opportunity, Outcome, Solution, Table};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

/// Insert one row given as a JSON object
pub async fn seed(store: &dyn EntityStore, table: Table, row: Value) -> Row {
    store
        .insert(table, to_row(&row).expect("seed row is an object"))
        .await
        .expect("seed insert")
}

/// Tree t1 owned by alice: O1 > P1 > S1
pub async fn seed_basic_tree(store: &dyn EntityStore) {
    seed(store, Table::Trees, json!({"id": "t1", "name": "Activation", "created_by": "alice"})).await;
    seed(store, Table::Outcomes, json!({"id": "o1", "tree_id": "t1", "title": "Grow activation"})).await;
    seed(
        store,
        Table::Opportunities,
        json!({"id": "p1", "outcome_id": "o1", "title": "Setup takes too long"}),
    )
    .await;
    seed(
        store,
        Table::Solutions,
        json!({"id": "s1", "opportunity_id": "p1", "title": "Setup wizard"}),
    )
    .await;
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).expect("fixture record")
}

pub fn outcome(id: &str) -> Outcome {
    decode(json!({"id": id, "tree_id": "t1", "title": id}))
}

pub fn opportunity(id: &str, outcome: &str) -> Opportunity {
    decode(json!({"id": id, "outcome_id": outcome, "title": id}))
}

pub fn solution(id: &str, opportunity: Option<&str>, parent: Option<&str>) -> Solution {
    decode(json!({
        "id": id,
        "opportunity_id": opportunity,
        "parent_solution_id": parent,
        "title": id,
    }))
}

pub fn experiment(id: &str, solution: &str) -> Experiment {
    decode(json!({"id": id, "solution_id": solution, "title": id}))
}

/// One outcome, one opportunity, and a straight chain of `n` solutions
pub fn solution_chain(n: usize) -> EntitySet {
    let mut set = EntitySet::new();
    set.outcomes.push(outcome("o1"));
    set.opportunities.push(opportunity("p1", "o1"));
    for i in 0..n {
        let id = format!("s{}", i);
        let s = if i == 0 {
            solution(&id, Some("p1"), None)
        } else {
            solution(&id, None, Some(&format!("s{}", i - 1)))
        };
        set.solutions.push(s);
    }
    set
}

/// A random well-formed entity set.
///
/// Every parent reference points at an earlier record, so the solution
/// forest is acyclic. A few solutions are left orphaned.
pub fn random_entities(seed: u64) -> EntitySet {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut set = EntitySet::new();

    for i in 0..rng.gen_range(1..4) {
        set.outcomes.push(outcome(&format!("o{}", i)));
    }
    for i in 0..rng.gen_range(1..8) {
        let parent = rng.gen_range(0..set.outcomes.len());
        set.opportunities
            .push(opportunity(&format!("p{}", i), &format!("o{}", parent)));
    }
    for i in 0..rng.gen_range(0..20) {
        let id = format!("s{}", i);
        let roll = rng.gen_range(0..10);
        let s = if i == 0 || roll < 4 {
            let parent = rng.gen_range(0..set.opportunities.len());
            solution(&id, Some(&format!("p{}", parent)), None)
        } else if roll < 9 {
            let parent = rng.gen_range(0..i);
            solution(&id, None, Some(&format!("s{}", parent)))
        } else {
            solution(&id, None, None)
        };
        set.solutions.push(s);
    }
    if !set.solutions.is_empty() {
        for i in 0..rng.gen_range(0..6) {
            let parent = rng.gen_range(0..set.solutions.len());
            set.experiments
                .push(experiment(&format!("e{}", i), &format!("s{}", parent)));
        }
    }
    set
}

pub fn id(s: &str) -> NodeId {
    NodeId::from(s)
}
