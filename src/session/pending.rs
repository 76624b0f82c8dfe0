//! Pending-mutation ledger
//!
//! Each optimistic write is a ticket keyed by (node, field). A ticket moves
//! from `Pending` to `Confirmed` or `RolledBack` exactly once. Per key the
//! ledger tracks every outstanding intent and the last value the store is
//! known to hold.
//!
//! The view shows the newest intent that has not been rolled back, or the
//! known-good value when every intent has failed. A resolution only asks the
//! view to change when that shown value changes.

use crate::graph::NodeId;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// State of one pending write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

/// What a field-level write targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub node: NodeId,
    pub field: String,
}

impl FieldKey {
    pub fn new(node: NodeId, field: impl Into<String>) -> Self {
        Self {
            node,
            field: field.into(),
        }
    }
}

/// Handle returned by `begin`; pass it back to `resolve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTicket {
    pub key: FieldKey,
    seq: u64,
}

/// What the view must do once a write settles
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The view already shows this write's value; leave it alone
    Confirmed,
    /// A newer surviving edit owns this key; leave the view alone
    Superseded,
    /// The shown intent failed; put this value in the view instead
    RolledBack { restore: Value },
    /// An older write landed after the shown one was confirmed; the store
    /// must be given the shown value again
    Reassert { value: Value },
}

#[derive(Debug)]
struct Ledger {
    known_good: Value,
    known_good_seq: u64,
    writes: BTreeMap<u64, (Value, MutationState)>,
}

impl Ledger {
    fn has_pending(&self) -> bool {
        self.writes
            .values()
            .any(|(_, state)| *state == MutationState::Pending)
    }

    /// Newest write that has not been rolled back
    fn shown(&self) -> Option<(u64, &Value, MutationState)> {
        self.writes
            .iter()
            .rev()
            .find(|(_, (_, state))| *state != MutationState::RolledBack)
            .map(|(seq, (value, state))| (*seq, value, *state))
    }

    /// Value the view should hold for this key
    fn view_value(&self) -> Value {
        self.shown()
            .map_or_else(|| self.known_good.clone(), |(_, value, _)| value.clone())
    }
}

/// Pending writes of one view session
#[derive(Debug, Default)]
pub struct PendingTable {
    ledgers: HashMap<FieldKey, Ledger>,
    next_seq: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local edit from `previous` to `intent`.
    ///
    /// `previous` seeds the known-good value only when no write for the key
    /// is outstanding; otherwise the existing known-good value stands.
    pub fn begin(&mut self, key: FieldKey, previous: Value, intent: Value) -> WriteTicket {
        self.next_seq += 1;
        let seq = self.next_seq;
        let ledger = self.ledgers.entry(key.clone()).or_insert_with(|| Ledger {
            known_good: previous,
            known_good_seq: 0,
            writes: BTreeMap::new(),
        });
        ledger.writes.insert(seq, (intent, MutationState::Pending));
        WriteTicket { key, seq }
    }

    /// Settle a write. Unknown or already settled tickets resolve as superseded.
    pub fn resolve(&mut self, ticket: &WriteTicket, succeeded: bool) -> Resolution {
        let Some(ledger) = self.ledgers.get_mut(&ticket.key) else {
            return Resolution::Superseded;
        };
        let was_shown = ledger.shown().map(|(seq, _, _)| seq) == Some(ticket.seq);
        let Some((value, state)) = ledger.writes.get_mut(&ticket.seq) else {
            return Resolution::Superseded;
        };
        if *state != MutationState::Pending {
            return Resolution::Superseded;
        }

        let resolution = if succeeded {
            *state = MutationState::Confirmed;
            if ticket.seq > ledger.known_good_seq {
                ledger.known_good = value.clone();
                ledger.known_good_seq = ticket.seq;
            }
            match ledger.shown() {
                _ if was_shown => Resolution::Confirmed,
                Some((seq, shown, MutationState::Confirmed)) if seq > ticket.seq => {
                    Resolution::Reassert {
                        value: shown.clone(),
                    }
                }
                _ => Resolution::Superseded,
            }
        } else {
            *state = MutationState::RolledBack;
            if was_shown {
                Resolution::RolledBack {
                    restore: ledger.view_value(),
                }
            } else {
                Resolution::Superseded
            }
        };

        if !ledger.has_pending() {
            self.ledgers.remove(&ticket.key);
        }
        resolution
    }

    /// State of a ticket while its key still has writes outstanding
    pub fn state(&self, ticket: &WriteTicket) -> Option<MutationState> {
        self.ledgers
            .get(&ticket.key)
            .and_then(|l| l.writes.get(&ticket.seq))
            .map(|(_, state)| *state)
    }

    pub fn is_pending(&self, key: &FieldKey) -> bool {
        self.ledgers.get(key).map_or(false, Ledger::has_pending)
    }

    /// Shown intent of every key whose shown write is still in flight.
    ///
    /// Keys whose shown write already settled are left to fresh store data.
    pub fn intents(&self) -> Vec<(FieldKey, Value)> {
        self.ledgers
            .iter()
            .filter_map(|(key, ledger)| match ledger.shown() {
                Some((_, value, MutationState::Pending)) => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> FieldKey {
        FieldKey::new(NodeId::from("s1"), "title")
    }

    #[test]
    fn single_write_confirms() {
        let mut table = PendingTable::new();
        let t = table.begin(key(), json!("Old"), json!("New"));
        assert_eq!(table.state(&t), Some(MutationState::Pending));
        assert_eq!(table.resolve(&t, true), Resolution::Confirmed);
        assert!(table.is_empty());
    }

    #[test]
    fn single_failure_restores_previous_value() {
        let mut table = PendingTable::new();
        let t = table.begin(key(), json!("Old"), json!("New"));
        assert_eq!(
            table.resolve(&t, false),
            Resolution::RolledBack { restore: json!("Old") }
        );
    }

    #[test]
    fn superseded_failure_leaves_view_alone() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("A"), json!("B"));
        let second = table.begin(key(), json!("B"), json!("C"));
        assert_eq!(table.resolve(&first, false), Resolution::Superseded);
        assert_eq!(table.state(&first), Some(MutationState::RolledBack));
        assert_eq!(table.resolve(&second, true), Resolution::Confirmed);
    }

    #[test]
    fn latest_failure_restores_last_confirmed_value() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("A"), json!("B"));
        let second = table.begin(key(), json!("B"), json!("C"));
        assert_eq!(table.resolve(&first, true), Resolution::Superseded);
        assert_eq!(
            table.resolve(&second, false),
            Resolution::RolledBack { restore: json!("B") }
        );
    }

    #[test]
    fn latest_failure_falls_back_to_older_pending_intent() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("A"), json!("B"));
        let second = table.begin(key(), json!("B"), json!("C"));
        assert_eq!(
            table.resolve(&second, false),
            Resolution::RolledBack { restore: json!("B") }
        );
        assert!(table.is_pending(&key()));
        // The view already shows B, which the store now holds too
        assert_eq!(table.resolve(&first, true), Resolution::Confirmed);
        assert!(!table.is_pending(&key()));
    }

    #[test]
    fn both_failing_restores_original() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("A"), json!("B"));
        let second = table.begin(key(), json!("B"), json!("C"));
        assert_eq!(
            table.resolve(&second, false),
            Resolution::RolledBack { restore: json!("B") }
        );
        assert_eq!(
            table.resolve(&first, false),
            Resolution::RolledBack { restore: json!("A") }
        );
        assert!(table.is_empty());
    }

    #[test]
    fn rolled_back_intent_is_never_overlaid() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("Guide"), json!("Draft"));
        let second = table.begin(key(), json!("Draft"), json!("Failed"));
        table.resolve(&second, false);
        assert_eq!(table.intents(), vec![(key(), json!("Draft"))]);

        table.resolve(&first, true);
        assert!(table.intents().is_empty());
    }

    #[test]
    fn settled_shown_write_is_not_overlaid() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("A"), json!("B"));
        let second = table.begin(key(), json!("B"), json!("C"));
        assert_eq!(table.resolve(&second, true), Resolution::Confirmed);
        assert!(table.is_pending(&key()));
        assert!(table.intents().is_empty());
        assert_eq!(table.resolve(&first, false), Resolution::Superseded);
    }

    #[test]
    fn older_success_after_newer_confirmation_reasserts_newer() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("A"), json!("B"));
        let second = table.begin(key(), json!("B"), json!("C"));
        assert_eq!(table.resolve(&second, true), Resolution::Confirmed);
        assert_eq!(
            table.resolve(&first, true),
            Resolution::Reassert { value: json!("C") }
        );
        assert!(table.is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let mut table = PendingTable::new();
        let title = table.begin(key(), json!("A"), json!("B"));
        let desc = table.begin(
            FieldKey::new(NodeId::from("s1"), "description"),
            json!(null),
            json!("D"),
        );
        assert_eq!(table.resolve(&desc, false), Resolution::RolledBack { restore: json!(null) });
        assert_eq!(table.resolve(&title, true), Resolution::Confirmed);
    }

    #[test]
    fn intents_report_latest_value_per_key() {
        let mut table = PendingTable::new();
        table.begin(key(), json!("A"), json!("B"));
        table.begin(key(), json!("B"), json!("C"));
        assert_eq!(table.intents(), vec![(key(), json!("C"))]);
    }

    #[test]
    fn resolving_twice_is_a_no_op() {
        let mut table = PendingTable::new();
        let first = table.begin(key(), json!("A"), json!("B"));
        let _second = table.begin(key(), json!("B"), json!("C"));
        table.resolve(&first, true);
        assert_eq!(table.resolve(&first, false), Resolution::Superseded);
    }
}
