//! ostsync CLI: inspect and edit opportunity-solution trees in a local store.
//!
//! Usage:
//!   ostsync tree <subcommand> [--db path] [--user id]
//!   ostsync node <subcommand> <tree> ...
//!   ostsync show|timeline|graph|export|activity <tree>

use clap::{Parser, Subcommand};
use ostsync::access::{check_node_access, open_tree, visible_trees};
use ostsync::activity::{
    action_name, log_activity, recent_activity, save_profile, ActivityVerb, UserProfile,
    DEFAULT_FEED_LIMIT,
};
use ostsync::session::{UserIdentity, ViewSession};
use ostsync::storage::{to_row, EntityStore, OpenStore, SqliteStore};
use ostsync::{export_file_name, GroupBy, NodeId, NodeKind, Role, SyncConfig, Table, VoteOutcome};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;

#[derive(Parser)]
#[command(
    name = "ostsync",
    version,
    about = "Collaborative opportunity-solution tree sync engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// User id to act as
    #[arg(long, global = true, default_value = "local")]
    user: String,
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage trees
    Tree {
        #[command(subcommand)]
        action: TreeAction,
    },
    /// Manage outcomes
    Outcome {
        #[command(subcommand)]
        action: OutcomeAction,
    },
    /// Create, connect, edit and delete nodes
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Toggle your vote (1-5) on a node
    Vote {
        tree: String,
        node: String,
        value: u8,
    },
    /// Print the flattened hierarchy
    Show { tree: String },
    /// Print dated items grouped by outcome or opportunity
    Timeline {
        tree: String,
        #[arg(long, default_value = "outcome")]
        group_by: GroupBy,
    },
    /// Print the node/edge graph as JSON
    Graph { tree: String },
    /// Write the export document to a file
    Export {
        tree: String,
        /// Directory to write into
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Print the most recent changes to a tree
    Activity {
        tree: String,
        #[arg(long, default_value_t = DEFAULT_FEED_LIMIT)]
        limit: usize,
    },
    /// Set the name and email shown for your user
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
}

#[derive(Subcommand)]
enum TreeAction {
    /// Create a new tree
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Let anyone view the tree
        #[arg(long)]
        public: bool,
    },
    /// List trees visible to the user
    List,
    /// Delete a tree you own
    Delete { tree: String },
    /// Add a member to a tree you own
    Share {
        tree: String,
        member: String,
        /// editor or viewer
        #[arg(long, default_value = "editor")]
        role: String,
    },
}

#[derive(Subcommand)]
enum OutcomeAction {
    /// Add an outcome to a tree
    Add { tree: String },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Create the default child of a node
    AddChild {
        tree: String,
        parent: String,
        /// Add an experiment under a solution instead of a sub-solution
        #[arg(long)]
        experiment: bool,
    },
    /// Make TARGET a child of SOURCE
    Connect {
        tree: String,
        source: String,
        target: String,
    },
    /// Set one field; VALUE is parsed as JSON, else taken as a string
    Edit {
        tree: String,
        node: String,
        field: String,
        value: String,
    },
    /// Delete a node; its children become orphans
    Delete { tree: String, node: String },
    /// Show a node with its breadcrumb and sub-solutions
    Info {
        tree: String,
        /// outcome, opportunity, solution or experiment
        kind: String,
        node: String,
    },
}

/// Get the default database path (~/.local/share/ostsync/ostsync.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let ostsync_dir = data_dir.join("ostsync");
    std::fs::create_dir_all(&ostsync_dir).ok();
    ostsync_dir.join("ostsync.db")
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig, String> {
    let config = match path {
        Some(path) => SyncConfig::load(&path)
            .map_err(|e| format!("Failed to load config '{}': {}", path.display(), e))?,
        None => SyncConfig::default(),
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn open_store(db: Option<PathBuf>) -> Result<Arc<SqliteStore>, String> {
    let db_path = db.unwrap_or_else(default_db_path);
    SqliteStore::open(&db_path)
        .map(Arc::new)
        .map_err(|e| format!("Failed to open database: {}", e))
}

/// Parse a field value: JSON when it parses, a plain string otherwise
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

struct App {
    store: Arc<SqliteStore>,
    config: SyncConfig,
    user: String,
}

type CmdResult = Result<(), String>;

impl App {
    async fn session(&self, tree: &str) -> Result<ViewSession, String> {
        let tree_id = NodeId::from(tree);
        let (_, role) = open_tree(self.store.as_ref(), &tree_id, &self.user)
            .await
            .map_err(|e| e.to_string())?;
        ViewSession::open(
            self.store.clone(),
            &tree_id,
            UserIdentity::new(self.user.clone()),
            role,
            self.config.clone(),
            None,
        )
        .await
        .map_err(|e| e.to_string())
    }

    /// Fail unless the user owns the tree
    async fn require_owner(&self, tree_id: &NodeId, action: &str) -> CmdResult {
        match open_tree(self.store.as_ref(), tree_id, &self.user).await {
            Ok((_, Role::Owner)) => Ok(()),
            Ok(_) => Err(format!("only the owner can {} tree '{}'", action, tree_id)),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn tree_create(&self, name: &str, description: Option<String>, public: bool) -> CmdResult {
        let row = to_row(&json!({
            "name": name,
            "description": description,
            "is_public": public,
            "created_by": self.user,
        }))
        .map_err(|e| e.to_string())?;
        let stored = self
            .store
            .insert(Table::Trees, row)
            .await
            .map_err(|e| e.to_string())?;
        let id = stored.get("id").and_then(Value::as_str).unwrap_or_default();
        log_activity(
            self.store.as_ref(),
            &NodeId::from(id),
            &self.user,
            &action_name(Table::Trees, ActivityVerb::Created),
            None,
            Some(json!({"title": name})),
        )
        .await
        .map_err(|e| e.to_string())?;
        println!("Created tree '{}' ({})", name, id);
        Ok(())
    }

    async fn tree_list(&self) -> CmdResult {
        let trees = visible_trees(self.store.as_ref(), &self.user)
            .await
            .map_err(|e| e.to_string())?;
        if trees.is_empty() {
            println!("No trees visible.");
            return Ok(());
        }
        println!("{:<36}  {:<28}  {:<6}  {:>6}", "ID", "NAME", "ROLE", "PUBLIC");
        println!("{}", "-".repeat(82));
        for (tree, role) in trees {
            println!(
                "{:<36}  {:<28}  {:<6}  {:>6}",
                tree.id,
                tree.name,
                role.as_str(),
                if tree.is_public() { "yes" } else { "no" }
            );
        }
        Ok(())
    }

    async fn tree_delete(&self, tree: &str) -> CmdResult {
        let tree_id = NodeId::from(tree);
        self.require_owner(&tree_id, "delete").await?;
        self.store
            .delete(Table::Trees, &tree_id)
            .await
            .map_err(|e| e.to_string())?;
        println!("Deleted tree '{}'", tree);
        Ok(())
    }

    async fn tree_share(&self, tree: &str, member: &str, role: &str) -> CmdResult {
        let role = match role {
            "editor" => Role::Editor,
            "viewer" => Role::Viewer,
            other => return Err(format!("unknown role '{}' (expected editor or viewer)", other)),
        };
        let tree_id = NodeId::from(tree);
        self.require_owner(&tree_id, "share").await?;
        let row = to_row(&json!({"tree_id": tree_id, "user_id": member, "role": role}))
            .map_err(|e| e.to_string())?;
        self.store
            .insert(Table::TreeMembers, row)
            .await
            .map_err(|e| e.to_string())?;
        println!("Shared tree '{}' with {} as {}", tree, member, role.as_str());
        Ok(())
    }

    async fn outcome_add(&self, tree: &str) -> CmdResult {
        let session = self.session(tree).await?;
        let result = session.coordinator().create_outcome(&session.tree().id).await;
        session.teardown().await;
        println!("Created outcome {}", result.map_err(|e| e.to_string())?);
        Ok(())
    }

    async fn node_add_child(&self, tree: &str, parent: &str, experiment: bool) -> CmdResult {
        let parent = NodeId::from(parent);
        let session = self.session(tree).await?;
        let result = if experiment {
            session.coordinator().create_experiment(&parent, None).await
        } else {
            session.coordinator().create_child(&parent, None).await
        };
        session.teardown().await;
        let id = result.map_err(|e| e.to_string())?;
        println!("Created {} under {}", id, parent);
        Ok(())
    }

    async fn node_connect(&self, tree: &str, source: &str, target: &str) -> CmdResult {
        let (source, target) = (NodeId::from(source), NodeId::from(target));
        let session = self.session(tree).await?;
        let result = session.coordinator().connect(&source, &target).await;
        session.teardown().await;
        result.map_err(|e| e.to_string())?;
        println!("Connected {} -> {}", source, target);
        Ok(())
    }

    async fn node_edit(&self, tree: &str, node: &str, field: &str, value: &str) -> CmdResult {
        let node = NodeId::from(node);
        let session = self.session(tree).await?;
        let result = session
            .coordinator()
            .edit_field(&node, field, parse_value(value))
            .await;
        session.teardown().await;
        result.map_err(|e| e.to_string())?;
        println!("Updated {}.{}", node, field);
        Ok(())
    }

    async fn node_delete(&self, tree: &str, node: &str) -> CmdResult {
        let node = NodeId::from(node);
        let session = self.session(tree).await?;
        let result = session.coordinator().delete(&node).await;
        session.teardown().await;
        result.map_err(|e| e.to_string())?;
        println!("Deleted {}", node);
        Ok(())
    }

    async fn node_info(&self, tree: &str, kind: &str, node: &str) -> CmdResult {
        let kind = NodeKind::parse(kind).ok_or_else(|| format!("unknown node kind '{}'", kind))?;
        let access = check_node_access(
            self.store.as_ref(),
            &NodeId::from(tree),
            kind,
            &NodeId::from(node),
            &self.user,
            self.config.max_chain_depth,
        )
        .await
        .map_err(|e| e.to_string())?;

        let path: Vec<&str> = access.breadcrumb.iter().map(|c| c.title.as_str()).collect();
        println!("{} {} ({})", access.node.kind(), access.node.title(), access.node.id());
        println!("  path: {}", path.join(" > "));
        println!("  role: {}", access.role.as_str());
        if !access.ancestor_chain_valid {
            println!("  warning: node is not reachable from this tree");
        }
        for sub in &access.sub_solutions {
            println!("  sub-solution: {} ({})", sub.title, sub.id);
        }
        Ok(())
    }

    async fn vote(&self, tree: &str, node: &str, value: u8) -> CmdResult {
        let node = NodeId::from(node);
        let session = self.session(tree).await?;
        let result = session.vote(&node, value).await;
        session.teardown().await;
        match result.map_err(|e| e.to_string())? {
            VoteOutcome::Cast => println!("Voted {} on {}", value, node),
            VoteOutcome::Changed { previous } => {
                println!("Changed vote on {} from {} to {}", node, previous, value)
            }
            VoteOutcome::Removed => println!("Removed vote on {}", node),
        }
        Ok(())
    }

    async fn show(&self, tree: &str) -> CmdResult {
        let session = self.session(tree).await?;
        let name = session.tree().name.clone();
        let rows = session.list_rows();
        session.teardown().await;

        println!("{}", name);
        for row in rows {
            let mut line = format!("{}{} {}", "  ".repeat(row.indent + 1), row.kind, row.title);
            if let Some(score) = row.ice_score {
                line.push_str(&format!("  ICE {}", score));
            }
            if let Some(votes) = row.vote_count.filter(|v| *v > 0) {
                line.push_str(&format!("  votes {}", votes));
            }
            if let Some(status) = row.status {
                line.push_str(&format!("  [{:?}]", status));
            }
            if row.hidden_children > 0 {
                line.push_str(&format!("  (+{} more)", row.hidden_children));
            }
            println!("{}", line);
        }
        Ok(())
    }

    async fn timeline(&self, tree: &str, group_by: GroupBy) -> CmdResult {
        let session = self.session(tree).await?;
        let timeline = session.timeline(group_by);
        session.teardown().await;

        if timeline.is_empty() {
            println!("Nothing dated yet.");
            return Ok(());
        }
        for group in &timeline.groups {
            println!("{} {}", group.kind, group.title);
            for item in &group.items {
                let end = item.end_date.map(|d| format!(" to {}", d)).unwrap_or_default();
                println!(
                    "  {:>5.1}%  {}{}  {} {}",
                    timeline.position_percent(item.date),
                    item.date,
                    end,
                    item.kind,
                    item.title
                );
            }
        }
        Ok(())
    }

    async fn graph(&self, tree: &str) -> CmdResult {
        let session = self.session(tree).await?;
        let graph = session.graph();
        session.teardown().await;
        let text = serde_json::to_string_pretty(&graph).map_err(|e| e.to_string())?;
        println!("{}", text);
        Ok(())
    }

    async fn export(&self, tree: &str, out: PathBuf) -> CmdResult {
        let session = self.session(tree).await?;
        let document = session.export();
        session.teardown().await;

        let path = out.join(export_file_name(&document.tree.name));
        let text = document.to_json_pretty().map_err(|e| e.to_string())?;
        std::fs::write(&path, text)
            .map_err(|e| format!("cannot write '{}': {}", path.display(), e))?;
        println!("Exported {} nodes to {}", document.nodes.len(), path.display());
        Ok(())
    }

    async fn activity(&self, tree: &str, limit: usize) -> CmdResult {
        let tree_id = NodeId::from(tree);
        open_tree(self.store.as_ref(), &tree_id, &self.user)
            .await
            .map_err(|e| e.to_string())?;
        let feed = recent_activity(self.store.as_ref(), &tree_id, limit)
            .await
            .map_err(|e| e.to_string())?;
        if feed.is_empty() {
            println!("No activity yet");
            return Ok(());
        }
        for item in feed {
            let when = item
                .entry
                .created_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("{:<16}  {} {}", when, item.actor, item.label);
        }
        Ok(())
    }

    async fn profile(&self, name: Option<String>, email: Option<String>) -> CmdResult {
        let profile = UserProfile {
            id: self.user.clone(),
            name,
            email,
        };
        save_profile(self.store.as_ref(), &profile)
            .await
            .map_err(|e| e.to_string())?;
        println!(
            "Profile saved for {} ({})",
            self.user,
            profile.display_name().unwrap_or("no name")
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let store = match open_store(cli.db) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let app = App {
        store,
        config,
        user: cli.user,
    };

    let result = match cli.command {
        Commands::Tree { action } => match action {
            TreeAction::Create {
                name,
                description,
                public,
            } => app.tree_create(&name, description, public).await,
            TreeAction::List => app.tree_list().await,
            TreeAction::Delete { tree } => app.tree_delete(&tree).await,
            TreeAction::Share { tree, member, role } => app.tree_share(&tree, &member, &role).await,
        },
        Commands::Outcome { action } => match action {
            OutcomeAction::Add { tree } => app.outcome_add(&tree).await,
        },
        Commands::Node { action } => match action {
            NodeAction::AddChild {
                tree,
                parent,
                experiment,
            } => app.node_add_child(&tree, &parent, experiment).await,
            NodeAction::Connect {
                tree,
                source,
                target,
            } => app.node_connect(&tree, &source, &target).await,
            NodeAction::Edit {
                tree,
                node,
                field,
                value,
            } => app.node_edit(&tree, &node, &field, &value).await,
            NodeAction::Delete { tree, node } => app.node_delete(&tree, &node).await,
            NodeAction::Info { tree, kind, node } => app.node_info(&tree, &kind, &node).await,
        },
        Commands::Vote { tree, node, value } => app.vote(&tree, &node, value).await,
        Commands::Show { tree } => app.show(&tree).await,
        Commands::Timeline { tree, group_by } => app.timeline(&tree, group_by).await,
        Commands::Graph { tree } => app.graph(&tree).await,
        Commands::Export { tree, out } => app.export(&tree, out).await,
        Commands::Activity { tree, limit } => app.activity(&tree, limit).await,
        Commands::Profile { name, email } => app.profile(name, email).await,
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
