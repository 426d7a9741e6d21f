use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cluster_coord::config::{CoordinationConfig, StoreConfig};
use cluster_coord::coordinator::{CoordinationStrategy, RdbmsCoordinationStrategy};
use cluster_coord::dashboard::{run_dashboard, DashboardState};
use cluster_coord::event::MemberEventListener;
use cluster_coord::node::{NodeDetail, PropertiesMap};
use cluster_coord::shutdown::install_shutdown_handler;
use cluster_coord::storage::RdbmsStore;

#[derive(Parser, Debug)]
#[command(name = "cluster-coord")]
#[command(version)]
#[command(about = "Cluster membership and coordinator election over a shared database")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Join a group and stay in it until interrupted
    Node(NodeArgs),

    /// List the members of a group
    Members {
        #[command(flatten)]
        store: StoreArgs,

        /// Group to inspect
        #[arg(long, default_value = "default")]
        group_id: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Database URL shared by every member of the group
    #[arg(long, default_value = "sqlite://cluster-coord.db")]
    database_url: String,

    /// Connections kept in the pool
    #[arg(long, default_value = "5")]
    max_connections: u32,
}

impl StoreArgs {
    fn to_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.max_connections,
            ..StoreConfig::default()
        }
    }
}

#[derive(Parser, Debug)]
struct NodeArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Node ID (random UUID when omitted)
    #[arg(long)]
    node_id: Option<String>,

    /// Group to join
    #[arg(long, default_value = "default")]
    group_id: String,

    /// Property published with this node, as key=value (repeatable).
    /// Values that parse as JSON are stored as JSON, anything else as a string.
    #[arg(long = "property", short = 'p')]
    properties: Vec<String>,

    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Heartbeat age after which a peer is declared dead
    #[arg(long, default_value = "4000")]
    failure_threshold_ms: u64,

    #[arg(long, default_value = "2000")]
    election_interval_ms: u64,

    #[arg(long, default_value = "1000")]
    listener_poll_interval_ms: u64,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct MembersOutput {
    group_id: String,
    coordinator: Option<String>,
    members: Vec<NodeDetail>,
}

// =============================================================================
// Node
// =============================================================================

/// Writes every membership event to the log.
struct LoggingListener {
    group_id: String,
}

impl MemberEventListener for LoggingListener {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn member_added(&self, node: &NodeDetail) {
        tracing::info!(peer_id = %node.node_id, properties = ?node.properties, "Member added");
    }

    fn member_removed(&self, node: &NodeDetail) {
        tracing::info!(peer_id = %node.node_id, "Member removed");
    }

    fn coordinator_changed(&self, node: &NodeDetail) {
        tracing::info!(peer_id = %node.node_id, "Coordinator changed");
    }
}

fn parse_properties(raw: &[String]) -> Result<PropertiesMap, String> {
    let mut properties = PropertiesMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("property '{}' is not key=value", entry))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        properties.insert(key.trim().to_string(), value);
    }
    Ok(properties)
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let node_id = args
        .node_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let properties = parse_properties(&args.properties)?;

    let config = CoordinationConfig::new(node_id, args.group_id)
        .with_heartbeat_interval_ms(args.heartbeat_interval_ms)
        .with_failure_threshold_ms(args.failure_threshold_ms)
        .with_election_interval_ms(args.election_interval_ms)
        .with_listener_poll_interval_ms(args.listener_poll_interval_ms);

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let store = RdbmsStore::connect(&args.store.to_config()).await?;
    let strategy = Arc::new(RdbmsCoordinationStrategy::new(config, store.clone())?);

    tracing::info!(
        node_id = %strategy.node_id(),
        group_id = %strategy.group_id(),
        database_url = %args.store.database_url,
        dashboard_addr = ?dashboard_addr,
        "Starting cluster-coord node"
    );

    strategy
        .register_event_listener(Arc::new(LoggingListener {
            group_id: strategy.group_id().to_string(),
        }))
        .await;

    let shutdown = install_shutdown_handler()?;
    strategy.join_group_with_properties(properties).await?;

    if let Some(addr) = dashboard_addr {
        let state = DashboardState {
            strategy: strategy.clone(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    shutdown.cancelled().await;

    strategy.stop().await?;
    store.close().await;
    Ok(())
}

// =============================================================================
// Members
// =============================================================================

async fn run_members(
    store_args: StoreArgs,
    group_id: String,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = RdbmsStore::connect(&store_args.to_config()).await?;
    let members = store.get_all_node_details(&group_id).await?;
    let coordinator = store
        .get_coordinator_lock(&group_id)
        .await?
        .map(|lock| lock.coordinator_node_id);
    store.close().await;

    match output {
        OutputFormat::Json => {
            let output = MembersOutput {
                group_id,
                coordinator,
                members,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            let now = chrono::Utc::now();
            println!("Group: {}", group_id);
            println!(
                "Coordinator: {}",
                coordinator.as_deref().unwrap_or("(none)")
            );
            println!();
            println!("{:<38} {:<12} {:<14} PROPERTIES", "NODE ID", "ROLE", "HEARTBEAT AGE");
            for member in &members {
                let role = if member.is_coordinator {
                    "coordinator"
                } else {
                    "member"
                };
                let age = member
                    .heartbeat_age(now)
                    .map(|a| format!("{}ms", a.num_milliseconds()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<12} {:<14} {}",
                    member.node_id,
                    role,
                    age,
                    serde_json::to_string(&member.properties)?
                );
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Node(node_args) => {
            run_node(node_args).await?;
        }
        Commands::Members {
            store,
            group_id,
            output,
        } => {
            run_members(store, group_id, output).await?;
        }
    }

    Ok(())
}
