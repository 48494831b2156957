use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use buildfarm::checkout::{GitCheckout, LocalCheckout, SourceCheckout};
use buildfarm::config::{NodeConfig, PeerConfig};
use buildfarm::election::{ElectionNode, ElectionStrategy, MajorityElection, TyrantElection};
use buildfarm::model::Project;
use buildfarm::node::WorkerNode;
use buildfarm::notify::LogNotifier;
use buildfarm::shutdown::install_shutdown_handler;
use buildfarm::store::sqlite::SqliteStore;
use buildfarm::store::EntityStore;
use buildfarm::worker::BuildTool;

#[derive(Parser, Debug)]
#[command(name = "buildfarm")]
#[command(version)]
#[command(about = "A distributed continuous-build farm")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a build farm worker node
    Server(ServerArgs),

    /// Ask for a build of a project on the next leader cycle
    RequestBuild {
        #[command(flatten)]
        store: StoreArgs,

        /// Project name
        project: String,
    },

    /// Show the buckets of a project's last build
    Status {
        #[command(flatten)]
        store: StoreArgs,

        /// Project name
        project: String,

        /// Output format
        #[arg(long, short = 'o', value_enum, default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Path to the SQLite database shared by all nodes
    #[arg(long, default_value = "buildfarm.db")]
    db: PathBuf,
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Node ID (unique within the election group)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// URI other nodes reach this node under (default: http://127.0.0.1:<port>)
    #[arg(long)]
    advertise_uri: Option<String>,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Election group
    #[arg(long, default_value = "buildfarm")]
    group: String,

    /// Take leadership on startup and keep it
    #[arg(long)]
    tyrant: bool,

    /// JSON file with project definitions to register on startup
    #[arg(long)]
    projects: Option<PathBuf>,

    /// Directory holding the project checkouts
    #[arg(long, default_value = "checkouts")]
    checkout_root: PathBuf,

    /// Use plain working directories instead of git checkouts
    #[arg(long)]
    local_checkouts: bool,

    /// Run tasks as shell snippets instead of rake tasks
    #[arg(long)]
    shell: bool,

    /// Address receiving system error reports
    #[arg(long)]
    admin_email: Option<String>,

    /// Seconds between log fragment uploads of a running task
    #[arg(long, default_value = "10")]
    log_polling_secs: u64,
}

#[derive(Serialize)]
struct BucketOutput {
    id: i64,
    name: String,
    status: String,
    worker_uri: Option<String>,
    dispatch_count: u32,
}

#[derive(Serialize)]
struct StatusOutput {
    project: String,
    build: Option<i64>,
    revision: Option<String>,
    finished: bool,
    last_system_error: Option<String>,
    buckets: Vec<BucketOutput>,
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let node_id: u64 = parts[0].parse().ok()?;
                let addr = format!("{}:{}", parts[1], parts[2]);
                Some(PeerConfig { node_id, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                None
            }
        })
        .collect()
}

fn load_projects(path: &Path) -> Result<Vec<Project>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("reading {}: {}", path.display(), e))?;
    let projects: Vec<Project> = serde_json::from_str(&content)
        .map_err(|e| format!("parsing {}: {}", path.display(), e))?;
    Ok(projects)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let advertise_uri = args
        .advertise_uri
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", args.port));

    let mut config = NodeConfig::new(args.node_id, listen_addr)
        .with_group(args.group)
        .with_build_tool(if args.shell {
            BuildTool::shell()
        } else {
            BuildTool::default()
        });
    config.peers = parse_peers(&args.peers);
    config.advertise_uri = Some(advertise_uri);
    config.tyrant = args.tyrant;
    config.admin_email = args.admin_email;
    config.checkout_root = args.checkout_root;
    config.log_polling_interval_ms = args.log_polling_secs * 1_000;

    let store: Arc<dyn EntityStore> = Arc::new(SqliteStore::open(&args.store.db)?);
    if let Some(path) = &args.projects {
        for project in load_projects(path)? {
            let project = store.register_project(&project)?;
            tracing::info!(project = %project.name, "Registered project");
        }
    }

    let checkout: Arc<dyn SourceCheckout> = if args.local_checkouts {
        Arc::new(LocalCheckout::new(&config.checkout_root))
    } else {
        Arc::new(GitCheckout::new(&config.checkout_root))
    };

    let election_node = Arc::new(ElectionNode::new(config.clone()));
    let election: Arc<dyn ElectionStrategy> = if config.tyrant {
        Arc::new(TyrantElection::with_lease(
            election_node,
            std::time::Duration::from_secs(config.tyrant_lease_secs),
        ))
    } else {
        Arc::new(MajorityElection::new(election_node))
    };

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        uri = %config.uri(),
        group = %config.group,
        tyrant = config.tyrant,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting buildfarm node"
    );

    let node = Arc::new(WorkerNode::new(
        config,
        store,
        checkout,
        Arc::new(LogNotifier),
        election,
    ));
    node.run(install_shutdown_handler()).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn handle_request_build(store: &dyn EntityStore, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut project = store.project(name)?;
    project.build_requested = true;
    store.save_project(&project)?;
    println!("Build of {} requested", name);
    Ok(())
}

fn handle_status(
    store: &dyn EntityStore,
    name: &str,
    output_format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let project = store.project(name)?;
    let build = store.last_build(name)?;
    let buckets = match &build {
        Some(build) => store.buckets(build.id)?,
        None => Vec::new(),
    };

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                project: project.name,
                build: build.as_ref().map(|b| b.number),
                revision: build.as_ref().map(|b| b.revision.clone()),
                finished: build.as_ref().is_some_and(|b| b.finished_at.is_some()),
                last_system_error: project.last_system_error,
                buckets: buckets
                    .into_iter()
                    .map(|b| BucketOutput {
                        id: b.id,
                        status: b.status.to_string(),
                        name: b.name,
                        worker_uri: b.worker_uri,
                        dispatch_count: b.dispatch_count,
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Project {}", project.name);
            println!("{}", "=".repeat(40));
            match &build {
                Some(build) => {
                    let state = if build.finished_at.is_some() { "finished" } else { "running" };
                    println!("Build:    #{} ({})", build.number, state);
                    println!("Revision: {}", build.revision);
                }
                None => println!("No builds yet"),
            }
            if let Some(error) = &project.last_system_error {
                println!("Last system error:\n{}", error);
            }
            if !buckets.is_empty() {
                println!();
                println!("{:<8} {:<30} {:<18} WORKER", "ID", "BUCKET", "STATUS");
                println!("{}", "-".repeat(80));
                for bucket in buckets {
                    println!(
                        "{:<8} {:<30} {:<18} {}",
                        bucket.id,
                        bucket.name,
                        bucket.status.to_string(),
                        bucket.worker_uri.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::RequestBuild { store, project } => {
            let store = SqliteStore::open(&store.db)?;
            handle_request_build(&store, &project)?;
        }
        Commands::Status {
            store,
            project,
            output,
        } => {
            let store = SqliteStore::open(&store.db)?;
            handle_status(&store, &project, output)?;
        }
    }

    Ok(())
}
