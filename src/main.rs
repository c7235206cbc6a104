use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gang_scheduler::config::{ControllerConfig, DEFAULT_QUEUE};
use gang_scheduler::manager::Manager;
use gang_scheduler::shutdown;
use gang_scheduler::store::{InMemoryStore, ObjectStore};

#[derive(Parser, Debug)]
#[command(name = "gang-scheduler")]
#[command(version)]
#[command(about = "Gang scheduler for batch jobs with per-queue priority admission")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduling control loops
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only schedule jobs in this namespace (all namespaces when omitted)
    #[arg(long)]
    namespace: Option<String>,

    /// Queue for jobs that do not name one
    #[arg(long, default_value = DEFAULT_QUEUE)]
    default_queue: String,

    /// Number of task launch workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

async fn run_scheduler(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ControllerConfig::new()
        .with_default_queue(args.default_queue)
        .with_workers(args.workers);
    if let Some(namespace) = args.namespace {
        config = config.with_namespace(namespace);
    }
    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config = config.with_dashboard(addr);
    }

    tracing::info!(
        namespace = ?config.watch_namespace,
        default_queue = %config.default_queue,
        workers = config.launch.workers,
        dashboard_addr = ?config.dashboard_addr,
        "Starting gang scheduler"
    );

    let token = CancellationToken::new();
    shutdown::cancel_on_signal(token.clone());

    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
    let manager = Manager::new(store, config, token);
    manager.run().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_scheduler(run_args).await?;
        }
    }

    Ok(())
}
