//! CLI command definitions and dispatch.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use console::style;
use tracing::info;
use zephyr_api::AppState;
use zephyr_scheduler::{
    LogBus, Scheduler, SchedulerConfig, VmExecutorConfig, VmJobExecutor,
};
use zephyr_store::Store;
use zephyr_vm::{NetworkAllocator, NetworkAllocatorConfig, VmManager, VmManagerConfig};

use crate::config::{self, DEFAULT_PIPELINE_FILE, PIPELINE_TEMPLATE};
use crate::local;

#[derive(Subcommand)]
pub enum Commands {
    /// Scaffold a pipeline configuration in the current directory
    Init,

    /// Execute a pipeline locally, without microVMs
    Run {
        /// Path to the pipeline file
        #[arg(default_value = DEFAULT_PIPELINE_FILE)]
        path: PathBuf,
    },

    /// Start the scheduler and HTTP control surface
    Server(ServerArgs),

    /// Start the HTTP surface that the dashboard consumes
    Ui(ServerArgs),

    /// Trigger a run on a running server
    Trigger {
        /// Project name
        project: String,

        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:8990")]
        server: String,

        /// Branch recorded on the run
        #[arg(short, long)]
        branch: Option<String>,
    },
}

#[derive(clap::Args)]
pub struct ServerArgs {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8990")]
    pub listen: SocketAddr,

    /// Database file
    #[arg(long, default_value = "zephyr.db")]
    pub db: PathBuf,

    /// Directory containing project pipeline files
    #[arg(long, default_value = ".")]
    pub projects_root: PathBuf,

    /// Global cap on concurrently running jobs
    #[arg(long, default_value_t = 4)]
    pub max_concurrent: usize,

    /// Runtime directory for VM sockets and logs
    #[arg(long, default_value = "/var/run/zephyr")]
    pub runtime_dir: PathBuf,

    /// Kernel image used when runners do not name one
    #[arg(long, default_value = "/var/lib/zephyr/images/vmlinux")]
    pub kernel: PathBuf,

    /// Directory of rootfs images (`<image>.ext4`)
    #[arg(long, default_value = "/var/lib/zephyr/images")]
    pub rootfs_dir: PathBuf,

    /// Interface NAT egress goes out of; omit to disable NAT
    #[arg(long)]
    pub nat_interface: Option<String>,

    /// API key required on /api/v1 (optional)
    #[arg(long, env = "ZEPHYR_API_KEY")]
    pub api_key: Option<String>,

    /// Webhook HMAC secret (optional)
    #[arg(long, env = "ZEPHYR_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,
}

pub async fn dispatch(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Init => init(),
        Commands::Run { path } => run_local(path).await,
        Commands::Server(args) | Commands::Ui(args) => serve(args).await,
        Commands::Trigger {
            project,
            server,
            branch,
        } => trigger(project, server, branch).await,
    }
}

fn init() -> anyhow::Result<i32> {
    let path = PathBuf::from(DEFAULT_PIPELINE_FILE);
    if path.exists() {
        eprintln!("{} {} already exists", style("error:").red(), path.display());
        return Ok(1);
    }
    std::fs::write(&path, PIPELINE_TEMPLATE)?;
    println!("{} wrote {}", style("✓").green(), path.display());
    Ok(0)
}

async fn run_local(path: PathBuf) -> anyhow::Result<i32> {
    let definition = match config::load_pipeline(&path) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("{} {e}", style("error:").red());
            return Ok(1);
        }
    };

    println!(
        "{} pipeline '{}' ({} jobs)",
        style("→").cyan(),
        definition.name,
        definition.jobs.len()
    );
    let summary = local::run_pipeline(&definition).await?;
    Ok(if summary.failed() { 1 } else { 0 })
}

async fn serve(args: ServerArgs) -> anyhow::Result<i32> {
    let store = Store::open(&args.db).await?;
    let recovered = store.recover_orphans().await?;
    if recovered.failed_jobs > 0 {
        info!(
            failed_jobs = recovered.failed_jobs,
            requeued_runs = recovered.requeued_runs,
            "reconciled state from previous process"
        );
    }

    let bus = Arc::new(LogBus::new());
    let source = Arc::new(config::YamlPipelineSource::new(&args.projects_root));

    let network = Arc::new(NetworkAllocator::new(NetworkAllocatorConfig {
        external_interface: args.nat_interface.clone(),
        ..NetworkAllocatorConfig::default()
    }));
    let vms = Arc::new(VmManager::new(VmManagerConfig {
        runtime_dir: args.runtime_dir.clone(),
        ..VmManagerConfig::default()
    }));
    let executor = Arc::new(VmJobExecutor::new(
        VmExecutorConfig {
            runtime_dir: args.runtime_dir.clone(),
            kernel_image: args.kernel.clone(),
            rootfs_dir: args.rootfs_dir.clone(),
            workspace_dir: None,
            guest_workspace: "/workspace".to_string(),
            agent_ready_timeout: Duration::from_secs(30),
        },
        store.clone(),
        bus.clone(),
        network,
        vms,
    ));

    let (scheduler, handle) = Scheduler::new(
        store.clone(),
        source.clone(),
        executor,
        bus.clone(),
        SchedulerConfig {
            max_concurrent: args.max_concurrent,
            ..SchedulerConfig::default()
        },
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    let state = Arc::new(AppState::new(
        store.clone(),
        handle.clone(),
        bus,
        source,
        args.api_key,
        args.webhook_secret,
    ));
    let router = zephyr_api::create_router(state);

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, "server listening");

    tokio::select! {
        result = axum::serve(listener, router) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    handle.shutdown().await;
    let _ = scheduler_task.await;
    store.close().await;
    Ok(0)
}

async fn trigger(project: String, server: String, branch: Option<String>) -> anyhow::Result<i32> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{server}/api/v1/trigger"))
        .json(&serde_json::json!({
            "project": project,
            "branch": branch,
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        eprintln!(
            "{} trigger failed: {} {}",
            style("error:").red(),
            response.status(),
            response.text().await.unwrap_or_default()
        );
        return Ok(1);
    }

    let body: serde_json::Value = response.json().await?;
    println!(
        "{} run {}",
        style("✓").green(),
        body["id"].as_str().unwrap_or("?")
    );
    Ok(0)
}
