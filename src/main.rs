use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ci_lite::config::{
    CiConfig, PoolConfig, RunnerConfig, SandboxConfig, StoreConfig, WorkerConfig,
};
use ci_lite::node::WorkerNode;
use ci_lite::pool::PoolController;
use ci_lite::scheduler::{Enqueuer, SourceFeed};
use ci_lite::shutdown::install_shutdown_handler;
use ci_lite::store::StoreClient;

#[derive(Parser, Debug)]
#[command(name = "ci-lite")]
#[command(version)]
#[command(about = "Scheduler-less CI: workers race to claim jobs from a shared document store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker: claim queued jobs and execute them
    Worker(WorkerArgs),

    /// Discover unprocessed patchsets and enqueue their jobs
    Poll {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        feed: FeedArgs,

        /// Job variants file
        #[arg(long, default_value = "ci-configs.json")]
        ci_config: PathBuf,

        /// Repeat every N seconds instead of running once
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Enqueue the jobs of one change/patchset
    Enqueue {
        #[command(flatten)]
        store: StoreArgs,

        /// Job variants file
        #[arg(long, default_value = "ci-configs.json")]
        ci_config: PathBuf,

        change_id: String,

        patchset: u32,
    },

    /// Record every advertised patchset as processed without building it
    MarkAllDone {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        feed: FeedArgs,
    },

    /// Worker machine pool management
    Pool {
        #[command(flatten)]
        pool: PoolArgs,

        #[command(subcommand)]
        command: PoolCommands,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Base URL of the document store
    #[arg(long, env = "CI_STORE_URL", default_value = "http://127.0.0.1:9000")]
    store_url: String,

    /// Token passed to the store as the `auth` query parameter
    #[arg(long, env = "CI_STORE_TOKEN", hide_env_values = true)]
    store_token: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "10")]
    request_timeout_secs: u64,
}

impl StoreArgs {
    fn client(&self) -> ci_lite::error::Result<StoreClient> {
        StoreClient::new(&StoreConfig {
            base_url: self.store_url.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            auth_token: self.store_token.clone(),
        })
    }
}

#[derive(Parser, Debug)]
struct FeedArgs {
    /// Root URL of the reviewed repository
    #[arg(long, env = "CI_REVIEW_REPO")]
    repo: String,
}

impl FeedArgs {
    fn feed(&self) -> ci_lite::error::Result<SourceFeed> {
        SourceFeed::new(
            SourceFeed::advertisement_url(&self.repo),
            Duration::from_secs(30),
        )
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Job variants file
    #[arg(long, default_value = "ci-configs.json")]
    ci_config: PathBuf,

    /// Ownership identity (defaults to the hostname)
    #[arg(long)]
    identity: Option<String>,

    /// Docker image jobs run in
    #[arg(long, default_value = "worker")]
    image: String,

    /// Local container name, reused across runs
    #[arg(long, default_value = "job")]
    container_name: String,

    /// Run jobs directly with `sh -c` instead of in Docker
    #[arg(long)]
    shell: bool,

    /// Hard timeout per job in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Minimum interval between log uploads in milliseconds
    #[arg(long, default_value = "1000")]
    flush_interval_ms: u64,

    /// Sleep between polls of an empty queue in seconds
    #[arg(long, default_value = "10")]
    idle_sleep_secs: u64,
}

// =============================================================================
// Pool Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PoolArgs {
    /// Compute API root
    #[arg(long, default_value = "https://www.googleapis.com/compute/v1")]
    api_base: String,

    #[arg(long, env = "CI_PROJECT")]
    project: String,

    #[arg(long, default_value = "us-central1-c")]
    zone: String,

    /// Name prefix identifying pool machines
    #[arg(long, default_value = "ci-worker-")]
    vm_prefix: String,

    /// Instance body used to create machines (JSON object)
    #[arg(long, default_value = "gce-vm-config.json")]
    instance_template: PathBuf,

    /// OAuth access token for the compute API
    #[arg(long, env = "CI_COMPUTE_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum PoolCommands {
    /// List pool machines
    List,
    /// Destroy every pool machine
    Destroy,
    /// Destroy every pool machine and create a fresh set
    Recreate {
        /// Number of machines to create
        #[arg(long, default_value = "2")]
        count: usize,
    },
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ci = CiConfig::load(&args.ci_config)?;
    let sandbox = if args.shell {
        SandboxConfig::Shell
    } else {
        SandboxConfig::Docker {
            image: args.image,
            container_name: args.container_name,
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
        }
    };
    let runner = RunnerConfig::default()
        .with_timeout(Duration::from_secs(args.timeout_secs))
        .with_flush_interval(Duration::from_millis(args.flush_interval_ms))
        .with_sandbox(sandbox);

    let mut config = match args.identity {
        Some(identity) => WorkerConfig::new(identity),
        None => WorkerConfig::default(),
    };
    config.idle_sleep = Duration::from_secs(args.idle_sleep_secs);
    config.runner = runner;

    tracing::info!(
        identity = %config.identity,
        store = %args.store.store_url,
        variants = ci.variants.len(),
        timeout_secs = args.timeout_secs,
        "Starting ci-lite worker"
    );

    let shutdown = install_shutdown_handler()?;
    let node = WorkerNode::new(args.store.client()?, config, ci);
    node.run(shutdown).await;
    Ok(())
}

async fn run_poll(
    store: StoreArgs,
    feed: FeedArgs,
    ci_config: PathBuf,
    interval_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let enqueuer = Enqueuer::new(store.client()?, CiConfig::load(&ci_config)?);
    let feed = feed.feed()?;

    let Some(interval_secs) = interval_secs else {
        let summary = enqueuer.poll_once(&feed).await?;
        for (change_id, patchset) in &summary.enqueued {
            println!("{} - {}", change_id, patchset);
        }
        if !summary.failed.is_empty() {
            return Err(format!("failed to enqueue: {}", summary.failed.join(", ")).into());
        }
        return Ok(());
    };

    let shutdown = install_shutdown_handler()?;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match enqueuer.poll_once(&feed).await {
            Ok(summary) => tracing::info!(
                enqueued = summary.enqueued.len(),
                failed = summary.failed.len(),
                "Poll finished"
            ),
            Err(e) => tracing::warn!(error = %e, "Poll failed"),
        }
    }
    Ok(())
}

async fn run_pool(args: PoolArgs, command: PoolCommands) -> Result<(), Box<dyn std::error::Error>> {
    let instance_template = match command {
        PoolCommands::Recreate { .. } => {
            let text = tokio::fs::read_to_string(&args.instance_template).await?;
            serde_json::from_str(&text)?
        }
        _ => serde_json::Value::Object(Default::default()),
    };
    let controller = PoolController::new(PoolConfig {
        api_base: args.api_base,
        project: args.project,
        zone: args.zone,
        vm_prefix: args.vm_prefix,
        instance_template,
        auth_token: args.access_token,
        ..PoolConfig::default()
    })?;

    match command {
        PoolCommands::List => {
            let machines = controller.list().await?;
            if machines.is_empty() {
                println!("No workers found.");
            } else {
                println!("{:<40} STATUS", "NAME");
                println!("{}", "-".repeat(55));
                for machine in machines {
                    println!("{:<40} {}", machine.name, machine.status);
                }
            }
        }
        PoolCommands::Destroy => {
            let destroyed = controller.destroy_all().await?;
            println!("Destroyed {} workers", destroyed.len());
        }
        PoolCommands::Recreate { count } => {
            let created = controller.recreate(count).await?;
            for name in created {
                println!("Created {}", name);
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
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Poll {
            store,
            feed,
            ci_config,
            interval_secs,
        } => run_poll(store, feed, ci_config, interval_secs).await?,
        Commands::Enqueue {
            store,
            ci_config,
            change_id,
            patchset,
        } => {
            let enqueuer = Enqueuer::new(store.client()?, CiConfig::load(&ci_config)?);
            for key in enqueuer.enqueue(&change_id, patchset).await? {
                println!("Queued {}", key);
            }
        }
        Commands::MarkAllDone { store, feed } => {
            let enqueuer = Enqueuer::new(store.client()?, CiConfig::default());
            let marked = enqueuer.mark_all_done(&feed.feed()?).await?;
            println!("Marked {} changes as processed", marked);
        }
        Commands::Pool { pool, command } => run_pool(pool, command).await?,
    }

    Ok(())
}
