use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden::config::{LoggingConfig, WardenConfig};
use warden::ratelimit::{
    AdmissionRequest, ChannelSink, DecisionCoordinator, FilePolicySource, InflightGauge,
    LoadFeedback, MemoryStore, PolicyCache, PolicySnapshot, PolicySource, StaticPolicySource,
    ViolationEvent,
};
use warden::service::{LineServer, WardenService};

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Rate limiting decision engine")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Serve JSON-lines commands on stdin, replies on stdout
    Serve {
        /// Policy file, overrides `policies.path`
        #[arg(short, long)]
        policies: Option<PathBuf>,
    },
    /// Run a single admission check and print the verdict
    Check {
        #[arg(short, long)]
        policies: Option<PathBuf>,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Validate a policy file
    Validate { file: PathBuf },
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    ip: Option<IpAddr>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    resource: Option<String>,
}

impl From<RequestArgs> for AdmissionRequest {
    fn from(args: RequestArgs) -> Self {
        let mut request = AdmissionRequest::new();
        request.identity.user_id = args.user;
        request.identity.ip = args.ip;
        request.endpoint = args.endpoint;
        request.resource = args.resource;
        request
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = WardenConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing
    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Warden");

    match cli.command {
        CliCommand::Serve { policies } => {
            if policies.is_some() {
                config.policies.path = policies;
            }
            serve(config).await
        }
        CliCommand::Check { policies, request } => {
            if policies.is_some() {
                config.policies.path = policies;
            }
            check(config, request.into()).await
        }
        CliCommand::Validate { file } => validate(file),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Everything the binary wires around the coordinator.
struct Runtime {
    coordinator: Arc<DecisionCoordinator<MemoryStore>>,
    feedback: Arc<LoadFeedback>,
    gauge: Option<Arc<InflightGauge>>,
    violations: ReceiverStream<ViolationEvent>,
}

async fn build_runtime(config: &WardenConfig) -> anyhow::Result<Runtime> {
    // Policy feed
    let source: Arc<dyn PolicySource> = match &config.policies.path {
        Some(path) => Arc::new(FilePolicySource::new(path)),
        None => {
            warn!("No policy file configured, every request will be admitted");
            Arc::new(StaticPolicySource::new(PolicySnapshot::empty()))
        }
    };
    let cache = Arc::new(
        PolicyCache::new(source, config.max_staleness()).with_refresh_timeout(config.refresh_timeout()),
    );
    cache.prime().await.context("Failed to load policies")?;

    // Load feedback and violation delivery
    let feedback = Arc::new(LoadFeedback::new(config.feedback.smoothing));
    let (sink, violations) = ChannelSink::new(config.violations.channel_capacity);

    let mut coordinator = DecisionCoordinator::new(
        cache,
        Arc::new(MemoryStore::new()),
        config.coordinator_settings(),
    )
    .with_load_signal(feedback.clone())
    .with_violation_sink(Arc::new(sink));

    let gauge = (config.feedback.inflight_capacity > 0)
        .then(|| Arc::new(InflightGauge::new(config.feedback.inflight_capacity)));
    if let Some(gauge) = &gauge {
        coordinator = coordinator.with_inflight_gauge(gauge.clone());
    }

    info!(
        fail_mode = ?config.engine.fail_mode,
        instance_id = %config.engine.instance_id,
        "Decision coordinator initialized"
    );

    Ok(Runtime {
        coordinator: Arc::new(coordinator),
        feedback,
        gauge,
        violations,
    })
}

fn spawn_violation_logger(mut violations: ReceiverStream<ViolationEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = violations.next().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target: "warden::violation", event = %json, "Violation"),
                Err(e) => error!(error = %e, "Failed to encode violation event"),
            }
        }
    })
}

async fn serve(config: WardenConfig) -> anyhow::Result<()> {
    let runtime = build_runtime(&config).await?;

    // Start background tasks
    let mut tasks = vec![
        runtime.coordinator.spawn_sweeper(config.sweep_interval()),
        spawn_violation_logger(runtime.violations),
    ];
    if let Some(gauge) = runtime.gauge {
        tasks.push(runtime.feedback.clone().spawn_poller(gauge, config.poll_interval()));
    }

    // Serve stdin until EOF or a shutdown signal
    let service = WardenService::new(runtime.coordinator).with_load_feedback(runtime.feedback);
    let server = LineServer::new(Arc::new(service));

    server
        .serve_with_shutdown(
            tokio::io::BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_signal(),
        )
        .await?;

    // Stop background tasks
    for task in tasks {
        task.abort();
    }
    info!("Warden stopped");
    Ok(())
}

async fn check(config: WardenConfig, request: AdmissionRequest) -> anyhow::Result<()> {
    let runtime = build_runtime(&config).await?;
    let verdict = runtime.coordinator.admit(&request, None).await;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

fn validate(file: PathBuf) -> anyhow::Result<()> {
    let snapshot = PolicySnapshot::from_file(&file)
        .with_context(|| format!("Invalid policy file {}", file.display()))?;
    for policy in snapshot.policies() {
        println!(
            "{}\t{}\t{}\tlimit={}\tpriority={}",
            policy.id(),
            policy.scope().as_str(),
            policy.algorithm().name(),
            policy.limit(),
            policy.priority()
        );
    }
    info!(policies = snapshot.len(), "Policy file is valid");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
