use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use rgw_standalone_operator::config::ZoneJoinStrategy;
use rgw_standalone_operator::controller::{self, RetryPolicy};
use rgw_standalone_operator::crd::ObjectStore;
use rgw_standalone_operator::{telemetry, Error, OperatorConfig};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// List the ObjectStores the operator manages
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only watch ObjectStores in this namespace (all namespaces if unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// How a joining site runs `zone create`: exec or job
    #[arg(long, env = "ZONE_JOIN_STRATEGY")]
    zone_join_strategy: Option<ZoneJoinStrategy>,

    /// Restart the origin gateway after bootstrapping a realm
    #[arg(long, env = "RESTART_AFTER_BOOTSTRAP")]
    restart_after_bootstrap: Option<bool>,

    /// Timeout for a single remote admin command, in seconds
    #[arg(long, env = "EXEC_TIMEOUT_SECS")]
    exec_timeout_secs: Option<u64>,

    /// Number of times to check that the gateway pod is running
    #[arg(long, env = "POD_READY_RETRIES")]
    pod_ready_retries: Option<u32>,

    /// Seconds between gateway pod checks
    #[arg(long, env = "POD_READY_INTERVAL_SECS")]
    pod_ready_interval_secs: Option<u64>,

    /// Seconds between zone job status checks
    #[arg(long, env = "JOB_POLL_INTERVAL_SECS")]
    job_poll_interval_secs: Option<u64>,

    /// Give up waiting for the zone job after this many seconds
    #[arg(long, env = "JOB_TIMEOUT_SECS")]
    job_timeout_secs: Option<u64>,

    /// Service port for ObjectStores that do not set one
    #[arg(long, env = "DEFAULT_GATEWAY_PORT")]
    default_gateway_port: Option<i32>,

    /// PVC size for ObjectStores without a volumeClaimTemplate
    #[arg(long, env = "DEFAULT_VOLUME_SIZE")]
    default_volume_size: Option<String>,

    /// Requeue interval for Ready ObjectStores, in seconds
    #[arg(long, env = "RESYNC_INTERVAL_SECS")]
    resync_interval_secs: Option<u64>,
}

impl RunArgs {
    /// Defaults overridden by whatever was passed on the command line
    fn operator_config(&self) -> OperatorConfig {
        let mut config = OperatorConfig::default();

        if let Some(strategy) = self.zone_join_strategy {
            config.zone_join_strategy = strategy;
        }
        if let Some(restart) = self.restart_after_bootstrap {
            config.restart_after_bootstrap = restart;
        }
        if let Some(secs) = self.exec_timeout_secs {
            config.exec_timeout = Duration::from_secs(secs);
        }
        if self.pod_ready_retries.is_some() || self.pod_ready_interval_secs.is_some() {
            let default = config.pod_ready_policy;
            config.pod_ready_policy = RetryPolicy::attempts(
                self.pod_ready_retries
                    .unwrap_or(default.max_attempts.unwrap_or(1)),
                self.pod_ready_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default.interval),
            );
        }
        if self.job_poll_interval_secs.is_some() || self.job_timeout_secs.is_some() {
            let default = config.job_poll_policy;
            config.job_poll_policy = RetryPolicy::deadline(
                self.job_poll_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default.interval),
                self.job_timeout_secs
                    .map(Duration::from_secs)
                    .or(default.timeout)
                    .unwrap_or(Duration::from_secs(600)),
            );
        }
        if let Some(port) = self.default_gateway_port {
            config.default_gateway_port = port;
        }
        if let Some(size) = &self.default_volume_size {
            config.default_volume_size = size.clone();
        }
        if let Some(secs) = self.resync_interval_secs {
            config.resync_interval = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to list (all namespaces if unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("RGW Standalone Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<ObjectStore> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stores = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed ObjectStores: {}", stores.items.len());
    for store in &stores.items {
        let phase = store
            .status
            .as_ref()
            .map(|s| s.phase.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("Pending");
        println!(
            "  {}/{} role={} phase={}",
            store.namespace().unwrap_or_default(),
            store.name_any(),
            store.spec.site_role().as_str(),
            phase
        );
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json = matches!(format, LogFormat::Json);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true)));

    // Only enable OTEL if an endpoint is provided
    match telemetry::otlp_endpoint() {
        Some(endpoint) => match telemetry::init_telemetry(&endpoint) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized, exporting to {}", endpoint);
            }
            Err(e) => {
                registry.init();
                warn!("Failed to initialize OpenTelemetry tracing: {}", e);
            }
        },
        None => {
            registry.init();
            info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
        }
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting RGW Standalone Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = args.operator_config();
    config.validate()?;
    info!(
        zone_join_strategy = %config.zone_join_strategy,
        restart_after_bootstrap = config.restart_after_bootstrap,
        exec_timeout = ?config.exec_timeout,
        "Operator configuration loaded"
    );

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");
    match &args.watch_namespace {
        Some(ns) => info!("Watching ObjectStores in namespace {}", ns),
        None => info!("Watching ObjectStores in all namespaces"),
    }

    // Run the main controller loop
    let result = controller::run_controller(client, Arc::new(config), args.watch_namespace).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}
