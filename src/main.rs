use std::net::SocketAddr;
use std::sync::Arc;

use alb_ingress_controller::controller::{
    self, health::parse_endpoint, AlbController, Collaborators, ControllerArgs, HealthMonitor,
    HttpProbe, KubeApiProbe, KubeEventRecorder, KubeEventSource,
};
use alb_ingress_controller::ingress::DefaultAnnotationInterpreter;
use alb_ingress_controller::provider::DryRunProvider;
use alb_ingress_controller::Error;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    controller: ControllerArgs,

    /// Address the REST API listens on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Extra connectivity checks reported by /status, as NAME=URL
    #[arg(
        long = "health-endpoint",
        env = "HEALTH_ENDPOINTS",
        value_delimiter = ',',
        value_parser = parse_endpoint
    )]
    health_endpoints: Vec<(String, String)>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Region recorded on provisioned load balancers
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("ALB Ingress Controller v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).init(),
    }
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting ALB Ingress Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = args.controller.validate()?;
    info!(
        cluster = %config.cluster_name,
        prefix = %config.alb_name_prefix,
        "Controller configuration validated"
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let watches = KubeEventSource::spawn(client.clone(), &config.restriction.namespace);
    watches.source.wait_until_ready().await?;
    info!("Resource caches synced");

    let mut health =
        HealthMonitor::new().with_check("kubernetes", Arc::new(KubeApiProbe::new(client.clone())));
    for (name, url) in args.health_endpoints {
        health = health.with_check(name, Arc::new(HttpProbe::new(url)?));
    }

    let collaborators = Collaborators {
        source: watches.source.clone(),
        reconciler: Arc::new(DryRunProvider::new(args.region)),
        interpreter: Arc::new(DefaultAnnotationInterpreter::new(
            config.restriction.clone(),
        )),
        events: Arc::new(KubeEventRecorder::new(client.clone())),
        health,
    };

    let controller = Arc::new(AlbController::new(config, collaborators));
    let running = controller.clone().start().await;

    #[cfg(feature = "rest-api")]
    let server = {
        let controller = controller.clone();
        let addr = args.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = alb_ingress_controller::rest_api::run_server(controller, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        })
    };

    let driver = tokio::spawn(controller::watch::run_event_driver(
        controller.clone(),
        watches.trigger.clone(),
    ));
    let statuses = tokio::spawn(controller::watch::run_status_publisher(
        controller,
        watches.source.clone(),
        client,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    driver.abort();
    statuses.abort();
    #[cfg(feature = "rest-api")]
    server.abort();
    running.shutdown();
    for task in watches.tasks {
        task.abort();
    }

    Ok(())
}
