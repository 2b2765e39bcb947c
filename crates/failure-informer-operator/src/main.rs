//! Failure Informer Kubernetes Operator
//!
//! Correlates warning pod events with Notifier resources and provisions
//! FailureInformer and AppScaler workloads.

use anyhow::{Context, Result};
use clap::Parser;
use failure_informer_operator::config::OperatorConfig;
use failure_informer_operator::controller;
use failure_informer_operator::crd::{AppScaler, FailureInformer, Notifier};
use failure_informer_operator::dispatch::LogNotificationSink;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Failure Informer Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "failure-informer-operator")]
#[command(about = "Kubernetes operator that reports pod failures to notifiers")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Delay before retrying after a write conflict, in milliseconds
    #[arg(long, env = "CONFLICT_REQUEUE_MS", default_value = "500")]
    conflict_requeue_ms: u64,

    /// Delay before re-checking an owner that is not settled, in seconds
    #[arg(long, env = "SETTLE_REQUEUE_SECS", default_value = "10")]
    settle_requeue_secs: u64,

    /// First error backoff step, in seconds
    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value = "30")]
    error_requeue_secs: u64,

    /// Largest error backoff step, in seconds
    #[arg(long, env = "MAX_ERROR_REQUEUE_SECS", default_value = "600")]
    max_error_requeue_secs: u64,

    /// How long correlated event occurrences are remembered, in seconds
    #[arg(long, env = "LEDGER_RETENTION_SECS", default_value = "3600")]
    ledger_retention_secs: u64,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            conflict_requeue: Duration::from_millis(self.conflict_requeue_ms),
            settle_requeue: Duration::from_secs(self.settle_requeue_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            max_error_requeue: Duration::from_secs(self.max_error_requeue_secs),
            ledger_retention: Duration::from_secs(self.ledger_retention_secs),
            ..Default::default()
        }
        .with_namespace(self.namespace.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print_crds()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    config.validate().context("Invalid operator configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting Failure Informer Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    tokio::select! {
        result = controller::run(client, config, Arc::new(LogNotificationSink)) => {
            result.context("Controllers failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print every CRD as a multi-document YAML stream
fn print_crds() -> Result<()> {
    use kube::CustomResourceExt;

    let crds = [Notifier::crd(), FailureInformer::crd(), AppScaler::crd()];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
