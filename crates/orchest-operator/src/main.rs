//! Orchest Kubernetes Operator
//!
//! This operator manages OrchestCluster custom resources in Kubernetes,
//! deploying, pausing and upgrading the components of an Orchest cluster.

use anyhow::{Context, Result};
use clap::Parser;
use kube::{Client, CustomResourceExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use orchest_operator::controller;
use orchest_operator::crd::OrchestCluster;
use orchest_operator::reconciler::ReconcilerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Orchest Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "orchest-operator")]
#[command(about = "Kubernetes operator for Orchest clusters")]
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

    /// Milliseconds between two readiness checks of a component
    #[arg(long, env = "READINESS_POLL_INTERVAL_MS", default_value = "1000")]
    readiness_poll_interval_ms: u64,

    /// Readiness checks per component before the reconcile fails
    #[arg(long, env = "READINESS_MAX_RETRIES", default_value = "30")]
    readiness_max_retries: u32,

    /// Seconds between periodic reconciliations of a healthy cluster
    #[arg(long, env = "REQUEUE_INTERVAL_SECS", default_value = "300")]
    requeue_interval_secs: u64,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn watch_scope(&self) -> &str {
        if self.namespace.is_empty() {
            "all"
        } else {
            &self.namespace
        }
    }

    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_millis(self.readiness_poll_interval_ms),
            max_retries: self.readiness_max_retries.max(1),
            requeue_interval: Duration::from_secs(self.requeue_interval_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        let crd = serde_yaml::to_string(&OrchestCluster::crd())?;
        println!("{}", crd);
        return Ok(());
    }

    init_logging(&args);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %args.watch_scope(),
        "Starting Orchest Kubernetes Operator"
    );

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(address = %args.metrics_addr, "Serving metrics");

    let ready = Arc::new(AtomicBool::new(false));
    tokio::spawn(serve_health(args.health_addr, ready.clone()));

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    ready.store(true, Ordering::Relaxed);

    let config = args.reconciler_config();
    let namespace = (!args.namespace.is_empty()).then(|| args.namespace.clone());

    controller::run_controller(client, namespace, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// `RUST_LOG` wins over `--log-level` when set
fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_string()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Answer probes with 200 once the API client is up, 503 before
async fn serve_health(addr: SocketAddr, ready: Arc<AtomicBool>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %addr, error = %e, "Failed to bind health server");
            return;
        }
    };
    info!(address = %addr, "Serving health probes");

    while let Ok((mut socket, _)) = listener.accept().await {
        let response: &[u8] = if ready.load(Ordering::Relaxed) {
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK"
        } else {
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n"
        };
        tokio::spawn(async move {
            let _ = socket.write_all(response).await;
        });
    }
}
