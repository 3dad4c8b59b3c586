//! BlockDevice Claim Operator
//!
//! Binds BlockDeviceClaims to discovered BlockDevices.
//!
//! ```text
//! ┌──────────────┐   watch    ┌──────────────┐   reconcile   ┌──────────────┐
//! │ Object store │──────────► │  Dispatcher  │─────────────► │  Reconciler  │
//! │ (k8s / mem)  │ ◄──────────┴──────────────┴───────────────┤              │
//! └──────────────┘          versioned writes                  └──────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockdevice_claim_operator::{
    ApiServer, ApiServerConfig, BlockDevice, BlockDeviceClaim, ClaimStoreRef, ControllerMetrics,
    DeviceStoreRef, Dispatcher, DispatcherConfig, KubeStore, MemoryStore, Reconciler,
    ReconcilerConfig, SeedManifest,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// BlockDevice Claim Operator - binds BlockDeviceClaims to BlockDevices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Run in standalone mode (in-memory store, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Only watch claims and devices in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Seconds before re-checking a claim no device could satisfy
    #[arg(long, env = "RETRY_INTERVAL", default_value = "10")]
    retry_interval_secs: u64,

    /// Seconds between full claim resyncs
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "300")]
    resync_interval_secs: u64,

    /// Upper bound in seconds for failure backoff
    #[arg(long, env = "BACKOFF_MAX", default_value = "60")]
    backoff_max_secs: u64,

    /// YAML manifest of devices and claims to load in standalone mode
    #[arg(long, env = "SEED_FILE")]
    seed_file: Option<String>,

    /// Print the CRD manifests and exit
    #[arg(long)]
    print_crds: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", serde_yaml::to_string(&BlockDevice::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&BlockDeviceClaim::crd())?);
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting BlockDevice Claim Operator");
    info!("  Version: {}", blockdevice_claim_operator::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Workers: {}", args.workers);
    info!("  Standalone mode: {}", args.standalone);

    let (claims, devices) = build_stores(&args).await?;

    let registry = Registry::new();
    let metrics = Arc::new(ControllerMetrics::new(&registry)?);

    let reconciler = Arc::new(Reconciler::new(
        claims.clone(),
        devices.clone(),
        ReconcilerConfig {
            retry_interval: Duration::from_secs(args.retry_interval_secs),
        },
        metrics,
    ));
    let dispatcher_config = DispatcherConfig {
        workers: args.workers,
        resync_interval: Duration::from_secs(args.resync_interval_secs),
        backoff_max: Duration::from_secs(args.backoff_max_secs),
        ..Default::default()
    };
    dispatcher_config.validate()?;
    let dispatcher = Dispatcher::new(reconciler, dispatcher_config);

    let shutdown = CancellationToken::new();

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    let metrics_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Start API server
    let api_server = ApiServer::new(
        ApiServerConfig {
            rest_addr: parse_addr(&args.api_addr, "REST API")?,
            ..Default::default()
        },
        claims,
        devices,
    );
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move { api_server.run(api_shutdown).await });

    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, finishing in-flight reconciles");
    shutdown.cancel();

    dispatcher_handle.await??;
    api_handle.await??;

    info!("Operator shutdown complete");
    Ok(())
}

async fn build_stores(args: &Args) -> anyhow::Result<(ClaimStoreRef, DeviceStoreRef)> {
    if args.standalone {
        let claims: ClaimStoreRef = MemoryStore::<BlockDeviceClaim>::new();
        let devices: DeviceStoreRef = MemoryStore::<BlockDevice>::new();
        if let Some(path) = &args.seed_file {
            SeedManifest::from_file(path)
                .with_context(|| format!("failed to load seed manifest {}", path))?
                .apply(claims.as_ref(), devices.as_ref())
                .await
                .context("failed to apply seed manifest")?;
        }
        return Ok((claims, devices));
    }

    if args.seed_file.is_some() {
        warn!("--seed-file is only used in standalone mode, ignoring");
    }
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let claims: ClaimStoreRef =
        KubeStore::<BlockDeviceClaim>::new(client.clone(), args.namespace.clone());
    let devices: DeviceStoreRef = KubeStore::<BlockDevice>::new(client, args.namespace.clone());
    Ok((claims, devices))
}

fn parse_addr(addr: &str, what: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid {} address: {}", what, addr))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("axum=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("health server failed")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, registry: Registry) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = text_response(StatusCode::OK, buffer);
                                    if let Ok(value) = encoder.format_type().parse::<header::HeaderValue>() {
                                        response.headers_mut().insert(header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    e.to_string(),
                                ),
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("metrics server failed")?;

    Ok(())
}
