//! NFS dynamic provisioner
//!
//! Runs an NFS export service next to a provision controller: claims for our
//! storage classes become exported directories and persistent-volume objects,
//! released volumes become free disk space again.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nfs_provisioner::cluster::KubeCluster;
use nfs_provisioner::export::{ExportBackend, GaneshaBackend, KernelBackend, SystemBusChannel};
use nfs_provisioner::volume::NfsProvisioner;
use nfs_provisioner::{error, nfsd, seed, ProvisionController, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NFS dynamic provisioner - serves PersistentVolumeClaims from a local
/// NFS export service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The name of this provisioner, i.e. the value StorageClasses set as
    /// their provisioner
    #[arg(long, env = "PROVISIONER_NAME")]
    provisioner_name: String,

    /// Directory provisioned volume directories are created in
    #[arg(long, env = "EXPORT_DIR", default_value = "/export")]
    export_dir: PathBuf,

    /// Use NFS Ganesha (system bus control) instead of the kernel NFS
    /// server (exportfs)
    #[arg(long, env = "USE_GANESHA", default_value_t = true, action = clap::ArgAction::Set)]
    use_ganesha: bool,

    /// Path of the NFS Ganesha configuration file
    #[arg(long, env = "GANESHA_CONFIG", default_value = "/export/vfs.conf")]
    ganesha_config: PathBuf,

    /// Path of the kernel server exports file
    #[arg(long, env = "EXPORTS_FILE", default_value = "/etc/exports")]
    exports_file: PathBuf,

    /// Informer resync period in seconds
    #[arg(long, env = "RESYNC_PERIOD_SECONDS", default_value = "15")]
    resync_period_seconds: u64,

    /// Retry period in seconds for saving a provisioned PV to the cluster
    #[arg(long, env = "CREATE_PROVISIONED_PV_INTERVAL_SECONDS", default_value = "10")]
    create_provisioned_pv_interval_seconds: u64,

    /// JSON file of exports to provision statically at startup
    #[arg(long, env = "SEED_FILE", default_value = "/etc/config/exports.json")]
    seed_file: PathBuf,

    /// Health and metrics server bind address
    #[arg(long, env = "OPS_ADDR", default_value = "0.0.0.0:8080")]
    ops_addr: String,

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
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting NFS provisioner");
    info!("  Provisioner name: {}", args.provisioner_name);
    info!("  Export dir: {}", args.export_dir.display());
    info!("  Backend: {}", if args.use_ganesha { "ganesha" } else { "kernel" });
    info!("  Resync period: {}s", args.resync_period_seconds);

    // The kernel variant owns its NFS stack; ganesha runs as its own daemon
    // and only needs to be reachable over the bus.
    if !args.use_ganesha {
        nfsd::start().await?;
    }

    let client = Client::try_default().await.map_err(|e| {
        error::Error::Internal(format!("Kubernetes client creation failed: {e}"))
    })?;
    info!("Connected to Kubernetes cluster");

    let cluster = Arc::new(KubeCluster::new(client));
    let backend: Arc<dyn ExportBackend> = if args.use_ganesha {
        Arc::new(GaneshaBackend::new(
            args.ganesha_config.clone(),
            Arc::new(SystemBusChannel::new()),
        ))
    } else {
        Arc::new(KernelBackend::new(args.exports_file.clone()))
    };
    let provisioner = Arc::new(
        NfsProvisioner::new(args.export_dir.clone(), cluster.clone(), backend).await,
    );

    // Statically provision exports listed in the seed file, if any. Errors
    // here never stop the controller from starting.
    if let Err(e) =
        seed::provision_static(cluster.as_ref(), provisioner.as_ref(), &args.seed_file).await
    {
        error!(error = %e, "static export seeding failed");
    }

    let ops_addr = args.ops_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_ops_server(&ops_addr).await {
            error!("ops server error: {e}");
        }
    });

    let shutdown = CancellationToken::new();
    let signaller = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("termination signal received, draining");
        signaller.cancel();
    });

    let controller = ProvisionController::new(
        cluster,
        provisioner,
        args.provisioner_name.clone(),
        Duration::from_secs(args.resync_period_seconds),
        Duration::from_secs(args.create_provisioned_pv_interval_seconds),
    );
    controller.run(shutdown).await;

    if !args.use_ganesha {
        nfsd::stop().await;
    }

    info!("Provisioner shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "couldn't install SIGTERM handler, relying on ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
}

// =============================================================================
// Health + Metrics Server
// =============================================================================

async fn run_ops_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn ops_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            "/metrics" => {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                match encoder.encode(&metric_families, &mut buffer) {
                    Ok(()) => Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Full::new(Bytes::from(buffer)))
                        .unwrap(),
                    Err(e) => Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Full::new(Bytes::from(format!("encoding metrics: {e}"))))
                        .unwrap(),
                }
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| error::Error::Config(format!("invalid ops server address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!("ops server listening on {addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(ops_handler))
                .await
            {
                tracing::error!("ops server connection error: {e}");
            }
        });
    }
}
