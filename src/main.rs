//! Storage Client Operator
//!
//! Keeps the Ceph CSI driver bundle of a storage client converged with its
//! templates on every cluster version change.
//!
//! In `--standalone` mode no cluster is contacted: a single pass runs against
//! an in-memory store and the resulting objects are printed as YAML.

use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_client_operator::controlplane::controller;
use storage_client_operator::crd::ClusterVersionSpec;
use storage_client_operator::{
    ClusterVersion, ClusterVersionStatus, CsiConfig, Error, KubeResourceClient,
    MemoryResourceClient, ObjectKey, Owner, Reconciler, ReconcilerConfig, Release, Result,
    SidecarCatalog,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Client Operator - keeps the Ceph CSI bundle converged
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace the operator runs in and deploys the CSI bundle to
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "storage-client")]
    namespace: String,

    /// Name of the operator's own Deployment, owner of the CSI workloads
    #[arg(
        long,
        env = "OPERATOR_DEPLOYMENT_NAME",
        default_value = "storage-client-operator"
    )]
    operator_deployment: String,

    /// Ceph CSI plugin image
    #[arg(long, env = "CSI_PLUGIN_IMAGE", default_value = "quay.io/cephcsi/cephcsi:v3.9.0")]
    csi_plugin_image: String,

    /// Kubelet root directory on the nodes
    #[arg(long, env = "KUBELET_DIR", default_value = "/var/lib/kubelet")]
    kubelet_dir: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Requeue delay after a transient failure, in seconds
    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value = "15")]
    error_requeue_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run one pass against an in-memory store (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Platform version assumed in standalone mode
    #[arg(long, env = "STANDALONE_VERSION", default_value = "4.13.0")]
    standalone_version: String,
}

impl Args {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            namespace: self.namespace.clone(),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
        }
    }

    fn csi_config(&self) -> CsiConfig {
        CsiConfig {
            plugin_image: self.csi_plugin_image.clone(),
            kubelet_dir: self.kubelet_dir.clone(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Storage Client Operator");
    info!("  Version: {}", storage_client_operator::VERSION);
    info!("  Namespace: {}", args.namespace);
    info!("  Operator deployment: {}", args.operator_deployment);
    info!("  Standalone mode: {}", args.standalone);

    if args.standalone {
        return run_standalone(&args).await;
    }

    let client = Client::try_default().await?;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &args.namespace);
    let parent = deployments.get(&args.operator_deployment).await?;
    let owner = Owner::from_resource(&parent)?;
    info!(owner = %owner, "Resolved owner for CSI workloads");

    let reconciler = Reconciler::new(
        args.reconciler_config(),
        Arc::new(KubeResourceClient::new(client.clone())),
        owner,
        Arc::new(SidecarCatalog::default()),
        Arc::new(args.csi_config()),
    )?;

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_reconciler = reconciler.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_reconciler).await {
            error!("Metrics server error: {}", e);
        }
    });

    controller::run(client, reconciler).await?;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Standalone Mode
// =============================================================================

async fn run_standalone(args: &Args) -> Result<()> {
    let store = Arc::new(MemoryResourceClient::new());

    let mut signal = ClusterVersion::new("version", ClusterVersionSpec::default());
    signal.status = Some(ClusterVersionStatus {
        desired: Release {
            version: args.standalone_version.clone(),
            ..Default::default()
        },
        ..Default::default()
    });
    store.seed(&signal)?;

    let parent = store.seed(&Deployment {
        metadata: ObjectMeta {
            name: Some(args.operator_deployment.clone()),
            namespace: Some(args.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    })?;

    let reconciler = Reconciler::new(
        args.reconciler_config(),
        store.clone(),
        Owner::from_resource(&parent)?,
        Arc::new(SidecarCatalog::default()),
        Arc::new(args.csi_config()),
    )?;

    let report = reconciler.reconcile(&ObjectKey::cluster("version")).await?;
    info!(writes = report.writes(), "Standalone pass complete");

    let mut stdout = std::io::stdout().lock();
    for object in store.objects() {
        writeln!(stdout, "---")?;
        stdout.write_all(serde_yaml::to_string(&object)?.as_bytes())?;
    }
    stdout.flush()?;

    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
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
        filter = filter.add_directive(directive.parse().map_err(|e| {
            Error::Configuration(format!("Invalid log directive {}: {}", directive, e))
        })?);
    }

    let result = if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, reconciler: Arc<Reconciler>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let reconciler = reconciler.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let reconciler = reconciler.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match reconciler.metrics().encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = respond(StatusCode::OK, buffer);
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to encode metrics");
                                respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                            }
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
