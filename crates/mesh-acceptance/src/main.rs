//! Mesh acceptance runner.
//!
//! Deploys the control plane and the bookinfo sample into a scratch
//! namespace, exercises routing, fault injection and traffic splitting
//! through the ingress, then tears everything down. The exit status is the
//! verdict: 0 passed, 1 assertion failures, 2 aborted.

use clap::Parser;
use mesh_acceptance::cluster::Kubectl;
use mesh_acceptance::config::{Config, Overrides};
use mesh_acceptance::report::EXIT_ABORTED;
use mesh_acceptance::runner::Runner;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mesh-acceptance", version, about = "Service mesh acceptance tests")]
struct Cli {
    /// Path to the cluster CLI (overrides MESH_KUBECTL)
    #[arg(short = 'i', long = "kubectl")]
    kubectl: Option<PathBuf>,

    /// Keep the namespace, rules and working directory after the run
    #[arg(short = 's', long = "skip-cleanup")]
    skip_cleanup: bool,

    /// Use this namespace instead of a generated one
    #[arg(short = 'n', long)]
    namespace: Option<String>,
}

impl From<Cli> for Overrides {
    fn from(cli: Cli) -> Self {
        Overrides {
            kubectl: cli.kubectl,
            skip_cleanup: cli.skip_cleanup,
            namespace: cli.namespace,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = Config::from_env().and_then(|config| config.with_overrides(cli.into()));

    let log_json = config.as_ref().map(|c| c.log_json).unwrap_or(false);
    init_tracing(log_json);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(EXIT_ABORTED);
        }
    };

    info!(
        kubectl = %config.kubectl.display(),
        namespace = config.namespace.as_deref().unwrap_or("<generated>"),
        keep_environment = config.keep_environment,
        "Starting mesh acceptance run"
    );

    let cluster = Kubectl::new(config.kubectl.clone());
    let mut runner = Runner::new(config, cluster);

    let abort_reason = tokio::select! {
        result = runner.run() => result.err().map(|e| e.to_string()),
        () = shutdown_signal() => Some("interrupted".to_string()),
    };

    let report = runner.finish(abort_reason).await;
    report.log_summary();
    ExitCode::from(report.exit_code())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mesh_acceptance=info".into());

    let (plain, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed never
/// resolves, so the run continues to completion.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, aborting run"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, aborting run");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
