//! registry-k8s
//!
//! ```text
//!   env / TOML ──▶ config ──▶ logging, metrics, diagnostics
//!                     │
//!                     ▼
//!   SVID files ──▶ identity ──▶ mTLS + JWT ──▶ registry chain ──▶ listeners
//!                                                                    │
//!   signals ─────────────────────▶ shutdown ◀── first listener error ┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::Instrument;

use registry_k8s::config::loader;
use registry_k8s::diagnostics::{self, DiagnosticsState};
use registry_k8s::identity::{PemFileSource, X509Source};
use registry_k8s::lifecycle::{signals, startup, Shutdown};
use registry_k8s::net::ConnectionTracker;
use registry_k8s::observability::{logging, metrics, LogLevelControl};
use registry_k8s::registry::HealthChain;
use registry_k8s::RegistryConfig;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "registry-k8s",
    version,
    about = "Network service mesh registry backed by Kubernetes",
    after_help = "Settings are read from NSM_* environment variables; see --env-usage."
)]
struct Cli {
    /// TOML file providing base settings, overridden by the environment
    #[arg(long, env = "NSM_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Print the recognised environment variables and exit
    #[arg(long)]
    env_usage: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.env_usage {
        print!("{}", loader::usage());
        return ExitCode::SUCCESS;
    }

    let config = match loader::load(cli.config.as_deref(), std::env::vars()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let log_control = match logging::init(config.log_level) {
        Ok(control) => control,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = run(config, log_control)
        .instrument(tracing::info_span!("cmd", name = "registry-k8s"))
        .await;
    ExitCode::from(code)
}

async fn run(config: RegistryConfig, log_control: LogLevelControl) -> u8 {
    let started_at = Instant::now();
    tracing::info!("Config: {:?}", config);

    let shutdown = Shutdown::new();
    let mut signal_task = match signals::spawn_termination_handler(shutdown.clone()) {
        Ok(task) => task,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return 1;
        }
    };
    if let Err(e) = signals::spawn_log_level_handler(log_control, shutdown.clone()) {
        tracing::warn!(error = %e, "Log level signals unavailable");
    }

    if config.telemetry.metrics_enabled {
        match resolve(&config.telemetry.metrics_listen_on).await {
            Some(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            None => tracing::error!(
                metrics_address = %config.telemetry.metrics_listen_on,
                "Failed to parse metrics address"
            ),
        }
    }

    let status = DiagnosticsState::new(shutdown.clone(), config.listen_on.clone());
    if config.diagnostics.enabled {
        spawn_diagnostics(&config.diagnostics.listen_on, status.clone()).await;
    }

    let source = tokio::select! {
        result = PemFileSource::acquire(&config.identity.svid_dir) => match result {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(dir = %config.identity.svid_dir.display(), error = %e, "error getting x509 source");
                return 1;
            }
        },
        () = shutdown.cancelled() => {
            shutdown.mark_stopped();
            return shutdown.exit_code();
        }
    };
    let svid = source.svid();
    tracing::info!(spiffe_id = %svid.id(), expires_at = ?svid.expires_at(), "SVID acquired");
    status.set_spiffe_id(svid.id().clone());

    let server = match startup::start(&config, source, &HealthChain, &shutdown, started_at) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            shutdown.mark_stopped();
            return 1;
        }
    };
    status.set_connections(server.connections().clone());

    shutdown.cancelled().await;
    tokio::select! {
        () = drain(server.connections()) => {}
        _ = &mut signal_task => {
            tracing::warn!(active = server.connections().active_count(), "Drain interrupted");
        }
    }
    shutdown.mark_stopped();
    tracing::info!(cause = ?shutdown.cause(), "Shutdown complete");
    shutdown.exit_code()
}

async fn resolve(address: &str) -> Option<SocketAddr> {
    tokio::net::lookup_host(address).await.ok()?.next()
}

async fn spawn_diagnostics(address: &str, state: DiagnosticsState) {
    match tokio::net::TcpListener::bind(address).await {
        Ok(listener) => {
            tokio::spawn(async move {
                if let Err(e) = diagnostics::serve(listener, state).await {
                    tracing::error!(error = %e, "Diagnostics endpoint failed");
                }
            });
        }
        Err(e) => tracing::error!(address = %address, error = %e, "Failed to bind diagnostics endpoint"),
    }
}

/// Give open connections a moment to finish after listeners stop.
async fn drain(connections: &ConnectionTracker) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while connections.active_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if connections.active_count() > 0 {
        tracing::warn!(active = connections.active_count(), "Connections still open at exit");
    }
}
