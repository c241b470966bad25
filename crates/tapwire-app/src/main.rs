//! Tapwire - local TLS interception.
//!
//! Runs a single interception session:
//! - Loads `tapwire.json` (or defaults)
//! - Installs the session root into the chosen trust store
//! - Serves the loopback capture proxy until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tapwire_app::{build_controller, default_config_path, AppConfig, LogObserver, PASSPHRASE_ENV};
use tapwire_ca::CertEncoding;
use tapwire_session::{SessionController, StartOutcome};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often a pending trust install is re-checked.
const TRUST_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Tapwire - intercept and inspect local TLS traffic
#[derive(Parser, Debug)]
#[command(name = "tapwire", version, about)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the proxy listen port
    #[arg(long)]
    port: Option<u16>,

    /// Write the session root certificate (PEM) to this path once active
    #[arg(long)]
    export_ca: Option<PathBuf>,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    write_config: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "tapwire", "Tapwire").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tapwire={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("tapwire")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Starts the session, retrying while the trust install is pending.
///
/// Returns false if interrupted before the session went active.
async fn start_session(controller: &SessionController, config: &AppConfig) -> anyhow::Result<bool> {
    loop {
        let session_config = config.session_config()?;
        let outcome = tokio::select! {
            outcome = controller.request_start(session_config) => outcome?,
            _ = tokio::signal::ctrl_c() => return Ok(false),
        };

        match outcome {
            StartOutcome::Active => return Ok(true),
            StartOutcome::PendingTrustInstall(state) => {
                tracing::info!(
                    "Root trust is {}; start again in {:?}",
                    state.description(),
                    TRUST_RETRY_INTERVAL
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(TRUST_RETRY_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => return Ok(false),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    tracing::info!("Tapwire {} starting", env!("CARGO_PKG_VERSION"));

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => default_config_path().context("no config directory on this platform")?,
    };

    let mut config = AppConfig::load(&config_path)?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    if args.write_config {
        config.save(&config_path)?;
        tracing::info!("Config written to {:?}", config_path);
        return Ok(());
    }

    config.apply_passphrase(std::env::var(PASSPHRASE_ENV).ok());

    let controller = build_controller(&config);
    controller.register_observer(Arc::new(LogObserver));

    if !start_session(&controller, &config).await? {
        tracing::info!("Interrupted before the session started");
        return Ok(());
    }

    if let Some(info) = controller.session_info().await {
        tracing::info!("Session: {}", serde_json::to_string(&info)?);
    }

    if let Some(path) = &args.export_ca {
        let pem = controller
            .root_certificate(CertEncoding::Pem)
            .await
            .context("session stopped before the root could be exported")?;
        std::fs::write(path, pem).with_context(|| format!("writing {:?}", path))?;
        tracing::info!("Root certificate written to {:?}", path);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    controller.request_stop().await?;

    Ok(())
}
