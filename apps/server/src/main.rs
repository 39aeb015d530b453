//! VoiceBridge Server - standalone headless telephony voice-agent engine.
//!
//! Connects to Asterisk over ARI, admits calls into the media engine, and
//! runs until SIGINT/SIGTERM. Exit codes: 0 normal, 1 configuration
//! error, 2 transport bind error, 3 provider initialization error.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use voicebridge_core::{Engine, VoiceBridgeError};

use crate::config::ServerConfig;

/// VoiceBridge Server - Asterisk-to-AI voice agent engine.
#[derive(Parser, Debug)]
#[command(name = "voicebridge-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "VOICEBRIDGE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Enable the Prometheus metrics listener (overrides config file).
    #[arg(long, env = "VOICEBRIDGE_METRICS")]
    metrics: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("VoiceBridge Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")
    {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e:#}");
            return ExitCode::from(1);
        }
    };
    if args.metrics {
        config.engine.metrics.enabled = true;
    }

    log::info!(
        "Configuration: ari={}, app={}, rtp_ports={}-{}, pipelines={}, default_provider={:?}",
        config.engine.ari.base_url,
        config.engine.ari.app_name,
        config.engine.rtp.port_range.normalized().0,
        config.engine.rtp.port_range.normalized().1,
        config.engine.pipelines.len(),
        config.engine.default_provider,
    );

    let engine = Arc::new(Engine::new(config.engine));
    let cancel = CancellationToken::new();

    let runner = Arc::clone(&engine);
    let run_cancel = cancel.clone();
    let mut engine_task = tokio::spawn(async move { runner.run(run_cancel).await });

    // Either the engine fails on its own (startup error, ARI gone) or a
    // signal asks for shutdown.
    let joined = tokio::select! {
        joined = &mut engine_task => Some(joined),
        () = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            cancel.cancel();
            None
        }
    };
    let joined = match joined {
        Some(joined) => joined,
        None => engine_task.await,
    };

    let result = match joined {
        Ok(result) => result,
        Err(e) => {
            log::error!("Engine task panicked: {e}");
            return ExitCode::from(1);
        }
    };

    match result {
        Ok(()) => {
            log::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Engine error: {e}");
            ExitCode::from(match e {
                VoiceBridgeError::Configuration(_) => 1,
                VoiceBridgeError::Transport(_) => 2,
                VoiceBridgeError::Provider(_) => 3,
                _ => 1,
            })
        }
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
