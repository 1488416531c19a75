//! Proxima - Entry Point
//!
//! Loads the rule program and serves CONNECT requests until a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxima::capability::{self, PooledProbeTransport};
use proxima::config::{Config, LogConfig, LogFormat};
use proxima::engine::Engine;
use proxima::error::ProximaError;
use proxima::proxy::{Dispatcher, ProxyServer};

/// Rule-driven HTTP CONNECT proxy
#[derive(Parser, Debug)]
#[command(name = "proxima", version, about)]
struct Cli {
    /// Rule files, loaded in order after those named by PROXIMA_RULES
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?.with_rule_files(cli.files);
    init_tracing(&config.log);

    info!("Starting Proxima");

    // Rules may probe while loading, which blocks on the runtime.
    let (engine, addr) = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || -> Result<_, ProximaError> {
            let engine = load_engine(&config)?;
            let addr = config.listen_addr(&engine)?;
            Ok((engine, addr))
        })
        .await??
    };
    info!(files = config.rules.len(), "Rules loaded");

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to listen on {}", addr))?;

    let server = ProxyServer::new(Dispatcher::new(engine, config.proxy.dispatcher()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(listener, shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;

    info!("Proxima stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("proxima={}", log.level)));

    match log.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

/// Baseline first, then every configured file in order. Any failure is fatal.
fn load_engine(config: &Config) -> Result<Engine, ProximaError> {
    let mut builder = Engine::builder().map_err(|source| ProximaError::RuleLoad {
        origin: "baseline".into(),
        source,
    })?;

    let transport = PooledProbeTransport::new(config.proxy.probe_timeout, Handle::current());
    capability::register_all(&mut builder, Arc::new(transport));

    for path in &config.rules {
        builder
            .consult_file(path)
            .map_err(|source| ProximaError::RuleLoad {
                origin: path.display().to_string(),
                source,
            })?;
    }

    builder.build().map_err(|source| ProximaError::RuleLoad {
        origin: "initialization".into(),
        source,
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
