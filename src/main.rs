mod config;
mod error;
mod format;
mod handlers;
mod orchestrator;
mod progress;
mod session;
mod ytdlp;

use crate::{
    config::Config,
    error::AppError,
    handlers::{build_handler, AppServices},
};
use std::time::Duration;
use teloxide::{net::default_reqwest_settings, prelude::*};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        error!(error = %err, "application terminated with fatal error");
        return Err(err);
    }
    info!("shutdown complete");
    Ok(())
}

async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenv::dotenv().ok();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.download_dir).await?;
    info!(
        download_dir = %config.download_dir.display(),
        budget_bytes = config.max_artifact_bytes,
        "starting mediadrop"
    );

    let client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()?;
    let bot = Bot::from_env_with_client(client);

    let services = AppServices::new(config).await;
    let mut dispatcher = Dispatcher::builder(bot, build_handler())
        .dependencies(dptree::deps![services])
        .build();

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        match shutdown_token.shutdown() {
            Ok(wait) => wait.await,
            Err(err) => warn!(error = %err, "failed to initiate graceful shutdown"),
        }
    });

    info!("starting dispatcher");
    dispatcher.dispatch().await;
    info!("dispatcher stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut interrupt)) => {
            tokio::select! {
                _ = term.recv() => info!("received SIGTERM"),
                _ = interrupt.recv() => info!("received SIGINT"),
            }
        }
        _ => {
            warn!("signal handler registration failed, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
