use std::{process, time::Duration};

use thiserror::Error;
use tokio::signal;
use torchio::{
    config,
    http::{self, AppState},
    telemetry::{self, TelemetryError},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let state = AppState::from_settings(&settings);
    let router = http::build_router(state, settings.uploads.max_request_bytes.get());

    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(
        target = "torchio::server",
        addr = %settings.server.addr,
        uploads = %settings.uploads.directory.display(),
        "listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(settings.server.graceful_shutdown))
        .await?;

    info!(target = "torchio::server", "shut down cleanly");
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM. Once a signal arrives a second task arms a
/// hard deadline so a stuck connection cannot keep the process alive past
/// the configured grace period.
async fn shutdown_signal(grace: Duration) {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => futures::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(target = "torchio::server", "shutdown signal received, draining connections");
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        error!(target = "torchio::server", "graceful shutdown deadline exceeded, exiting");
        process::exit(1);
    });
}
