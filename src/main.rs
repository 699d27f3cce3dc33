use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ride_dispatch::api;
use ride_dispatch::config::Config;
use ride_dispatch::engine::dispatch::run_dispatch_loop;
use ride_dispatch::error::AppError;
use ride_dispatch::payment::HttpPaymentGateway;
use ride_dispatch::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let gateway = HttpPaymentGateway::new(config.payment_gateway_url.clone())
        .map_err(|err| AppError::Internal(format!("payment gateway client: {err}")))?;
    let shared_state = Arc::new(AppState::new(&config, Arc::new(gateway)));

    let app = api::rest::router(shared_state.clone());

    let shutdown = CancellationToken::new();
    let dispatch_loop = tokio::spawn(run_dispatch_loop(
        shared_state.dispatcher.clone(),
        config.dispatch_interval(),
        shutdown.clone(),
    ));

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        payment_gateway = %config.payment_gateway_url,
        "http server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shutdown.cancel();
    if let Err(err) = dispatch_loop.await {
        tracing::error!(error = %err, "dispatch loop panicked");
    }

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    shutdown.cancel();
}
