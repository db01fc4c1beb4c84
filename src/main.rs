use std::net::SocketAddr;

use config::CONFIG;
use controller::{create_router, handle_404};
use database::DbPool;
use service::app_state::{create_app_state, create_state_router};
use service::bootstrap::ensure_platform_provider;
use service::refresh::spawn_model_refresh;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use cyder_tools::log::{LocalLogger, error, info, warn};

mod config;
mod controller;
mod database;
mod schema;
mod service;
mod utils;

#[tokio::main]
async fn main() {
    LocalLogger::init(&CONFIG.log_level);

    let pool = match DbPool::establish(&CONFIG.db_url) {
        Ok(pool) => pool,
        Err(e) => {
            error!("failed to open database '{}': {}", CONFIG.db_url, e);
            std::process::exit(1);
        }
    };
    let app_state = match create_app_state(&CONFIG, pool).await {
        Ok(state) => state,
        Err(e) => {
            error!("failed to build application state: {}", e);
            std::process::exit(1);
        }
    };

    if CONFIG.platform.setup {
        if let Err(e) = ensure_platform_provider(
            &app_state.registry,
            &CONFIG.platform.inference_url,
            CONFIG.platform.api_key.clone(),
        )
        .await
        {
            warn!("platform provider setup failed, continuing without it: {}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let refresh = spawn_model_refresh(
        app_state.model_cache.clone(),
        CONFIG.model_refresh_interval(),
        shutdown.clone(),
    );

    let app = create_state_router()
        .nest(&CONFIG.base_path, create_router(&app_state))
        .fallback(handle_404)
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("server start at {}{}", &addr, &CONFIG.base_path);

    let signal = shutdown.clone();
    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            signal.cancel();
        })
        .await;
    shutdown.cancel();
    if let Err(e) = refresh.await {
        warn!("model refresh task ended abnormally: {}", e);
    }
    if let Err(e) = served {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
