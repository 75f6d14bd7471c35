mod http;
mod middleware;
mod response;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use axum::Router;
use axum::routing::{get, post, put};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use tally_engine::Engine;

pub use response::{ApiError, ApiResponse};

#[derive(Clone)]
pub(crate) struct AppState {
    engine: Arc<Engine>,
    request_seq: Arc<AtomicU64>,
}

/// Build the `/statistics` router. Every route sits behind the IP guard.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = engine.config().cors_enabled;
    let state = AppState {
        engine,
        request_seq: Arc::new(AtomicU64::new(1)),
    };

    let app = Router::new()
        .route("/statistics/log", post(http::handle_log))
        .route("/statistics/flush", post(http::handle_flush))
        .route("/statistics/stats", get(http::handle_stats))
        .route("/statistics/zip/{dir}", put(http::handle_zip))
        .route("/statistics/list", get(http::handle_list_root))
        .route("/statistics/list/{dir}", get(http::handle_list_dir))
        .route("/statistics/download/{dir}", get(http::handle_download_zip))
        .route(
            "/statistics/download/{dir}/{file}",
            get(http::handle_download_file),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::ip_guard,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::log_requests,
        ))
        .with_state(state);

    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Statistics HTTP API server.
pub async fn run(
    port: u16,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind api :{port}: {e}"))?;
    tracing::info!(port, "statistics API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
    .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}
