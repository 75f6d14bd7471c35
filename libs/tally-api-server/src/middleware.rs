use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use tally_engine::{AccessDecision, HeaderSource};

use super::AppState;

/// Request headers as seen by the access guard.
struct Headers<'a>(&'a HeaderMap);

impl HeaderSource for Headers<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.to_str().ok())
    }
}

fn remote_addr(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════
//  IP allowlist
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn ip_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let decision = state
        .engine
        .check_ip(&Headers(req.headers()), &remote_addr(&req));
    match decision {
        AccessDecision::Allow => next.run(req).await,
        AccessDecision::Deny(payload) => (StatusCode::FORBIDDEN, Json(payload)).into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Request log
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn log_requests(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let id = state.request_seq.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    tracing::info!(
        id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
