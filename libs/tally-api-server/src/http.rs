use std::fmt::Write as _;
use std::path::Path as FsPath;

use axum::Form;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use tally_engine::{ArchiveStatus, CacheStats, DirEntryInfo};

use super::AppState;
use crate::response::{ApiError, ApiResponse};

// ═══════════════════════════════════════════════════════════════
//  POST /statistics/log
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub(crate) struct LogForm {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

pub(crate) async fn handle_log(
    State(state): State<AppState>,
    Form(form): Form<LogForm>,
) -> Result<ApiResponse<()>, ApiError> {
    state.engine.log(&form.name, &form.value)?;
    Ok(ApiResponse::ok(()))
}

// ═══════════════════════════════════════════════════════════════
//  POST /statistics/flush, GET /statistics/stats
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_flush(
    State(state): State<AppState>,
) -> Result<ApiResponse<usize>, ApiError> {
    let engine = state.engine.clone();
    let flushed = tokio::task::spawn_blocking(move || engine.flush())
        .await
        .map_err(|e| ApiError::Internal(format!("flush task: {e}")))?;
    Ok(ApiResponse::ok(flushed))
}

pub(crate) async fn handle_stats(State(state): State<AppState>) -> ApiResponse<CacheStats> {
    ApiResponse::ok(state.engine.cache_stats())
}

// ═══════════════════════════════════════════════════════════════
//  PUT /statistics/zip/{dir}
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_zip(
    State(state): State<AppState>,
    Path(dir): Path<String>,
) -> Result<ApiResponse<String>, ApiError> {
    let engine = state.engine.clone();
    let label = dir.clone();
    let status = tokio::task::spawn_blocking(move || engine.archive(&label))
        .await
        .map_err(|e| ApiError::Internal(format!("archive task: {e}")))?;

    if status == ArchiveStatus::InvalidLabel {
        return Err(ApiError::BadRequest(status.to_string()));
    }
    let code = i32::from(status.is_success());
    Ok(ApiResponse::with_message(code, status.to_string(), dir))
}

// ═══════════════════════════════════════════════════════════════
//  GET /statistics/list[/{dir}]
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_root(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let entries = list(&state, "").await?;

    let mut items = String::new();
    for entry in &entries {
        let name = escape(&entry.name);
        if entry.is_directory {
            let _ = writeln!(items, r#"<li><a href="/statistics/list/{name}">{name}/</a></li>"#);
        } else if let Some(label) = entry.name.strip_suffix(".zip") {
            let label = escape(label);
            let _ = writeln!(items, r#"<li><a href="/statistics/download/{label}">{name}</a></li>"#);
        }
    }
    Ok(Html(page("statistics", &items)))
}

pub(crate) async fn handle_list_dir(
    State(state): State<AppState>,
    Path(dir): Path<String>,
) -> Result<Html<String>, ApiError> {
    let entries = list(&state, &dir).await?;
    let dir_html = escape(&dir);

    let mut items = String::new();
    for entry in &entries {
        let name = escape(&entry.name);
        if entry.is_directory {
            let _ = writeln!(items, r#"<li><a href="/statistics/list/{dir_html}/{name}">{name}/</a></li>"#);
        } else if entry.name.ends_with(".csv") {
            let _ = writeln!(
                items,
                r#"<li><a href="/statistics/download/{dir_html}/{name}">{name}</a></li>"#
            );
        }
    }
    if dir != state.engine.active_date() {
        let _ = writeln!(
            items,
            r#"<li><a href="/statistics/download/{dir_html}">{dir_html}.zip</a></li>"#
        );
    }
    Ok(Html(page(&dir, &items)))
}

async fn list(state: &AppState, relative: &str) -> Result<Vec<DirEntryInfo>, ApiError> {
    let engine = state.engine.clone();
    let relative = relative.to_string();
    tokio::task::spawn_blocking(move || engine.list_directory(&relative))
        .await
        .map_err(|e| ApiError::Internal(format!("list task: {e}")))?
        .map_err(ApiError::from)
}

fn page(title: &str, items: &str) -> String {
    let title = escape(title);
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body><h1>{title}</h1>\n<ul>\n{items}</ul></body></html>\n"
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════
//  GET /statistics/download/{dir}[/{file}]
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_download_zip(
    State(state): State<AppState>,
    Path(dir): Path<String>,
) -> Result<Response, ApiError> {
    send_file(&state, &format!("{dir}.zip")).await
}

pub(crate) async fn handle_download_file(
    State(state): State<AppState>,
    Path((dir, file)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    send_file(&state, &format!("{dir}/{file}")).await
}

async fn send_file(state: &AppState, relative: &str) -> Result<Response, ApiError> {
    let engine = state.engine.clone();
    let target = relative.to_string();
    let path = tokio::task::spawn_blocking(move || engine.resolve_file(&target))
        .await
        .map_err(|e| ApiError::Internal(format!("resolve task: {e}")))??;

    let io_error =
        |e: std::io::Error| ApiError::from(tally_engine::EngineError::from(e).with_context(relative));
    let file = tokio::fs::File::open(&path).await.map_err(io_error)?;
    let length = file.metadata().await.map_err(io_error)?.len();

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let headers = [
        (header::CONTENT_TYPE, content_type(&path).to_string()),
        (header::CONTENT_LENGTH, length.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ),
    ];
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn content_type(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("zip") => "application/zip",
        Some("csv") => "text/csv; charset=utf-8",
        _ => "application/octet-stream",
    }
}
