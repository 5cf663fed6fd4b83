//! Axum surface for the sync pipeline and the notices snapshot.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use redleaf_sync::{NoticeError, SyncPipeline};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "redleaf-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(value) if !value.trim().is_empty() => value
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a port number, got {value:?}"))?,
            _ => 5000,
        };
        Ok(Self { port })
    }
}

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<SyncPipeline>,
    /// One in-process run at a time; overlapping triggers queue up.
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            run_lock: Arc::new(Mutex::new(())),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync", get(sync_handler).post(sync_handler))
        .route("/api/records", get(records_handler))
        .route("/api/notices/scrape", get(scrape_notices_handler))
        .route("/api/notices/latest", get(latest_notice_handler))
        .layer(cors)
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: &WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "http trigger listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let _guard = state.run_lock.lock().await;
    match state.pipeline.run_once().await {
        Ok(report) => Json(report).into_response(),
        Err(err) if err.is_fetch_failure() => {
            warn!(error = %err, "sync aborted by fetch failure");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err) => {
            error!(error = %err, "sync failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn records_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.records().list_records().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            error!(error = %err, "listing records failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn scrape_notices_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.scrape_notices().await {
        Ok(snapshot) => Json(json!({
            "message": "Notices scraped and saved successfully.",
            "notice": snapshot,
        }))
        .into_response(),
        Err(err) => notice_error(err),
    }
}

async fn latest_notice_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.latest_notice().await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "No notices found.".to_string()),
        Err(err) => notice_error(err),
    }
}

fn notice_error(err: NoticeError) -> Response {
    let status = match &err {
        e if e.is_fetch_failure() => StatusCode::BAD_GATEWAY,
        NoticeError::NotConfigured | NoticeError::NoContent { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "notices request failed");
    } else {
        warn!(error = %err, "notices request failed");
    }
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
