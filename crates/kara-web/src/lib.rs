//! Read-only JSON report API over the fact tables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kara_core::{ErrorKind, KaraConfig};
use kara_storage::{MessageReader, PgStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const DEFAULT_TOP_PRODUCTS_LIMIT: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageReader>,
}

impl AppState {
    pub fn new(store: Arc<dyn MessageReader>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize)]
struct TopProductsParams {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request".to_string(), message),
            ApiError::Store(err) if err.is_unavailable() => {
                warn!(error = %err, "report store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::DataUnavailable.to_string(),
                    "report data is temporarily unavailable".to_string(),
                )
            }
            ApiError::Store(err) => {
                error!(error = %err, "report query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "query_failed".to_string(), err.to_string())
            }
        };
        (status, Json(ErrorBody { error: kind, message })).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/reports/top-products", get(top_products_handler))
        .route("/api/channels/{channel_name}/activity", get(channel_activity_handler))
        .route("/api/search/messages", get(search_messages_handler))
        .with_state(Arc::new(state))
}

/// `app` with request tracing and a per-request timeout.
pub fn app_with_layers(state: AppState, request_timeout: Duration) -> Router {
    app(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(config: &KaraConfig) -> anyhow::Result<()> {
    let store = PgStore::connect_lazy(
        &config.database_url,
        config.db_max_connections,
        Duration::from_secs(config.db_acquire_timeout_secs),
    )
    .context("configuring database pool")?;
    let router = app_with_layers(
        AppState::new(Arc::new(store)),
        Duration::from_secs(config.request_timeout_secs),
    );

    let listener = TcpListener::bind(&config.web_bind)
        .await
        .with_context(|| format!("binding {}", config.web_bind))?;
    info!(addr = %config.web_bind, "report API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down report API");
}

async fn top_products_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<TopProductsParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let limit = params.limit.unwrap_or(DEFAULT_TOP_PRODUCTS_LIMIT);
    let rows = state.store.top_products(limit).await?;
    Ok(Json(rows).into_response())
}

async fn channel_activity_handler(
    State(state): State<Arc<AppState>>,
    Path(channel_name): Path<String>,
) -> Result<Response, ApiError> {
    let rows = state.store.channel_activity(&channel_name).await?;
    Ok(Json(rows).into_response())
}

async fn search_messages_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let query = params
        .query
        .ok_or_else(|| ApiError::BadRequest("missing required parameter `query`".to_string()))?;
    let rows = state.store.search_messages(&query).await?;
    Ok(Json(rows).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use kara_core::Message;
    use kara_storage::MemoryStore;
    use serde_json::Value;
    use tower::ServiceExt;

    fn message(id: i64, channel: &str, text: &str, day: u32) -> Message {
        Message {
            id,
            channel_name: channel.to_string(),
            message_text: text.to_string(),
            posted_at: Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0).single().expect("valid timestamp"),
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_messages(vec![
            message(1, "Chemed123", "Paracetamol 500mg", 10),
            message(2, "Chemed123", "Paracetamol 500mg", 11),
            message(3, "lobelia4cosmetics", "Vitamin C serum", 11),
            message(4, "Chemed123", "PARACETAMOL syrup", 11),
        ]))
    }

    async fn get_json(store: Arc<MemoryStore>, uri: &str) -> (StatusCode, Value) {
        let resp = app_with_layers(AppState::new(store), Duration::from_secs(5))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = resp.status();
        let body = resp.into_body().collect().await.expect("read body").to_bytes();
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    #[tokio::test]
    async fn top_products_defaults_and_limits() {
        let (status, body) = get_json(store(), "/api/reports/top-products").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().expect("json array");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["product_name"], "Paracetamol 500mg");
        assert_eq!(rows[0]["count"], 2);

        let (_, body) = get_json(store(), "/api/reports/top-products?limit=1").await;
        assert_eq!(body.as_array().expect("json array").len(), 1);
    }

    #[tokio::test]
    async fn invalid_limit_is_a_bad_request() {
        let (status, body) = get_json(store(), "/api/reports/top-products?limit=-3").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn channel_activity_groups_by_date() {
        let (status, body) = get_json(store(), "/api/channels/Chemed123/activity").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!([
                {"date": "2025-01-10", "count": 1},
                {"date": "2025-01-11", "count": 2}
            ])
        );

        let (status, body) = get_json(store(), "/api/channels/nobody/activity").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let (status, body) = get_json(store(), "/api/search/messages?query=paracetamol").await;
        assert_eq!(status, StatusCode::OK);
        let ids = body
            .as_array()
            .expect("json array")
            .iter()
            .map(|m| m["id"].as_i64().expect("numeric id"))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 4]);
        assert_eq!(body[0]["channel_name"], "Chemed123");
        assert_eq!(body[0]["message_text"], "Paracetamol 500mg");
        assert!(body[0]["posted_at"].as_str().expect("timestamp string").starts_with("2025-01-10T10:00:00"));
    }

    #[tokio::test]
    async fn search_without_query_is_rejected() {
        let (status, body) = get_json(store(), "/api/search/messages").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn no_matches_is_an_empty_array() {
        let (status, body) = get_json(store(), "/api/search/messages?query=ibuprofen").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn unreachable_store_is_service_unavailable() {
        let store = store();
        store.set_offline(true);
        for uri in [
            "/api/reports/top-products",
            "/api/channels/Chemed123/activity",
            "/api/search/messages?query=para",
        ] {
            let (status, body) = get_json(store.clone(), uri).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
            assert_eq!(body["error"], "data_unavailable");
        }
    }
}
