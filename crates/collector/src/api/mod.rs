pub mod balances;
pub mod monitoring;

use axum::{
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::downsample::TimeSeriesDownsampler;
use common::error::StoreError;
use common::snapshots::SnapshotStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::chain::ChainClient;
use crate::monitor::MonitoringService;

/// Shared application state available to all handlers.
pub struct AppState {
    pub monitor: Arc<MonitoringService<ChainClient>>,
    pub store: SnapshotStore,
    pub downsampler: TimeSeriesDownsampler,
    pub default_schedule: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let monitoring = Router::new()
        .route("/status", get(monitoring::status))
        .route("/start", post(monitoring::start))
        .route("/stop", post(monitoring::stop))
        .route("/trigger", post(monitoring::trigger))
        .route("/cleanup", post(monitoring::cleanup))
        .route("/health", get(monitoring::health))
        .route("/networks/test", get(monitoring::test_all_networks))
        .route("/networks/{network}/test", get(monitoring::test_network))
        .route("/networks/{network}/token-info", get(monitoring::token_info));

    let balances = Router::new()
        .route("/", get(balances::list_snapshots))
        .route("/latest", get(balances::latest))
        .route("/history/{wallet}/{network}", get(balances::history))
        .route("/summary", get(balances::summary))
        .route("/periodic", get(balances::periodic))
        .route("/chart-data", get(balances::chart_data))
        .route("/time-series", get(balances::time_series))
        .route("/wallet-time-series/{wallet}", get(balances::wallet_time_series))
        .route("/networks", get(balances::networks))
        .route("/wallets", get(balances::wallets));

    Router::new()
        .route("/health", get(health))
        .nest("/api/monitoring", monitoring)
        .nest("/api/balances", balances)
        .with_state(state)
}

/// `{"success": true, "data": ...}`
#[derive(Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(message) => Self::bad_request(message),
            StoreError::Persistence(err) => {
                tracing::error!(error = %format!("{err:#}"), "storage error while serving request");
                Self::internal("storage error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// `Query` whose rejection is reported in the error envelope.
#[derive(Debug)]
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        Ok(Self(value))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _state) = test_app().await;
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_i64().unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (app, _state) = test_app().await;
        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_store_errors_map_to_status_codes() {
        let bad: ApiError = StoreError::validation("limit too large").into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        let internal: ApiError = StoreError::Persistence(anyhow::anyhow!("disk full")).into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.message, "storage error");
    }
}
