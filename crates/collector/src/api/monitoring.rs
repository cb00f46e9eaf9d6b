use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::{ok, ApiError, ApiResult, AppState};
use crate::chain::TokenInfo;
use crate::monitor::MonitorStatus;

const DEFAULT_RETENTION_DAYS: u32 = 30;

/// An empty body means "all defaults".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

#[derive(Serialize)]
pub struct Message {
    pub message: String,
}

fn message(text: impl Into<String>) -> Message {
    Message {
        message: text.into(),
    }
}

pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<MonitorStatus> {
    Ok(ok(state.monitor.status().await))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub cron_pattern: Option<String>,
}

pub async fn start(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Message> {
    let req: StartRequest = parse_body(&body)?;
    let pattern = req
        .cron_pattern
        .unwrap_or_else(|| state.default_schedule.clone());
    let started = state
        .monitor
        .start_monitoring(&pattern)
        .await
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(ok(message(if started {
        "monitoring started"
    } else {
        "monitoring already started"
    })))
}

pub async fn stop(State(state): State<Arc<AppState>>) -> ApiResult<Message> {
    let stopped = state.monitor.stop_monitoring().await.map_err(|e| {
        tracing::error!(error = %format!("{e:#}"), "failed to stop monitoring");
        ApiError::internal("failed to stop monitoring")
    })?;
    Ok(ok(message(if stopped {
        "monitoring stopped"
    } else {
        "monitoring was not running"
    })))
}

pub async fn trigger(State(state): State<Arc<AppState>>) -> ApiResult<Message> {
    state.monitor.trigger_balance_fetch();
    Ok(ok(message("balance fetch triggered")))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    pub days_to_keep: Option<u32>,
}

#[derive(Serialize)]
pub struct CleanupResult {
    pub deleted: usize,
    pub days_to_keep: u32,
}

pub async fn cleanup(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<CleanupResult> {
    let req: CleanupRequest = parse_body(&body)?;
    let days_to_keep = req.days_to_keep.unwrap_or(DEFAULT_RETENTION_DAYS);
    let deleted = state.monitor.cleanup_old_data(days_to_keep).await?;
    Ok(ok(CleanupResult {
        deleted,
        days_to_keep,
    }))
}

/// 200 when every network answers, 503 otherwise.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let report = state.monitor.health().await?;
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((code, ok(report)).into_response())
}

pub async fn test_all_networks(
    State(state): State<Arc<AppState>>,
) -> ApiResult<BTreeMap<String, bool>> {
    Ok(ok(state.monitor.test_all_connections().await))
}

#[derive(Serialize)]
pub struct ConnectionResult {
    pub network: String,
    pub connected: bool,
}

pub async fn test_network(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
) -> ApiResult<ConnectionResult> {
    let connected = state
        .monitor
        .test_connection(&network)
        .await
        .ok_or_else(|| ApiError::not_found(format!("unknown network '{network}'")))?;
    Ok(ok(ConnectionResult { network, connected }))
}

pub async fn token_info(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
) -> ApiResult<TokenInfo> {
    let descriptor = state
        .monitor
        .network(&network)
        .ok_or_else(|| ApiError::not_found(format!("unknown network '{network}'")))?;
    match state.monitor.token_info(descriptor).await {
        Ok(Some(info)) => Ok(ok(info)),
        Ok(None) => Err(ApiError::not_found(format!(
            "network '{network}' uses its native currency"
        ))),
        Err(e) => {
            tracing::warn!(network = %network, error = %e, "token info lookup failed");
            Err(ApiError::internal(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use axum::Router;
    use tower::ServiceExt;

    async fn call(
        app: Router,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    #[test]
    fn test_parse_body_defaults_on_empty() {
        let req: CleanupRequest = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert_eq!(req.days_to_keep, None);
        let req: CleanupRequest = parse_body(&Bytes::from_static(b"{\"days_to_keep\":7}")).unwrap();
        assert_eq!(req.days_to_keep, Some(7));
        assert!(parse_body::<CleanupRequest>(&Bytes::from_static(b"{oops")).is_err());
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let (app, state) = test_app().await;

        let (status, json) = call(app.clone(), Method::POST, "/api/monitoring/start", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["message"], "monitoring started");

        let (_, json) = call(app.clone(), Method::POST, "/api/monitoring/start", "").await;
        assert_eq!(json["data"]["message"], "monitoring already started");

        let (_, json) = call(app.clone(), Method::GET, "/api/monitoring/status", "").await;
        assert_eq!(json["data"]["is_monitoring"], true);
        assert_eq!(json["data"]["schedule"], "0 * * * * *");

        let (_, json) = call(app.clone(), Method::POST, "/api/monitoring/stop", "").await;
        assert_eq!(json["data"]["message"], "monitoring stopped");
        let (_, json) = call(app, Method::POST, "/api/monitoring/stop", "").await;
        assert_eq!(json["data"]["message"], "monitoring was not running");
        assert!(!state.monitor.status().await.is_monitoring);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_pattern() {
        let (app, _state) = test_app().await;
        let (status, json) = call(
            app,
            Method::POST,
            "/api/monitoring/start",
            r#"{"cron_pattern":"every minute"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_cleanup_defaults_and_validation() {
        let (app, _state) = test_app().await;
        let (status, json) = call(app.clone(), Method::POST, "/api/monitoring/cleanup", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["days_to_keep"], 30);
        assert_eq!(json["data"]["deleted"], 0);

        let (status, _) = call(
            app,
            Method::POST,
            "/api/monitoring/cleanup",
            r#"{"days_to_keep":0}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_stores_a_cycle() {
        let (app, state) = test_app().await;
        let (status, _) = call(app, Method::POST, "/api/monitoring/trigger", "").await;
        assert_eq!(status, StatusCode::OK);

        let mut stored = 0;
        for _ in 0..50 {
            stored = state.store.latest_balances().await.unwrap().len();
            if stored == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(stored, 2);
    }

    #[tokio::test]
    async fn test_connection_checks() {
        let (app, _state) = test_app().await;

        let (status, json) = call(app.clone(), Method::GET, "/api/monitoring/networks/test", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["EDGEN"], true);
        assert_eq!(json["data"]["BSC"], false);

        let (_, json) = call(app.clone(), Method::GET, "/api/monitoring/networks/EDGEN/test", "").await;
        assert_eq!(json["data"]["connected"], true);

        let (status, _) = call(app, Method::GET, "/api/monitoring/networks/SOL/test", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_unreachable_network() {
        let (app, _state) = test_app().await;
        let (status, json) = call(app, Method::GET, "/api/monitoring/health", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["data"]["healthy"], false);
        assert_eq!(json["data"]["networks"]["EDGEN"], true);
    }

    #[tokio::test]
    async fn test_token_info_errors() {
        let (app, _state) = test_app().await;
        let (status, _) = call(app.clone(), Method::GET, "/api/monitoring/networks/EDGEN/token-info", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app.clone(), Method::GET, "/api/monitoring/networks/SOL/token-info", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        // BSC has no endpoint configured.
        let (status, json) = call(app, Method::GET, "/api/monitoring/networks/BSC/token-info", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["success"], false);
    }
}
