use crate::server::{
    pool::{
        manager::{PoolManager, SubmitError},
        worker::Echo,
    },
    telemetry,
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use stevedore::{MetricsSnapshot, PoolState, metrics};

#[derive(Clone)]
pub struct AppState {
    manager: Arc<PoolManager>,
}

/// Builds the service's routes.
///
/// - `POST /work`: run the body as a job and return its [`Echo`].
/// - `POST /work/async`: queue the body and return `202 Accepted`.
/// - `GET /debug/vars`: every published pool's counters, keyed by name.
/// - `GET /health`: `200 ok` while the pool accepts work.
pub fn router(manager: Arc<PoolManager>) -> Router {
    Router::new()
        .route("/work", post(work))
        .route("/work/async", post(work_async))
        .route("/debug/vars", get(debug_vars))
        .route("/health", get(health))
        .with_state(AppState { manager })
}

async fn work(State(state): State<AppState>, payload: String) -> Result<Json<Echo>, SubmitError> {
    let start = Instant::now();
    let res = state.manager.submit(payload).await;
    telemetry::record_request("/work", start.elapsed(), res.is_ok());
    res.map(Json)
}

async fn work_async(
    State(state): State<AppState>,
    payload: String,
) -> Result<StatusCode, SubmitError> {
    let start = Instant::now();
    let res = state.manager.submit_detached(payload);
    telemetry::record_request("/work/async", start.elapsed(), res.is_ok());
    res?;
    Ok(StatusCode::ACCEPTED)
}

async fn debug_vars() -> Json<BTreeMap<String, MetricsSnapshot>> {
    Json(metrics::published().into_iter().collect())
}

async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.manager.state() {
        PoolState::Open => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    }
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Pool(stevedore::Error::Timeout { .. }) => StatusCode::REQUEST_TIMEOUT,
            Self::Pool(stevedore::Error::PoolClosed) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Pool(_) | Self::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        #[cfg(feature = "tracing")]
        {
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!("Job failed: {self}");
            } else {
                tracing::debug!("Job rejected: {self}");
            }
        }

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use core::time::Duration;
    use tower::ServiceExt;

    fn manager(delay_ms: u64, timeout_ms: u64, name: &str) -> Arc<PoolManager> {
        let config = ServerConfig {
            server_addr: "127.0.0.1:0".to_string(),
            num_workers: 2,
            job_delay: Duration::from_millis(delay_ms),
            job_timeout: Duration::from_millis(timeout_ms),
            metrics_name: name.to_string(),
        };
        Arc::new(PoolManager::open(&config).unwrap())
    }

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(res: Response) -> String {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn work_echoes_payload() {
        let manager = manager(0, 1_000, "handler-echo");
        let res = router(Arc::clone(&manager))
            .oneshot(post("/work", "hello"))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let echo: serde_json::Value = serde_json::from_str(&body_text(res).await).unwrap();
        assert_eq!(echo["payload"], "hello");
        assert_eq!(echo["served"], 1);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_error_is_internal() {
        let manager = manager(0, 1_000, "handler-error");
        let res = router(Arc::clone(&manager))
            .oneshot(post("/work", ""))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(res).await.contains("Payload must not be empty"));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_job_times_out() {
        let manager = manager(2_000, 50, "handler-timeout");
        let res = router(Arc::clone(&manager))
            .oneshot(post("/work", "slow"))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::REQUEST_TIMEOUT);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_pool_is_unavailable() {
        let manager = manager(0, 1_000, "handler-closed");
        manager.shutdown().await.unwrap();
        let app = router(Arc::clone(&manager));

        let res = app.clone().oneshot(post("/work", "late")).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let res = app.clone().oneshot(post("/work/async", "late")).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let res = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_work_is_accepted_and_counted() {
        let manager = manager(0, 1_000, "handler-async");
        let app = router(Arc::clone(&manager));

        let res = app.clone().oneshot(post("/work/async", "later")).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = app.oneshot(get("/debug/vars")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let vars: serde_json::Value = serde_json::from_str(&body_text(res).await).unwrap();
        assert_eq!(vars["handler-async"]["workers"], 2);
        assert_eq!(vars["handler-async"]["submitted"], 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_reports_ok() {
        let manager = manager(0, 1_000, "handler-health");
        let res = router(Arc::clone(&manager))
            .oneshot(get("/health"))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_text(res).await, "ok");
        manager.shutdown().await.unwrap();
    }
}
