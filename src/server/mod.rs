//! HTTP boundary of the runner.
//!
//! - `POST /execute` validate, then run one command
//! - `GET /health`   liveness, answers without touching the sandbox
//! - `GET /readyz`   dependency readiness (200 when ready, 503 otherwise)
//!
//! Every response carries an `x-correlation-id` header: the inbound one
//! when the caller sent a usable value, a fresh one otherwise.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Instrument};

use crate::correlation::{CorrelationId, CORRELATION_HEADER};
use crate::error::RunnerError;
use crate::health::{HealthAggregator, Readiness};
use crate::sandbox::{ExecuteRequest, ExecutionResult, ExecutionService};

/// Shared, read-only state of the API.
#[derive(Clone)]
pub struct ServerState {
    pub service: Arc<ExecutionService>,
    pub health: Arc<HealthAggregator>,
}

/// Error body for every non-2xx response from this service.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

pub struct RunnerApi;

impl RunnerApi {
    pub fn router(state: ServerState) -> Router {
        Router::new()
            .route("/execute", post(execute))
            .route("/health", get(health_check))
            .route("/readyz", get(readiness))
            .layer(middleware::from_fn(correlation_layer))
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(
                handle_panic as fn(Box<dyn std::any::Any + Send + 'static>) -> Response,
            ))
            .with_state(state)
    }

    /// Binds `addr` and serves until `shutdown` resolves.
    pub async fn serve(
        state: ServerState,
        addr: &str,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Runner API listening on {}", listener.local_addr()?);

        axum::serve(listener, Self::router(state))
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

// -- Middleware --

async fn correlation_layer(mut request: Request, next: Next) -> Response {
    let correlation_id = CorrelationId::from_header(
        request
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    request.extensions_mut().insert(correlation_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(panic_message = %message, "Handler panicked");
    internal_error_response()
}

fn internal_error_response() -> Response {
    let body = ErrorBody {
        error: "internal error".to_string(),
        code: "internal_error",
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = match &self {
            RunnerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RunnerError::ExecutionSetup(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RunnerError::Internal(e) => {
                error!("Internal error: {e:#}");
                return internal_error_response();
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

// -- Handlers --

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn readiness(State(state): State<ServerState>) -> (StatusCode, Json<Readiness>) {
    let readiness = state.health.check_readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

async fn execute(
    State(state): State<ServerState>,
    Extension(correlation_id): Extension<CorrelationId>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, RunnerError> {
    let Json(request) = payload
        .map_err(|e| RunnerError::invalid_input(format!("malformed request: {}", e.body_text())))?;

    let span = info_span!("execute", correlation_id = %correlation_id);
    let result = state
        .service
        .execute(request, &correlation_id)
        .instrument(span)
        .await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::SandboxConfig;
    use crate::health::Dependency;
    use crate::sandbox::{Policy, TIMEOUT_EXIT_CODE};

    fn state_for(root: &Path, dependencies: Vec<Dependency>) -> ServerState {
        let allow = vec!["sh".to_string(), "python".to_string()];
        let service = ExecutionService::new(
            Policy::new(root, &allow).unwrap(),
            Duration::from_secs(30),
            4,
        );
        let health = HealthAggregator::new(
            dependencies,
            Duration::from_millis(100),
            0,
            Duration::ZERO,
        );
        ServerState {
            service: Arc::new(service),
            health: Arc::new(health),
        }
    }

    fn post_json(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    // -- Liveness / readiness --

    #[tokio::test]
    async fn health_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn readyz_is_503_when_required_dependency_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let deps = vec![Dependency {
            name: "llm".to_string(),
            required: true,
            probe: None,
        }];
        let router = RunnerApi::router(state_for(dir.path(), deps));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            json_body(resp).await,
            json!({"ready": false, "llm": "not_configured"})
        );
    }

    #[tokio::test]
    async fn readyz_is_200_without_required_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let deps = vec![Dependency {
            name: "vector_store".to_string(),
            required: false,
            probe: None,
        }];
        let router = RunnerApi::router(state_for(dir.path(), deps));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["ready"], true);
    }

    // -- Correlation --

    #[tokio::test]
    async fn inbound_correlation_id_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = Request::builder()
            .uri("/health")
            .header(CORRELATION_HEADER, "trace-123")
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()[CORRELATION_HEADER], "trace-123");
    }

    #[tokio::test]
    async fn missing_correlation_id_is_generated() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({"target_directory": "/etc", "command": ["python3"]}));

        let resp = router.oneshot(req).await.unwrap();
        let id = resp.headers()[CORRELATION_HEADER].to_str().unwrap();
        assert_eq!(id.len(), 32);
    }

    // -- Execute --

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_returns_contract_fields() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({
            "target_directory": dir.path(),
            "command": ["sh", "-c", "echo hi"]
        }));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let data = json_body(resp).await;
        assert_eq!(data["exit_code"], 0);
        assert_eq!(data["stdout"], "hi\n");
        assert_eq!(data["stderr"], "");
        assert!(data["duration_seconds"].as_f64().unwrap() >= 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_python_with_default_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = SandboxConfig {
            allowed_root: dir.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        let state = ServerState {
            service: Arc::new(ExecutionService::from_config(&sandbox).unwrap()),
            health: Arc::new(HealthAggregator::new(vec![], Duration::from_secs(1), 0, Duration::ZERO)),
        };
        let router = RunnerApi::router(state);
        let req = post_json(json!({
            "target_directory": dir.path(),
            "command": ["python3", "-c", "pass"]
        }));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let data = json_body(resp).await;
        assert_eq!(data["exit_code"], 0);
        assert_eq!(data["stdout"], "");
        assert_eq!(data["stderr"], "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_timeout_is_a_result_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({
            "project_path": dir.path(),
            "command": ["sh", "-c", "echo started; sleep 30"],
            "timeout_seconds": 1
        }));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let data = json_body(resp).await;
        assert_eq!(data["exit_code"], TIMEOUT_EXIT_CODE);
        assert_eq!(data["stdout"], "started\n");
        assert_eq!(data["stderr"], " (timeout)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_rejects_directory_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({"target_directory": "/etc", "command": ["python3", "-c", "pass"]}));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let data = json_body(resp).await;
        assert_eq!(data["code"], "invalid_input");
        assert!(data["error"].is_string());
    }

    #[tokio::test]
    async fn execute_rejects_command_not_in_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({"target_directory": dir.path(), "command": ["rm", "-rf", "/"]}));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let data = json_body(resp).await;
        assert_eq!(data["code"], "invalid_input");
        assert_eq!(data["error"], "command executable not in allowlist");
    }

    #[tokio::test]
    async fn execute_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({"target_directory": dir.path(), "command": []}));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "invalid_input");
    }

    #[tokio::test]
    async fn execute_rejects_malformed_body() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "invalid_input");
    }

    #[tokio::test]
    async fn execute_rejects_zero_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({
            "target_directory": dir.path(),
            "command": ["python3"],
            "timeout_seconds": 0
        }));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_setup_error_does_not_leak_details() {
        let dir = tempfile::tempdir().unwrap();
        let router = RunnerApi::router(state_for(dir.path(), vec![]));
        let req = post_json(json!({
            "target_directory": dir.path(),
            "command": ["python-does-not-exist-4711", "secret-arg"]
        }));

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let data = json_body(resp).await;
        assert_eq!(data["code"], "execution_setup_error");
        let text = data["error"].as_str().unwrap();
        assert!(!text.contains("secret-arg"));
        assert!(!text.contains("python-does-not-exist"));
    }

    // -- Error mapping --

    #[tokio::test]
    async fn internal_error_hides_details() {
        let err = RunnerError::from(anyhow::anyhow!("/secret/path exploded"));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let data = json_body(resp).await;
        assert_eq!(data, json!({"error": "internal error", "code": "internal_error"}));
    }

    #[tokio::test]
    async fn panic_handler_returns_generic_error() {
        let resp = handle_panic(Box::new("index out of bounds".to_string()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await["code"], "internal_error");
    }
}
