//! Loopback HTTP server for the authorization gateway.
//!
//! Binds `127.0.0.1:<port>` only. Legacy endpoints authenticate with the
//! `X-Auth-Token` header; the mounted `/api/v1` sub-router authenticates
//! with `Authorization: Bearer` carrying the same token. `/health` and
//! `/api/v1/health` are open.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::state::GatewayState;
use crate::{AppError, Result};

#[derive(Debug, Deserialize)]
struct ToolCallBody {
    tool_name: String,
    #[serde(default)]
    tool_input: Value,
}

#[derive(Debug, Deserialize)]
struct SetTaskBody {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct AskBody {
    question: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    context: Option<String>,
}

/// Serve the gateway until the cancellation token fires, then delete the
/// token file and resolve in-flight hook calls as denials.
///
/// `api` is the `/api/v1` sub-router provided by the HTTP polling channel;
/// its secured routes must already carry [`bearer_auth`].
///
/// # Errors
///
/// Returns `AppError::Gateway` if the listener cannot bind or the server
/// errors.
pub async fn serve(
    state: Arc<GatewayState>,
    api: Option<Router>,
    ct: CancellationToken,
) -> Result<()> {
    state.write_token_file().await?;

    let legacy = Router::new()
        .route("/approve", post(approve))
        .route("/notify-tool", post(notify_tool))
        .route("/set-task", post(set_task))
        .route("/ask", post(ask))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            legacy_auth,
        ));

    let mut router = Router::new()
        .route("/health", get(health))
        .merge(legacy)
        .with_state(Arc::clone(&state));
    if let Some(api) = api {
        router = router.nest("/api/v1", api);
    }

    let bind = SocketAddr::from(([127, 0, 0, 1], state.port()));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Gateway(format!("failed to bind gateway on {bind}: {err}")))?;
    info!(%bind, "authorization gateway listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
        })
        .await
        .map_err(|err| AppError::Gateway(format!("gateway server error: {err}")))?;

    shutdown_state.shutdown().await;
    info!("authorization gateway shut down");
    Ok(())
}

/// `X-Auth-Token` guard for the legacy endpoints.
pub async fn legacy_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("X-Auth-Token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !state.verify_token(presented) {
        return unauthorized();
    }
    next.run(request).await
}

/// `Authorization: Bearer` guard for the `/api/v1` sub-router.
pub async fn bearer_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("");
    if !state.verify_token(presented) {
        return unauthorized();
    }
    next.run(request).await
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}

fn bad_request(rejection: &JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": rejection.body_text() })),
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn approve(
    State(state): State<Arc<GatewayState>>,
    body: std::result::Result<Json<ToolCallBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection),
    };
    let reply = state.approve(&body.tool_name, &body.tool_input).await;
    let mut payload = json!({ "permissionDecision": reply.decision.to_string() });
    if let Some(message) = reply.message {
        payload["message"] = Value::String(message);
    }
    Json(payload).into_response()
}

async fn notify_tool(
    State(state): State<Arc<GatewayState>>,
    body: std::result::Result<Json<ToolCallBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection),
    };
    // Fire-and-forget: the hook must never block on channel delivery.
    tokio::spawn(async move {
        state.notify_tool(&body.tool_name, &body.tool_input).await;
    });
    Json(json!({ "ok": true })).into_response()
}

async fn set_task(
    State(state): State<Arc<GatewayState>>,
    body: std::result::Result<Json<SetTaskBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection),
    };
    state.set_current_task(&body.task_id, None, None).await;
    Json(json!({ "ok": true })).into_response()
}

async fn ask(
    State(state): State<Arc<GatewayState>>,
    body: std::result::Result<Json<AskBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection),
    };
    match state
        .ask(&body.question, &body.options, body.context.as_deref())
        .await
    {
        Ok(answer) => Json(json!({ "answer": answer })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}
