//! Loopback HTTP API.
//!
//! A thin transport over the runtime: request demux, the bearer-token
//! gate, and JSON shaping. `send*` handlers bridge onto blocking worker
//! threads so callers can sit on the filetransfer condition gates without
//! stalling the async executor; the observable contract (boolean outcome
//! within the configured waits) is unchanged.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::SidecarConfig;
use crate::dispatch::{MediaRequest, SendError, StatusRequest};
use crate::runtime::Sidecar;

#[derive(Clone)]
pub struct AppState {
    sidecar: Arc<Sidecar>,
    token: Option<String>,
}

pub fn router(sidecar: Arc<Sidecar>, token: Option<String>) -> Router {
    let state = AppState { sidecar, token };
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .route("/sendText", post(send_text_handler))
        .route("/sendMedia", post(send_media_handler))
        .route("/sendStatus", post(send_status_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(state.clone(), token_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until SIGINT/SIGTERM.
pub async fn serve(sidecar: Arc<Sidecar>, config: &SidecarConfig) -> anyhow::Result<()> {
    let app = router(sidecar, config.token.clone());
    let bind_addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("sidecar API listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn token_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(token) = &state.token {
        let expected = format!("Bearer {}", token);
        let supplied = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if supplied != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "unauthorized"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "userId": state.sidecar.user_id(),
        "address": state.sidecar.address(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let counters = state.sidecar.counters();
    Json(json!({
        "ok": true,
        "ready": state.sidecar.is_ready(),
        "connected": state.sidecar.is_connected(),
        "lastPeer": counters.last_peer,
        "lastOnlineTs": counters.last_online_ts,
        "lastOfflineTs": counters.last_offline_ts,
        "onlineCount": counters.online_count,
        "offlineCount": counters.offline_count,
    }))
}

async fn events_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sidecar.drain_events())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SendTextBody {
    peer: String,
    text: String,
}

async fn send_text_handler(
    State(state): State<AppState>,
    Json(body): Json<SendTextBody>,
) -> Response {
    let sidecar = state.sidecar.clone();
    let result =
        tokio::task::spawn_blocking(move || sidecar.send_text(&body.peer, &body.text)).await;
    send_outcome(result)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SendMediaBody {
    peer: String,
    caption: String,
    media_path: String,
    media_url: String,
    media_type: String,
    filename: String,
    out_format: String,
}

async fn send_media_handler(
    State(state): State<AppState>,
    Json(body): Json<SendMediaBody>,
) -> Response {
    let request = MediaRequest {
        peer: body.peer,
        caption: body.caption,
        media_path: body.media_path,
        media_url: body.media_url,
        media_type: body.media_type,
        filename: body.filename,
        out_format: body.out_format,
    };
    let sidecar = state.sidecar.clone();
    let result = tokio::task::spawn_blocking(move || sidecar.send_media(&request)).await;
    send_outcome(result)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SendStatusBody {
    peer: String,
    state: String,
    phase: String,
    ttl_ms: i64,
    chat_type: String,
    group_user_id: String,
    group_address: String,
    group_name: String,
    seq: String,
}

async fn send_status_handler(
    State(state): State<AppState>,
    Json(body): Json<SendStatusBody>,
) -> Response {
    let request = StatusRequest {
        peer: body.peer,
        state: body.state,
        phase: body.phase,
        ttl_ms: body.ttl_ms,
        chat_type: body.chat_type,
        group_user_id: body.group_user_id,
        group_address: body.group_address,
        group_name: body.group_name,
        seq: body.seq,
    };
    let sidecar = state.sidecar.clone();
    let result = tokio::task::spawn_blocking(move || sidecar.send_status(&request)).await;
    send_outcome(result)
}

async fn not_found_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"ok": false, "error": "not_found"})),
    )
        .into_response()
}

/// Collapse a send outcome to the wire shape: the structured error kind
/// goes to the log, the caller sees a boolean.
fn send_outcome(result: Result<Result<(), SendError>, tokio::task::JoinError>) -> Response {
    match result {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({"ok": true}))).into_response(),
        Ok(Err(e)) => {
            tracing::warn!("send failed ({}): {}", e.kind(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("send worker panicked: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackHub;
    use crate::transport::TransportEvents;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::util::ServiceExt;

    fn test_sidecar() -> (tempfile::TempDir, Arc<Sidecar>) {
        let dir = tempfile::tempdir().unwrap();
        let config = SidecarConfig {
            data_dir: dir.path().to_path_buf(),
            relay_url: "http://127.0.0.1:9".to_string(),
            ..SidecarConfig::default()
        };
        let hub = LoopbackHub::new();
        let endpoint = hub.endpoint("peer-self", "addr-self");
        let sidecar = Sidecar::start(&config, endpoint.clone()).unwrap();
        endpoint.bind(sidecar.clone());
        (dir, sidecar)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_health_and_status() {
        let (_dir, sidecar) = test_sidecar();
        let app = router(sidecar, None);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/health")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["ok"], true);
            assert_eq!(json["userId"], "peer-self");

            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/status")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let json = body_json(response).await;
            assert_eq!(json["ok"], true);
            assert!(json.get("lastPeer").is_some());
            assert!(json.get("onlineCount").is_some());
        });
    }

    #[test]
    fn test_token_gate() {
        let (_dir, sidecar) = test_sidecar();
        let app = router(sidecar, Some("s3cret".into()));

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/events")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let json = body_json(response).await;
            assert_eq!(json["error"], "unauthorized");

            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/events")
                        .header("Authorization", "Bearer s3cret")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        });
    }

    #[test]
    fn test_events_drained_once() {
        let (_dir, sidecar) = test_sidecar();
        sidecar.on_friend_message("peer-x", b"ping", "m1", 100, false);
        let app = router(sidecar, None);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/events")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let json = body_json(response).await;
            assert_eq!(json.as_array().unwrap().len(), 1);
            assert_eq!(json[0]["peer"], "peer-x");
            assert_eq!(json[0]["text"], "ping");

            // Second poll: already drained.
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/events")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let json = body_json(response).await;
            assert_eq!(json.as_array().unwrap().len(), 0);
        });
    }

    #[test]
    fn test_unknown_route_404() {
        let (_dir, sidecar) = test_sidecar();
        let app = router(sidecar, None);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let response = app
                .oneshot(
                    HttpRequest::builder()
                        .uri("/nope")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let json = body_json(response).await;
            assert_eq!(json["error"], "not_found");
        });
    }

    #[test]
    fn test_send_text_to_unreachable_peer_reports_false() {
        let (_dir, sidecar) = test_sidecar();
        let app = router(sidecar, None);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let response = app
                .oneshot(
                    HttpRequest::builder()
                        .method("POST")
                        .uri("/sendText")
                        .header("Content-Type", "application/json")
                        .body(Body::from(r#"{"peer":"nobody","text":"hi"}"#))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let json = body_json(response).await;
            assert_eq!(json["ok"], false);
        });
    }
}
