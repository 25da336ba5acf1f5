use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::error::ToolError;
use crate::events::{now_iso, Broadcaster, Frame, StatusEvent};
use crate::tools::{self, Tool};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub events: Arc<Broadcaster>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let events = Arc::clone(dispatcher.events());
        Self { dispatcher, events }
    }
}

/// Normalized tool response.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<Value, ToolError>> for Envelope {
    fn from(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(data) => Envelope {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Envelope {
                success: false,
                data: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Flatten a tool result into an HTTP response. Handler failures still answer
/// `200` so the calling platform does not retry; routing failures are `400`.
fn respond(result: Result<Value, ToolError>) -> Response {
    match result {
        Err(e @ ToolError::UnknownTool(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": e.to_string(),
                "available_tools": Tool::names(),
            })),
        )
            .into_response(),
        Err(e) if e.is_routing() => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
        other => (StatusCode::OK, Json(Envelope::from(other))).into_response(),
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/elevenlabs/webhook", post(webhook_handler).get(health_handler))
        .route("/health", get(health_handler))
        .route("/api/elevenlabs/tools", get(tools_handler))
        .route(
            "/api/elevenlabs/log-conversation",
            post(|state: State<AppState>, body: Bytes| {
                tool_handler(Tool::LogConversation, state, body)
            }),
        )
        .route(
            "/api/elevenlabs/get-repo-tree",
            post(|state: State<AppState>, body: Bytes| {
                tool_handler(Tool::GetRepoTree, state, body)
            }),
        )
        .route(
            "/api/elevenlabs/read-file-content",
            post(|state: State<AppState>, body: Bytes| {
                tool_handler(Tool::ReadFileContent, state, body)
            }),
        )
        .route(
            "/api/elevenlabs/create-github-issue",
            post(|state: State<AppState>, body: Bytes| {
                tool_handler(Tool::CreateGithubIssue, state, body)
            }),
        )
        .route("/api/sse/conversation", get(sse_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Parse a request body as JSON. An empty body counts as `{}`.
fn parse_body(body: &Bytes) -> Result<Value, ToolError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| ToolError::InvalidPayload(e.to_string()))
}

/// Status line broadcast for any handler failure on the webhook route.
pub const WEBHOOK_FAILURE_STATUS: &str = "An error occurred during investigation";

/// Routed entry point: explicit `tool_name` or auto-detected from parameters.
async fn webhook_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let result = match parse_body(&body).and_then(tools::resolve) {
        Ok((tool, params)) => state.dispatcher.run(tool, params).await,
        Err(e) => Err(e),
    };
    match &result {
        Err(e) if e.is_routing() => tracing::warn!(error = %e, "Webhook routing failed"),
        Err(e) => state.dispatcher.report_failure(WEBHOOK_FAILURE_STATUS, e),
        Ok(_) => {}
    }
    respond(result)
}

/// One endpoint per tool; the body is the tool's parameters.
async fn tool_handler(tool: Tool, State(state): State<AppState>, body: Bytes) -> Response {
    let result = match parse_body(&body) {
        Ok(params) => state.dispatcher.invoke(tool, params).await,
        Err(e) => {
            state.dispatcher.report_failure(tool.failure_status(), &e);
            Err(e)
        }
    };
    respond(result)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "operational",
        "tools": Tool::names(),
        "subscribers": state.events.subscriber_count(),
        "timestamp": now_iso(),
    }))
}

async fn tools_handler() -> impl IntoResponse {
    let tools: Vec<Value> = Tool::ALL
        .iter()
        .map(|t| {
            json!({
                "name": t.name(),
                "description": t.description(),
                "parameters": t.input_schema(),
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}

/// Unsubscribes when the response stream is dropped. Holds only a weak
/// handle so the stream ends once the broadcaster lets go of the sender.
struct SubscriptionGuard {
    events: Arc<Broadcaster>,
    subscriber: mpsc::WeakUnboundedSender<Frame>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        tracing::debug!("SSE stream closed");
        if let Some(subscriber) = self.subscriber.upgrade() {
            self.events.unsubscribe(&subscriber);
        }
    }
}

/// Register a subscriber and return its frame stream, starting with a
/// `connected` event.
pub fn open_stream(events: Arc<Broadcaster>) -> impl Stream<Item = Frame> + Send {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(json) = serde_json::to_string(&StatusEvent::connected()) {
        // The receiver is alive here, so this cannot fail.
        let _ = tx.send(Frame::Data(json));
    }
    let guard = SubscriptionGuard {
        events: Arc::clone(&events),
        subscriber: tx.downgrade(),
    };
    events.subscribe(tx);

    UnboundedReceiverStream::new(rx).map(move |frame| {
        let _keep = &guard;
        frame
    })
}

async fn sse_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stream = open_stream(Arc::clone(&state.events)).map(Frame::into_sse);
    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(stream),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::{entry, FakeHost};
    use crate::dispatch::DEFAULT_REPORTER;
    use crate::events::EventType;
    use crate::host::EntryKind;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_state(host: FakeHost) -> AppState {
        let events = Arc::new(Broadcaster::new());
        let dispatcher = Dispatcher::new(Arc::new(host), events, DEFAULT_REPORTER.to_string());
        AppState::new(dispatcher)
    }

    fn sample_host() -> FakeHost {
        FakeHost {
            tree: vec![
                entry("src", EntryKind::Dir),
                entry("src/a.js", EntryKind::File),
            ],
            ..Default::default()
        }
        .with_file("src/a.js", "1\n2\n3\n4\n5")
    }

    async fn post_json(state: &AppState, uri: &str, body: &str) -> (StatusCode, Value) {
        let response = build_router(state.clone())
            .oneshot(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_webhook_auto_detects_log_conversation() {
        let state = make_state(sample_host());
        let (status, body) = post_json(
            &state,
            "/api/elevenlabs/webhook",
            r#"{"status":"s","type":"info"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "data": {"status": "s", "type": "info"}}));
    }

    #[tokio::test]
    async fn test_webhook_explicit_tool_name() {
        let state = make_state(sample_host());
        let (status, body) = post_json(
            &state,
            "/api/elevenlabs/webhook",
            r#"{"tool_name":"read_file_content","parameters":{"file_path":"src/a.js","start_line":2,"end_line":3}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["content"], "2\n3");
    }

    #[tokio::test]
    async fn test_webhook_undeterminable_is_400() {
        let state = make_state(sample_host());
        let (status, body) = post_json(&state, "/api/elevenlabs/webhook", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Could not determine tool_name"));
    }

    #[tokio::test]
    async fn test_webhook_unknown_tool_lists_tools() {
        let state = make_state(sample_host());
        let (status, body) = post_json(
            &state,
            "/api/elevenlabs/webhook",
            r#"{"tool_name":"drop_tables","parameters":{}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Unknown tool: drop_tables");
        assert_eq!(body["available_tools"], json!(Tool::names()));
    }

    #[tokio::test]
    async fn test_webhook_invalid_json_is_enveloped() {
        let state = make_state(sample_host());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.events.subscribe(tx);

        let (status, body) = post_json(&state, "/api/elevenlabs/webhook", "{not json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);

        match rx.try_recv().unwrap() {
            Frame::Data(json) => {
                let event: StatusEvent = serde_json::from_str(&json).unwrap();
                assert_eq!(event.kind, EventType::Error);
            }
            Frame::Heartbeat => panic!("expected error event"),
        }
    }

    #[tokio::test]
    async fn test_tool_endpoint_failure_is_200() {
        let state = make_state(sample_host());
        let (status, body) =
            post_json(&state, "/api/elevenlabs/log-conversation", r#"{"type":"info"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("required"));
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_tool_endpoints_reachable() {
        let state = make_state(sample_host());

        let (_, tree) = post_json(&state, "/api/elevenlabs/get-repo-tree", "").await;
        assert_eq!(tree["data"]["total_files"], 1);

        let (_, file) = post_json(
            &state,
            "/api/elevenlabs/read-file-content",
            r#"{"file_path":"src/a.js"}"#,
        )
        .await;
        assert_eq!(file["data"]["content"], "1\n2\n3\n4\n5");

        let (_, issue) = post_json(
            &state,
            "/api/elevenlabs/create-github-issue",
            r#"{"title":"t","body":"b","labels":["bug","bug"]}"#,
        )
        .await;
        assert_eq!(issue["success"], true);
        assert_eq!(
            issue["data"]["labels"],
            json!(["bug", "priority: medium", "customer-reported"])
        );
    }

    #[tokio::test]
    async fn test_health_lists_tools() {
        let state = make_state(sample_host());
        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "operational");
        assert_eq!(body["tools"], json!(Tool::names()));
    }

    #[tokio::test]
    async fn test_open_stream_starts_with_connected_and_unsubscribes_on_drop() {
        let events = Arc::new(Broadcaster::new());
        let mut stream = Box::pin(open_stream(Arc::clone(&events)));
        assert_eq!(events.subscriber_count(), 1);

        events.broadcast(StatusEvent::new("later", EventType::Info));

        let first = match stream.next().await.unwrap() {
            Frame::Data(json) => serde_json::from_str::<StatusEvent>(&json).unwrap(),
            Frame::Heartbeat => panic!("expected connected event"),
        };
        assert_eq!(first.kind, EventType::Connected);

        let second = match stream.next().await.unwrap() {
            Frame::Data(json) => serde_json::from_str::<StatusEvent>(&json).unwrap(),
            Frame::Heartbeat => panic!("expected broadcast event"),
        };
        assert_eq!(second.status, "later");

        drop(stream);
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_open_stream_ends_when_broadcaster_closes() {
        let events = Arc::new(Broadcaster::new());
        let mut stream = Box::pin(open_stream(Arc::clone(&events)));
        assert_eq!(events.close(), 1);

        // The connected frame is still buffered, then the stream terminates.
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_sse_endpoint_first_frame_is_connected() {
        let state = make_state(sample_host());
        let response = build_router(state.clone())
            .oneshot(
                Request::get("/api/sse/conversation")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        let json = text
            .strip_prefix("data: ")
            .and_then(|t| t.strip_suffix("\n\n"))
            .unwrap();
        let event: StatusEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventType::Connected);
        assert_eq!(state.events.subscriber_count(), 1);

        assert_eq!(state.events.heartbeat(), 1);
        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b": heartbeat\n\n");
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
        let response = build_router(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_webhook_get_is_health() {
        let state = make_state(sample_host());
        let (status, body) = get_json(&state, "/api/elevenlabs/webhook").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "operational");
        assert_eq!(body["tools"], json!(Tool::names()));
        assert_eq!(body["subscribers"], 0);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_tools_endpoint_lists_schemas() {
        let state = make_state(sample_host());
        let (status, body) = get_json(&state, "/api/elevenlabs/tools").await;
        assert_eq!(status, StatusCode::OK);

        let tools = body["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, Tool::names());

        let read = &tools[2];
        assert!(read["parameters"]["properties"]["file_path"].is_object());
        assert!(read["parameters"]["properties"]["start_line"].is_object());
        assert!(read["description"].as_str().is_some_and(|d| !d.is_empty()));
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Frame>) -> StatusEvent {
        match rx.try_recv().unwrap() {
            Frame::Data(json) => serde_json::from_str(&json).unwrap(),
            Frame::Heartbeat => panic!("expected data frame"),
        }
    }

    #[tokio::test]
    async fn test_webhook_failure_uses_generic_status() {
        let state = make_state(sample_host());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.events.subscribe(tx);

        let (status, body) = post_json(
            &state,
            "/api/elevenlabs/webhook",
            r#"{"tool_name":"read_file_content","parameters":{"file_path":"missing.js"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);

        assert_eq!(next_event(&mut rx).kind, EventType::Investigating);
        let failure = next_event(&mut rx);
        assert_eq!(failure.kind, EventType::Error);
        assert_eq!(failure.status, WEBHOOK_FAILURE_STATUS);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tool_endpoint_failure_uses_tool_status() {
        let state = make_state(sample_host());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.events.subscribe(tx);

        post_json(
            &state,
            "/api/elevenlabs/read-file-content",
            r#"{"file_path":"missing.js"}"#,
        )
        .await;

        assert_eq!(next_event(&mut rx).kind, EventType::Investigating);
        let failure = next_event(&mut rx);
        assert_eq!(failure.status, Tool::ReadFileContent.failure_status());
        assert!(rx.try_recv().is_err());
    }
}
