//! Run endpoints: accept an AG-UI run request and stream the run back over SSE.
//!
//! The orchestrator runs on its own task and feeds a bounded channel. The response
//! stream owns a drop guard for the run's cancellation token, so a client that
//! disconnects cancels the run and the closed channel stops further delivery.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::ExecutionEngine;
use crate::protocol::OutputEvent;
use crate::session::{RunInput, RunRequest, SessionKey, SessionOrchestrator};

use super::routes::{resolve_user, AppState};
use super::types::RunAgentInput;

const EVENT_BUFFER: usize = 256;

/// Run an explicitly named application.
pub async fn run_app(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RunAgentInput>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let engine = state
        .engines
        .get(&app)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown application: {}", app)))?;
    Ok(start_run(state, app, engine, &headers, body))
}

/// Run the default application.
pub async fn run_default_app(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RunAgentInput>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let app = state.engines.default_app().to_string();
    let engine = state.engines.default_engine().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Default application '{}' is not registered", app),
        )
    })?;
    Ok(start_run(state, app, engine, &headers, body))
}

fn start_run(
    state: Arc<AppState>,
    app: String,
    engine: Arc<dyn ExecutionEngine>,
    headers: &HeaderMap,
    body: RunAgentInput,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let user = resolve_user(body.user_id.as_deref(), headers);
    let run_id = body
        .run_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let request = RunRequest {
        key: SessionKey::new(app, user, body.thread_id.clone()),
        thread_id: body.thread_id.clone(),
        run_id,
        input: body.run_input(),
        client_state: body.state.clone(),
    };
    tracing::debug!(
        session = %request.key,
        run_id = %request.run_id,
        input = ?request.input.as_ref().map(input_kind),
        "Run request accepted"
    );

    let orchestrator = SessionOrchestrator::new(state.run_context(engine), request);
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<OutputEvent>(EVENT_BUFFER);

    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let report = orchestrator.run(&tx, run_cancel).await;
        if report.outcome.is_error() {
            tracing::warn!(
                run_id = %report.run_id,
                code = report.outcome.code().unwrap_or("UNKNOWN"),
                events = report.events_emitted,
                "Run ended with error"
            );
        } else {
            tracing::info!(
                run_id = %report.run_id,
                events = report.events_emitted,
                pending = report.pending.len(),
                "Run finished"
            );
        }
    });

    let stream = async_stream::stream! {
        let _cancel_on_drop = cancel.drop_guard();
        while let Some(ev) = rx.recv().await {
            match Event::default().event(ev.event_name()).json_data(&ev) {
                Ok(sse) => yield Ok(sse),
                Err(e) => tracing::warn!("Failed to encode {} event: {}", ev.event_name(), e),
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.sse_keepalive)
            .text("keepalive"),
    )
}

fn input_kind(input: &RunInput) -> &'static str {
    match input {
        RunInput::UserMessage { .. } => "user_message",
        RunInput::ToolResult { .. } => "tool_result",
    }
}

#[cfg(test)]
mod tests {
    use super::super::routes::test_support::*;
    use axum::http::StatusCode;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::engine::scripted::{Script, ScriptedEngine};
    use crate::engine::{ExecutionEngine, InternalEvent};

    #[tokio::test]
    async fn default_run_streams_echo_reply() {
        let state = state_with(vec![]);
        let (status, body) = send(
            &state,
            "POST",
            "/api/run",
            Some(json!({
                "threadId": "t1",
                "runId": "r1",
                "messages": [{"role": "user", "content": "hello there"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let events = sse_events(&body);
        let types = event_types(&events);
        assert_eq!(types.first().map(String::as_str), Some("RUN_STARTED"));
        assert_eq!(types.last().map(String::as_str), Some("RUN_FINISHED"));
        assert!(types.contains(&"TEXT_MESSAGE_START".to_string()));
        assert!(types.contains(&"TEXT_MESSAGE_END".to_string()));
        assert_eq!(events[0]["runId"], "r1");

        let text: String = events
            .iter()
            .filter(|e| e["type"] == "TEXT_MESSAGE_CONTENT")
            .filter_map(|e| e["delta"].as_str())
            .collect();
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn unknown_application_is_not_found() {
        let state = state_with(vec![]);
        let (status, _) = send(
            &state,
            "POST",
            "/api/apps/missing/run",
            Some(json!({"threadId": "t1", "messages": [{"role": "user", "content": "hi"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn approval_pauses_then_tool_message_resumes() {
        let state = state_with(vec![]);
        let (_, body) = send(
            &state,
            "POST",
            "/api/apps/echo/run",
            Some(json!({
                "threadId": "t2",
                "messages": [{"role": "user", "content": "/approve deploy"}]
            })),
        )
        .await;
        let events = sse_events(&body);
        let finished = events.last().cloned().unwrap_or(Value::Null);
        assert_eq!(finished["type"], "RUN_FINISHED");
        assert_eq!(finished["outcome"]["type"], "interrupted");
        let call_id = finished["outcome"]["pending"][0]["callId"]
            .as_str()
            .expect("pending call id")
            .to_string();

        let (_, body) = send(
            &state,
            "POST",
            "/api/apps/echo/run",
            Some(json!({
                "threadId": "t2",
                "messages": [
                    {"role": "user", "content": "/approve deploy"},
                    {"role": "tool", "toolCallId": call_id, "content": "{\"approved\":true}"}
                ]
            })),
        )
        .await;
        let events = sse_events(&body);
        let finished = events.last().cloned().unwrap_or(Value::Null);
        assert_eq!(finished["type"], "RUN_FINISHED");
        assert_eq!(finished["outcome"]["type"], "success");
        assert!(events.iter().any(|e| e["type"] == "STATE_DELTA"));
    }

    #[tokio::test]
    async fn resume_with_unknown_call_reports_error() {
        let state = state_with(vec![]);
        let (status, body) = send(
            &state,
            "POST",
            "/api/run",
            Some(json!({
                "threadId": "t3",
                "messages": [{"role": "tool", "toolCallId": "nope", "content": "{}"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let events = sse_events(&body);
        assert_eq!(
            event_types(&events),
            vec!["RUN_STARTED".to_string(), "RUN_ERROR".to_string()]
        );
        assert_eq!(events[1]["code"], "UNKNOWN_TOOL_CALL");
    }

    #[tokio::test]
    async fn concurrent_run_on_same_thread_is_busy() {
        let slow: Arc<dyn ExecutionEngine> = Arc::new(ScriptedEngine::with_scripts(vec![
            Script::new(vec![
                InternalEvent::text_delta("m1", "slow"),
                InternalEvent::text_final("m1"),
            ])
            .with_delay(Duration::from_millis(150)),
        ]));
        let state = state_with(vec![("slow", slow)]);
        let body = json!({"threadId": "t4", "messages": [{"role": "user", "content": "hi"}]});

        let first = {
            let state = Arc::clone(&state);
            let body = body.clone();
            tokio::spawn(async move { send(&state, "POST", "/api/apps/slow/run", Some(body)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, second) = send(&state, "POST", "/api/apps/slow/run", Some(body)).await;

        let second = sse_events(&second);
        assert_eq!(second.last().map(|e| e["code"].clone()), Some(json!("SESSION_BUSY")));

        let (_, first) = first.await.expect("first run");
        let first = sse_events(&first);
        assert_eq!(first.last().map(|e| e["type"].clone()), Some(json!("RUN_FINISHED")));
    }
}
