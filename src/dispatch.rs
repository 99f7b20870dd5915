//! Wires the subprocess event feed to the HTTP response.
//!
//! Mode selection by `(tools active, stream requested)`:
//!
//! | tools | stream | mode |
//! |-------|--------|------|
//! | no    | no     | non-streaming JSON body |
//! | no    | yes    | pass-through SSE |
//! | yes   | any    | buffered replay |
//!
//! Buffered replay exists because `finish_reason` cannot be changed after an
//! earlier chunk has been sent, and whether tool calls appear is knowable
//! only once the full text is in hand.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::events::{AgentEvent, ResultEvent};
use crate::openai::{ChatCompletionRequest, ErrorEnvelope};
use crate::process::{CliOptions, CliProcess, SpawnError};
use crate::prompt;
use crate::response::{self, StreamIdentity};
use crate::tools;
use crate::AppState;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Translate, spawn, and run one request through its dispatcher mode.
/// Exactly one response is produced on every path.
pub async fn dispatch(state: Arc<AppState>, request: ChatCompletionRequest) -> Response {
    let invocation = prompt::translate(&request);

    let session_id = match &invocation.conversation_id {
        Some(conversation_id) => Some(
            state
                .sessions
                .get_or_create(conversation_id, invocation.model.as_str())
                .await,
        ),
        None => None,
    };

    let options = CliOptions {
        model: invocation.model,
        session_id,
        cwd: None,
        timeout: state.config.timeout,
    };

    let process = match CliProcess::spawn(&state.config.claude_bin, &invocation.prompt, options) {
        Ok(process) => process,
        Err(err) => return spawn_failure(err),
    };

    let model = request
        .model
        .as_deref()
        .map(response::normalize_model_name)
        .unwrap_or_else(|| response::normalize_model_name(invocation.model.as_str()));

    match (invocation.tools_active, request.stream) {
        (false, false) => run_non_streaming(process).await,
        (false, true) => run_passthrough(process, StreamIdentity::new(model)),
        (true, stream) => run_buffered(process, StreamIdentity::new(model), stream).await,
    }
}

fn spawn_failure(err: SpawnError) -> Response {
    tracing::error!(error = %err, "failed to start claude process");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorEnvelope::server_error(err.to_string()),
    )
}

fn error_response(status: StatusCode, envelope: ErrorEnvelope) -> Response {
    (status, Json(envelope)).into_response()
}

/// Wait for the terminal result and answer with one JSON body.
async fn run_non_streaming(mut process: CliProcess) -> Response {
    let mut result: Option<ResultEvent> = None;

    while let Some(event) = process.recv().await {
        match event {
            AgentEvent::Result(terminal) => result = Some(terminal),
            // An error before close wins; any later result is suppressed.
            AgentEvent::Error { message } => {
                process.kill();
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope::server_error(message),
                );
            }
            AgentEvent::Closed { code } => {
                return match result.take() {
                    Some(result) => Json(response::completion_from_result(&result)).into_response(),
                    None => error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorEnvelope::server_error(format!(
                            "Claude CLI exited with code {} before producing a result",
                            code.map(|code| code.to_string()).unwrap_or_else(|| "unknown".to_string())
                        )),
                    ),
                };
            }
            _ => {}
        }
    }

    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorEnvelope::server_error("Claude CLI event feed ended unexpectedly"),
    )
}

/// One SSE chunk per upstream delta. The pump task owns the subprocess: when
/// the client goes away the response stream is dropped, sends start failing,
/// and the subprocess is killed. The response-body side is the disconnect
/// signal; the request side says nothing once the body is read.
fn run_passthrough(mut process: CliProcess, mut identity: StreamIdentity) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    tokio::spawn(async move {
        // Comment frame flushed first to defeat intermediary buffering.
        if tx.send(Event::default().comment("ok")).is_err() {
            process.kill();
            return;
        }

        let mut role_sent = false;
        loop {
            let event = tokio::select! {
                event = process.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                // The receiver side is dropped the moment the client goes
                // away, even if the upstream is silent.
                _ = tx.closed() => {
                    tracing::debug!("client disconnected mid-stream, killing claude process");
                    process.kill();
                    return;
                }
            };

            let write = match event {
                AgentEvent::ContentDelta { text } => {
                    let first = !role_sent && !text.is_empty();
                    role_sent = role_sent || first;
                    tx.send(data_event(&identity.text_chunk(text, first)))
                }
                AgentEvent::Assistant(assistant) => {
                    if let Some(model) = assistant.model {
                        identity.model = response::normalize_model_name(&model);
                    }
                    Ok(())
                }
                AgentEvent::Result(_) | AgentEvent::Closed { .. } => {
                    let _ = tx.send(data_event(&identity.done_chunk()));
                    let _ = tx.send(Event::default().data("[DONE]"));
                    break;
                }
                AgentEvent::Error { message } => {
                    // The response is committed; deliver the error in-band.
                    let _ = tx.send(data_event(&ErrorEnvelope::server_error(message)));
                    let _ = tx.send(Event::default().data("[DONE]"));
                    break;
                }
                _ => Ok(()),
            };

            if write.is_err() {
                tracing::debug!("client disconnected mid-stream, killing claude process");
                process.kill();
                return;
            }
        }
        // Dropping the process here reaps it if the upstream is still going.
    });

    sse_response(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>))
}

struct BufferedTurn {
    buffer: String,
    model: Option<String>,
    result: Option<ResultEvent>,
    error: Option<String>,
    code: Option<i32>,
}

/// Tools mode: nothing is written until the subprocess closes, then the full
/// text is classified and replayed as chunks or a JSON body.
async fn run_buffered(mut process: CliProcess, identity: StreamIdentity, stream: bool) -> Response {
    let mut turn = BufferedTurn {
        buffer: String::new(),
        model: None,
        result: None,
        error: None,
        code: None,
    };

    while let Some(event) = process.recv().await {
        match event {
            AgentEvent::ContentDelta { text } => turn.buffer.push_str(&text),
            AgentEvent::Assistant(assistant) => {
                if let Some(model) = assistant.model {
                    turn.model = Some(model);
                }
            }
            AgentEvent::Result(result) => turn.result = Some(result),
            AgentEvent::Error { message } => turn.error = Some(message),
            AgentEvent::Closed { code } => {
                turn.code = code;
                break;
            }
            _ => {}
        }
    }

    if turn.result.is_none() {
        // Same abnormal-exit check as the non-streaming mode: a driver error
        // or a non-clean exit without a result frame is a failure, not an
        // empty completion.
        let failure = turn.error.take().or_else(|| match turn.code {
            Some(0) => None,
            code => Some(format!(
                "Claude CLI exited with code {} before producing a result",
                code.map(|code| code.to_string()).unwrap_or_else(|| "unknown".to_string())
            )),
        });
        if let Some(message) = failure {
            let envelope = ErrorEnvelope::server_error(message);
            if stream {
                return sse_response(stream::iter([
                    Ok::<_, Infallible>(Event::default().comment("ok")),
                    Ok(data_event(&envelope)),
                    Ok(Event::default().data("[DONE]")),
                ]));
            }
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, envelope);
        }
    }

    // The terminal result text is authoritative; accumulated deltas are the
    // fallback when the result frame never arrived.
    let text = turn
        .result
        .as_ref()
        .and_then(|result| result.result.clone())
        .unwrap_or_else(|| turn.buffer.clone());
    let parsed = tools::parse_reply(&text);

    let mut identity = identity;
    identity.model = turn
        .result
        .as_ref()
        .and_then(|result| result.primary_model())
        .map(response::normalize_model_name)
        .or_else(|| turn.model.as_deref().map(response::normalize_model_name))
        .unwrap_or(identity.model);

    if stream {
        let mut events = vec![Event::default().comment("ok")];
        if parsed.calls.is_empty() {
            events.push(data_event(
                &identity.text_chunk(parsed.content.unwrap_or_default(), true),
            ));
            events.push(data_event(&identity.done_chunk()));
        } else {
            for chunk in identity.tool_call_chunks(parsed.content, &parsed.calls) {
                events.push(data_event(&chunk));
            }
        }
        events.push(Event::default().data("[DONE]"));
        return sse_response(stream::iter(events.into_iter().map(Ok::<_, Infallible>)));
    }

    let usage = response::usage_from_result(turn.result.as_ref());
    Json(response::buffered_completion(
        identity.model,
        parsed.content,
        parsed.calls,
        usage,
    ))
    .into_response()
}

fn data_event<T: Serialize>(payload: &T) -> Event {
    match Event::default().json_data(payload) {
        Ok(event) => event,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize sse payload");
            Event::default().data("{}")
        }
    }
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let headers = AppendHeaders([
        (header::CACHE_CONTROL, "no-cache".to_string()),
        (header::CONNECTION, "keep-alive".to_string()),
        (HeaderName::from_static("x-request-id"), response::hex_id()),
    ]);
    (
        headers,
        Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE)),
    )
        .into_response()
}
