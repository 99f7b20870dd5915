//! Types and classification for the Claude CLI stream-json event feed.
//!
//! In `--print --output-format stream-json` mode the CLI writes one JSON
//! object per stdout line. The driver parses each line and classifies it into
//! an [`AgentEvent`]; consumers see a single tagged-variant channel instead of
//! string-keyed listeners.

use serde::Deserialize;
use serde_json::Value;

/// One classified frame from the subprocess, plus the driver's own lifecycle
/// variants (`Error`, `Closed`).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental text fragment from a `content_block_delta` stream event.
    ContentDelta { text: String },
    /// A complete assistant message.
    Assistant(AssistantEvent),
    /// The terminal result frame.
    Result(ResultEvent),
    /// Any other parsed frame (init announcements, hooks, system subtypes).
    /// Carried so observers can see every frame; the dispatcher ignores it.
    Other { event_type: String, payload: Value },
    /// A stdout line that was not valid JSON. Never aborts framing.
    Raw { line: String },
    /// Driver-level failure (currently only the watchdog timeout).
    Error { message: String },
    /// Process exit. Always the last event on the channel.
    Closed { code: Option<i32> },
}

impl AgentEvent {
    /// True for the variants after which no further upstream frames arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Closed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AssistantEvent {
    pub model: Option<String>,
    pub text: String,
    pub stop_reason: Option<String>,
}

/// Terminal `result` frame: final concatenated text, error flag, timing and
/// usage counters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default, rename = "modelUsage")]
    pub model_usage: serde_json::Map<String, Value>,
}

impl ResultEvent {
    /// First key of `modelUsage`, which names the model that served the turn.
    pub fn primary_model(&self) -> Option<&str> {
        self.model_usage.keys().next().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AssistantFrame {
    #[serde(default)]
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

/// Classify one stdout line. Unparseable lines come back as [`AgentEvent::Raw`].
pub fn classify_line(line: &str) -> AgentEvent {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            return AgentEvent::Raw {
                line: line.to_string(),
            }
        }
    };
    classify_frame(value)
}

fn classify_frame(value: Value) -> AgentEvent {
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match event_type.as_str() {
        "stream_event" => {
            // Only content_block_delta text fragments matter; other stream
            // subtypes (message_start, content_block_stop, ...) fall through
            // to the generic feed.
            let inner = value.get("event");
            let subtype = inner
                .and_then(|event| event.get("type"))
                .and_then(Value::as_str);
            if subtype == Some("content_block_delta") {
                if let Some(text) = inner
                    .and_then(|event| event.pointer("/delta/text"))
                    .and_then(Value::as_str)
                {
                    return AgentEvent::ContentDelta {
                        text: text.to_string(),
                    };
                }
            }
            AgentEvent::Other {
                event_type,
                payload: value,
            }
        }
        "assistant" => match serde_json::from_value::<AssistantFrame>(value.clone()) {
            Ok(AssistantFrame {
                message: Some(message),
            }) => {
                let text = message
                    .content
                    .iter()
                    .filter(|block| block.block_type == "text")
                    .filter_map(|block| block.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("");
                AgentEvent::Assistant(AssistantEvent {
                    model: message.model,
                    text,
                    stop_reason: message.stop_reason,
                })
            }
            _ => AgentEvent::Other {
                event_type,
                payload: value,
            },
        },
        "result" => match serde_json::from_value::<ResultEvent>(value.clone()) {
            Ok(result) => AgentEvent::Result(result),
            Err(_) => AgentEvent::Other {
                event_type,
                payload: value,
            },
        },
        _ => AgentEvent::Other {
            event_type,
            payload: value,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_content_block_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"he"}}}"#;
        match classify_line(line) {
            AgentEvent::ContentDelta { text } => assert_eq!(text, "he"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn non_delta_stream_events_go_to_generic_feed() {
        let line = r#"{"type":"stream_event","event":{"type":"message_start"}}"#;
        match classify_line(line) {
            AgentEvent::Other { event_type, .. } => assert_eq!(event_type, "stream_event"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn classifies_assistant_message() {
        let line = r#"{
            "type": "assistant",
            "message": {
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "text", "text": "Hello"},
                    {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}},
                    {"type": "text", "text": " world"}
                ],
                "stop_reason": "end_turn"
            }
        }"#;
        match classify_line(line) {
            AgentEvent::Assistant(event) => {
                assert_eq!(event.model.as_deref(), Some("claude-sonnet-4-20250514"));
                assert_eq!(event.text, "Hello world");
                assert_eq!(event.stop_reason.as_deref(), Some("end_turn"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn classifies_result_with_usage() {
        let line = r#"{
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "duration_ms": 2300,
            "num_turns": 1,
            "result": "hello",
            "total_cost_usd": 0.003,
            "usage": {"input_tokens": 12, "output_tokens": 5},
            "modelUsage": {"claude-sonnet-4-20250514": {"inputTokens": 12}}
        }"#;
        match classify_line(line) {
            AgentEvent::Result(result) => {
                assert_eq!(result.result.as_deref(), Some("hello"));
                assert!(!result.is_error);
                assert_eq!(result.usage.as_ref().unwrap().input_tokens, 12);
                assert_eq!(result.primary_model(), Some("claude-sonnet-4-20250514"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn init_frame_lands_on_generic_feed() {
        let line = r#"{"type":"system","subtype":"init","session_id":"s1","model":"claude-opus-4","tools":["Bash"]}"#;
        match classify_line(line) {
            AgentEvent::Other { event_type, payload } => {
                assert_eq!(event_type, "system");
                assert_eq!(payload["subtype"], "init");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn closed_is_the_only_terminal_variant() {
        assert!(AgentEvent::Closed { code: Some(0) }.is_terminal());
        assert!(!AgentEvent::ContentDelta {
            text: "x".to_string()
        }
        .is_terminal());
        assert!(!AgentEvent::Result(ResultEvent::default()).is_terminal());
    }

    #[test]
    fn invalid_json_becomes_raw() {
        match classify_line("not json at all") {
            AgentEvent::Raw { line } => assert_eq!(line, "not json at all"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
