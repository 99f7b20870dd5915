//! Pure constructors mapping driver output to OpenAI response shapes.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::events::{AssistantEvent, ResultEvent};
use crate::openai::{
    AssistantReply, ChatCompletion, ChatCompletionChunk, Choice, ChunkChoice, Delta, FunctionCall,
    ToolCall, ToolCallDelta, Usage,
};
use crate::tools::ExtractedCall;

/// The three model ids the adapter advertises.
pub const MODEL_IDS: [&str; 3] = ["claude-opus-4", "claude-sonnet-4", "claude-haiku-4"];

const FALLBACK_MODEL: &str = "claude-sonnet-4";

/// 24-character lowercase hex id, derived from a UUID.
pub fn hex_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..24].to_string()
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", hex_id())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Collapse inbound model strings to the advertised ids by substring match;
/// unrecognized names pass through unchanged.
pub fn normalize_model_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.contains("opus") {
        "claude-opus-4".to_string()
    } else if lower.contains("sonnet") {
        "claude-sonnet-4".to_string()
    } else if lower.contains("haiku") {
        "claude-haiku-4".to_string()
    } else {
        name.to_string()
    }
}

/// Identity shared by every chunk of one streamed response.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub id: String,
    pub created: u64,
    pub model: String,
}

impl StreamIdentity {
    pub fn new(model: String) -> Self {
        Self {
            id: completion_id(),
            created: unix_now(),
            model,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Content chunk for one upstream delta; `first` controls whether the
    /// chunk announces the assistant role.
    pub fn text_chunk(&self, text: String, first: bool) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: first.then_some("assistant"),
                content: Some(text),
                tool_calls: None,
            },
            None,
        )
    }

    /// Terminal chunk: empty delta, `finish_reason = "stop"`.
    pub fn done_chunk(&self) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some("stop"))
    }

    /// Projection of a complete `assistant` frame into a single chunk.
    pub fn assistant_chunk(&self, event: &AssistantEvent, first: bool) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: first.then_some("assistant"),
                content: Some(event.text.clone()),
                tool_calls: None,
            },
            event.stop_reason.as_ref().map(|_| "stop"),
        )
    }

    /// The buffered-replay chunk sequence for extracted tool calls: optional
    /// leading text chunk, one chunk per call, then a `tool_calls` finish.
    pub fn tool_call_chunks(
        &self,
        residual: Option<String>,
        calls: &[ExtractedCall],
    ) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::with_capacity(calls.len() + 2);
        let mut role_sent = false;

        if let Some(text) = residual {
            chunks.push(self.text_chunk(text, true));
            role_sent = true;
        }

        for (index, call) in calls.iter().enumerate() {
            chunks.push(self.chunk(
                Delta {
                    role: (!role_sent && index == 0).then_some("assistant"),
                    content: None,
                    tool_calls: Some(vec![ToolCallDelta {
                        index: index as u32,
                        id: call.id.clone(),
                        call_type: "function",
                        function: FunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    }]),
                },
                None,
            ));
            role_sent = true;
        }

        chunks.push(self.chunk(Delta::default(), Some("tool_calls")));
        chunks
    }
}

/// Usage counters derived from the terminal result; zeros when absent.
pub fn usage_from_result(result: Option<&ResultEvent>) -> Usage {
    let Some(usage) = result.and_then(|result| result.usage.as_ref()) else {
        return Usage::default();
    };
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
    }
}

/// Model id for a finished turn: first `modelUsage` key, normalized, with a
/// sonnet fallback when the result carries no per-model usage.
pub fn model_from_result(result: Option<&ResultEvent>) -> String {
    result
        .and_then(|result| result.primary_model())
        .map(normalize_model_name)
        .unwrap_or_else(|| FALLBACK_MODEL.to_string())
}

/// Full non-streaming completion from the terminal result.
pub fn completion_from_result(result: &ResultEvent) -> ChatCompletion {
    ChatCompletion {
        id: completion_id(),
        object: "chat.completion",
        created: unix_now(),
        model: model_from_result(Some(result)),
        choices: vec![Choice {
            index: 0,
            message: AssistantReply {
                role: "assistant",
                content: Some(result.result.clone().unwrap_or_default()),
                tool_calls: None,
            },
            finish_reason: "stop",
        }],
        usage: usage_from_result(Some(result)),
    }
}

/// Non-streaming completion for the buffered-replay path, which may carry
/// tool calls and a residual-text-or-null content.
pub fn buffered_completion(
    model: String,
    content: Option<String>,
    calls: Vec<ExtractedCall>,
    usage: Usage,
) -> ChatCompletion {
    let (message, finish_reason) = if calls.is_empty() {
        (
            AssistantReply {
                role: "assistant",
                content: Some(content.unwrap_or_default()),
                tool_calls: None,
            },
            "stop",
        )
    } else {
        (
            AssistantReply {
                role: "assistant",
                content,
                tool_calls: Some(
                    calls
                        .into_iter()
                        .map(|call| ToolCall {
                            id: call.id,
                            call_type: "function".to_string(),
                            function: FunctionCall {
                                name: call.name,
                                arguments: call.arguments,
                            },
                        })
                        .collect(),
                ),
            },
            "tool_calls",
        )
    };

    ChatCompletion {
        id: completion_id(),
        object: "chat.completion",
        created: unix_now(),
        model,
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason,
        }],
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TokenUsage;
    use serde_json::json;

    fn sample_call() -> ExtractedCall {
        ExtractedCall {
            id: "call_aaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            name: "get_weather".to_string(),
            arguments: "{\"city\":\"Paris\"}".to_string(),
        }
    }

    #[test]
    fn hex_id_is_24_lowercase_hex() {
        let id = hex_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn normalizes_by_substring_and_preserves_unknown() {
        assert_eq!(normalize_model_name("claude-opus-4-20250514"), "claude-opus-4");
        assert_eq!(normalize_model_name("claude-sonnet-4-5"), "claude-sonnet-4");
        assert_eq!(normalize_model_name("my-haiku-build"), "claude-haiku-4");
        assert_eq!(normalize_model_name("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn first_text_chunk_announces_role() {
        let identity = StreamIdentity::new("claude-sonnet-4".to_string());
        let first = identity.text_chunk("he".to_string(), true);
        let second = identity.text_chunk("llo".to_string(), false);
        assert_eq!(first.choices[0].delta.role, Some("assistant"));
        assert_eq!(second.choices[0].delta.role, None);
        assert_eq!(second.choices[0].delta.content.as_deref(), Some("llo"));
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn done_chunk_has_empty_delta_and_stop() {
        let identity = StreamIdentity::new("claude-sonnet-4".to_string());
        let done = identity.done_chunk();
        assert_eq!(done.choices[0].finish_reason, Some("stop"));
        let delta = serde_json::to_value(&done.choices[0].delta).unwrap();
        assert_eq!(delta, json!({}));
    }

    #[test]
    fn assistant_chunk_maps_stop_reason() {
        let identity = StreamIdentity::new("claude-sonnet-4".to_string());
        let open = AssistantEvent {
            model: None,
            text: "hi".to_string(),
            stop_reason: None,
        };
        let closed = AssistantEvent {
            stop_reason: Some("end_turn".to_string()),
            ..open.clone()
        };
        assert_eq!(identity.assistant_chunk(&open, true).choices[0].finish_reason, None);
        assert_eq!(
            identity.assistant_chunk(&closed, false).choices[0].finish_reason,
            Some("stop")
        );
    }

    #[test]
    fn tool_chunks_with_residual_text_lead_with_role() {
        let identity = StreamIdentity::new("claude-sonnet-4".to_string());
        let chunks = identity.tool_call_chunks(Some("Let me check.".to_string()), &[sample_call()]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.role, Some("assistant"));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Let me check."));
        let call_delta = chunks[1].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(chunks[1].choices[0].delta.role, None);
        assert_eq!(call_delta[0].index, 0);
        assert_eq!(call_delta[0].function.name, "get_weather");
        assert_eq!(chunks[2].choices[0].finish_reason, Some("tool_calls"));
    }

    #[test]
    fn tool_chunks_without_text_put_role_on_first_call() {
        let identity = StreamIdentity::new("claude-sonnet-4".to_string());
        let second = ExtractedCall {
            id: "call_bbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
            name: "search".to_string(),
            arguments: "{}".to_string(),
        };
        let chunks = identity.tool_call_chunks(None, &[sample_call(), second]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.role, Some("assistant"));
        assert_eq!(chunks[1].choices[0].delta.role, None);
        assert_eq!(
            chunks[1].choices[0].delta.tool_calls.as_ref().unwrap()[0].index,
            1
        );
    }

    #[test]
    fn result_projection_derives_model_and_usage() {
        let mut result = ResultEvent {
            result: Some("hello".to_string()),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            ..ResultEvent::default()
        };
        result.model_usage.insert(
            "claude-sonnet-4-20250514".to_string(),
            json!({"inputTokens": 10}),
        );

        let completion = completion_from_result(&result);
        assert_eq!(completion.model, "claude-sonnet-4");
        assert_eq!(completion.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.usage.total_tokens, 15);
        assert!(completion.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn result_projection_defaults_to_sonnet_and_zero_usage() {
        let result = ResultEvent {
            result: Some("hi".to_string()),
            ..ResultEvent::default()
        };
        let completion = completion_from_result(&result);
        assert_eq!(completion.model, "claude-sonnet-4");
        assert_eq!(completion.usage.total_tokens, 0);
    }

    #[test]
    fn buffered_completion_sets_tool_calls_finish() {
        let completion = buffered_completion(
            "claude-sonnet-4".to_string(),
            Some("Let me check.".to_string()),
            vec![sample_call()],
            Usage::default(),
        );
        assert_eq!(completion.choices[0].finish_reason, "tool_calls");
        let calls = completion.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Paris\"}");

        let plain = buffered_completion(
            "claude-sonnet-4".to_string(),
            Some("sunny today".to_string()),
            Vec::new(),
            Usage::default(),
        );
        assert_eq!(plain.choices[0].finish_reason, "stop");
        assert!(plain.choices[0].message.tool_calls.is_none());
    }
}
