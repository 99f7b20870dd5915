//! Translates an inbound chat-completions request into a CLI invocation spec.
//!
//! The CLI accepts a single prompt argument, so the message history is
//! rendered into a textual transcript. Rendering is a pure function of
//! (messages, tools): equal inputs yield byte-equal prompts.

use serde_json::Value;

use crate::openai::{ChatCompletionRequest, ChatMessage};
use crate::tools;

/// Model alias the CLI accepts via `--model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAlias {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelAlias {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelAlias::Opus => "opus",
            ModelAlias::Sonnet => "sonnet",
            ModelAlias::Haiku => "haiku",
        }
    }
}

/// Everything needed to spawn one subprocess for one request.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub prompt: String,
    pub model: ModelAlias,
    /// The request's `user` field, forwarded verbatim; the dispatcher maps it
    /// through the session store.
    pub conversation_id: Option<String>,
    pub tools_active: bool,
}

/// Translate a validated request. Pure; no I/O.
pub fn translate(request: &ChatCompletionRequest) -> CliInvocation {
    let tools_active = request
        .tools
        .as_ref()
        .is_some_and(|tools| !tools.is_empty())
        && request.tool_choice.as_ref().and_then(Value::as_str) != Some("none");

    let mut prompt = String::new();
    if tools_active {
        if let Some(tools) = &request.tools {
            prompt.push_str(&tools::render_manifest(tools));
        }
    }
    prompt.push_str(&flatten_messages(&request.messages));

    CliInvocation {
        prompt,
        model: resolve_model(request.model.as_deref()),
        conversation_id: request.user.clone(),
        tools_active,
    }
}

/// Closed lookup table from client model names to CLI aliases. Unknown
/// provider prefixes (`<provider>/<name>`) are stripped and the lookup
/// retried once; anything else defaults to `opus`.
pub fn resolve_model(model: Option<&str>) -> ModelAlias {
    let Some(name) = model else {
        return ModelAlias::Opus;
    };
    let name = name.to_ascii_lowercase();
    if let Some(alias) = lookup_model(&name) {
        return alias;
    }
    if let Some((_, stripped)) = name.split_once('/') {
        if let Some(alias) = lookup_model(stripped) {
            return alias;
        }
    }
    ModelAlias::Opus
}

fn lookup_model(name: &str) -> Option<ModelAlias> {
    match name {
        "opus" | "claude-opus-4" | "claude-opus-4-0" | "claude-opus-4-1" | "claude-3-opus" => {
            Some(ModelAlias::Opus)
        }
        "sonnet" | "claude-sonnet-4" | "claude-sonnet-4-0" | "claude-sonnet-4-5"
        | "claude-3-5-sonnet" | "claude-3-7-sonnet" => Some(ModelAlias::Sonnet),
        "haiku" | "claude-haiku-4" | "claude-haiku-4-5" | "claude-3-5-haiku"
        | "claude-3-haiku" => Some(ModelAlias::Haiku),
        _ => None,
    }
}

/// Render the message history into the XML-tagged transcript the CLI sees.
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    let mut index = 0;

    while index < messages.len() {
        let message = &messages[index];
        match message.role.as_str() {
            "system" => {
                out.push_str(&format!("<system>{}</system>\n", content_text(message)));
                index += 1;
            }
            "assistant" => {
                out.push_str(&render_assistant(message));
                index += 1;
            }
            "tool" => {
                // A run of consecutive tool messages collapses into one
                // <tool_results> block.
                let run_start = index;
                while index < messages.len() && messages[index].role == "tool" {
                    index += 1;
                }
                out.push_str(&render_tool_results(&messages[run_start..index]));
            }
            _ => {
                out.push_str(&content_text(message));
                out.push('\n');
                index += 1;
            }
        }
    }

    out
}

fn render_assistant(message: &ChatMessage) -> String {
    let text = content_text(message);
    match message.tool_calls.as_deref() {
        Some(calls) if !calls.is_empty() => {
            let mut inner = String::new();
            if !text.is_empty() {
                inner.push_str(&text);
                inner.push('\n');
            }
            for call in calls {
                inner.push_str(&tools::render_call_block(call));
                inner.push('\n');
            }
            format!(
                "<previous_response>{}</previous_response>\n",
                inner.trim_end()
            )
        }
        _ => format!("<previous_response>{text}</previous_response>\n"),
    }
}

fn render_tool_results(run: &[ChatMessage]) -> String {
    let mut out = String::from("<tool_results>\n");
    for message in run {
        out.push_str("<tool_result>\n");
        out.push_str(&format!(
            "<tool_call_id>{}</tool_call_id>\n",
            message.tool_call_id.as_deref().unwrap_or("")
        ));
        out.push_str(&format!("<output>{}</output>\n", content_text(message)));
        out.push_str("</tool_result>\n");
    }
    out.push_str("</tool_results>\n");
    out
}

/// Extract text from the message's `content`, which may be a string, a list
/// of typed parts, an object with a `text` field, or anything else (JSON
/// stringified as a fallback).
fn content_text(message: &ChatMessage) -> String {
    let Some(content) = &message.content else {
        return String::new();
    };
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(fields) => match fields.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => content.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
