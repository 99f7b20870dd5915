//! Simulated function calling over a CLI with no native tool blocks.
//!
//! The calling convention is injected into the prompt as an XML-tagged
//! manifest, and tool invocations are extracted back out of free-form model
//! output. The `<tool_call>` / `<tool_result>` grammar is a compatibility
//! surface; changing it breaks already-deployed clients.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::openai::{ToolCall, ToolDef};

static TOOL_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").unwrap());

/// A tool invocation extracted from model output, arguments canonicalized to
/// a JSON string.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Model output split into residual text and extracted calls.
#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub content: Option<String>,
    pub calls: Vec<ExtractedCall>,
}

/// Fresh `call_<24 hex>` identifier for calls the model did not label.
pub fn synthesize_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..24])
}

/// Render the `<tools_available>` manifest plus the fixed calling-convention
/// instructions that get prepended to the flattened prompt.
pub fn render_manifest(tools: &[ToolDef]) -> String {
    let mut out = String::from("<tools_available>\n");
    for tool in tools {
        let parameters = tool
            .function
            .parameters
            .as_ref()
            .map(|schema| serde_json::to_string_pretty(schema).unwrap_or_else(|_| "{}".to_string()))
            .unwrap_or_else(|| "{}".to_string());
        out.push_str("<tool>\n");
        out.push_str(&format!("<name>{}</name>\n", tool.function.name));
        out.push_str(&format!(
            "<description>{}</description>\n",
            tool.function.description.as_deref().unwrap_or("")
        ));
        out.push_str(&format!("<parameters>\n{parameters}\n</parameters>\n"));
        out.push_str("</tool>\n");
    }
    out.push_str("</tools_available>\n\n");
    out.push_str(
        "<tool_call_instructions>\n\
         To call a tool, emit a block of exactly this form:\n\
         <tool_call>{\"name\": \"tool_name\", \"arguments\": {\"param\": \"value\"}}</tool_call>\n\
         Rules:\n\
         - The JSON body must have \"name\" (string) and \"arguments\" (object).\n\
         - You may emit multiple <tool_call> blocks in one response.\n\
         - Only tools listed in <tools_available> may be called.\n\
         - Brief reasoning text may precede the calls, but nothing may follow them.\n\
         </tool_call_instructions>\n\n",
    );
    out
}

/// Lower a prior assistant tool call back into its `<tool_call>` wire form.
/// Arguments are re-parsed from their stringified form into an object so the
/// transcript stays readable.
pub fn render_call_block(call: &ToolCall) -> String {
    let arguments: Value = serde_json::from_str(&call.function.arguments)
        .unwrap_or_else(|_| Value::String(call.function.arguments.clone()));
    let body = json!({
        "id": call.id,
        "name": call.function.name,
        "arguments": arguments,
    });
    format!("<tool_call>{body}</tool_call>")
}

/// Scan final result text for `<tool_call>` blocks. Malformed blocks are
/// skipped, never fatal; residual text has all blocks removed and is `None`
/// when nothing is left.
pub fn parse_reply(text: &str) -> ParsedReply {
    let mut calls = Vec::new();

    for capture in TOOL_CALL_RE.captures_iter(text) {
        let body = capture[1].trim();
        let parsed: Value = match serde_json::from_str(body) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                tracing::warn!(block = body, "skipping malformed tool_call block");
                continue;
            }
        };

        let Some(name) = parsed.get("name").and_then(Value::as_str) else {
            tracing::warn!(block = body, "tool_call block has no name, skipping");
            continue;
        };

        let id = parsed
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(synthesize_call_id);

        let arguments = match parsed.get("arguments") {
            Some(Value::String(raw)) => raw.clone(),
            Some(value) => serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
            None => "{}".to_string(),
        };

        calls.push(ExtractedCall {
            id,
            name: name.to_string(),
            arguments,
        });
    }

    let residual = TOOL_CALL_RE.replace_all(text, "").trim().to_string();
    let content = if residual.is_empty() {
        None
    } else {
        Some(residual)
    };

    ParsedReply { content, calls }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{FunctionCall, FunctionDef};

    fn weather_tool() -> ToolDef {
        ToolDef {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: "get_weather".to_string(),
                description: Some("Look up current weather".to_string()),
                parameters: Some(json!({
                    "type": "object",
                    "properties": {"city": {"type": "string"}}
                })),
            },
        }
    }

    #[test]
    fn manifest_lists_tools_and_instructions() {
        let manifest = render_manifest(&[weather_tool()]);
        assert!(manifest.contains("<tools_available>"));
        assert!(manifest.contains("<name>get_weather</name>"));
        assert!(manifest.contains("<description>Look up current weather</description>"));
        assert!(manifest.contains("\"city\""));
        assert!(manifest.contains("<tool_call_instructions>"));
    }

    #[test]
    fn manifest_defaults_missing_schema_to_empty_object() {
        let mut tool = weather_tool();
        tool.function.parameters = None;
        let manifest = render_manifest(&[tool]);
        assert!(manifest.contains("<parameters>\n{}\n</parameters>"));
    }

    #[test]
    fn parses_single_call_with_leading_text() {
        let reply = parse_reply(
            "Let me check.\n<tool_call>{\"name\":\"get_weather\",\"arguments\":{\"city\":\"Paris\"}}</tool_call>",
        );
        assert_eq!(reply.content.as_deref(), Some("Let me check."));
        assert_eq!(reply.calls.len(), 1);
        assert_eq!(reply.calls[0].name, "get_weather");
        assert_eq!(reply.calls[0].arguments, "{\"city\":\"Paris\"}");
        assert!(reply.calls[0].id.starts_with("call_"));
        assert_eq!(reply.calls[0].id.len(), "call_".len() + 24);
    }

    #[test]
    fn parses_multiple_calls() {
        let reply = parse_reply(
            "<tool_call>{\"name\":\"a\",\"arguments\":{}}</tool_call>\n\
             <tool_call>{\"name\":\"b\",\"arguments\":{\"x\":1}}</tool_call>",
        );
        assert_eq!(reply.calls.len(), 2);
        assert_eq!(reply.calls[0].name, "a");
        assert_eq!(reply.calls[1].arguments, "{\"x\":1}");
        assert!(reply.content.is_none());
    }

    #[test]
    fn keeps_echoed_id_and_string_arguments() {
        let reply = parse_reply(
            "<tool_call>{\"id\":\"call_fixed\",\"name\":\"f\",\"arguments\":\"{\\\"k\\\":2}\"}</tool_call>",
        );
        assert_eq!(reply.calls[0].id, "call_fixed");
        assert_eq!(reply.calls[0].arguments, "{\"k\":2}");
    }

    #[test]
    fn malformed_block_is_skipped_other_calls_kept() {
        let reply = parse_reply(
            "<tool_call>{not json}</tool_call> real text \
             <tool_call>{\"name\":\"ok\",\"arguments\":{}}</tool_call>",
        );
        assert_eq!(reply.calls.len(), 1);
        assert_eq!(reply.calls[0].name, "ok");
        assert_eq!(reply.content.as_deref(), Some("real text"));
    }

    #[test]
    fn malformed_only_block_yields_no_calls() {
        let reply = parse_reply("<tool_call>{not json}</tool_call> real text");
        assert!(reply.calls.is_empty());
        assert_eq!(reply.content.as_deref(), Some("real text"));
    }

    #[test]
    fn non_object_body_is_skipped() {
        let reply = parse_reply("<tool_call>[1,2,3]</tool_call>");
        assert!(reply.calls.is_empty());
        assert!(reply.content.is_none());
    }

    #[test]
    fn round_trips_lowered_calls() {
        let original = vec![
            ToolCall {
                id: "call_aaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "get_weather".to_string(),
                    arguments: "{\"city\":\"Paris\",\"units\":\"c\"}".to_string(),
                },
            },
            ToolCall {
                id: "call_bbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "search".to_string(),
                    arguments: "{\"q\":\"rust\"}".to_string(),
                },
            },
        ];

        let lowered = original
            .iter()
            .map(render_call_block)
            .collect::<Vec<_>>()
            .join("\n");
        let reply = parse_reply(&lowered);

        assert_eq!(reply.calls.len(), original.len());
        for (call, source) in reply.calls.iter().zip(&original) {
            assert_eq!(call.id, source.id);
            assert_eq!(call.name, source.function.name);
            let roundtrip: Value = serde_json::from_str(&call.arguments).unwrap();
            let original_args: Value = serde_json::from_str(&source.function.arguments).unwrap();
            assert_eq!(roundtrip, original_args);
        }
    }
}
