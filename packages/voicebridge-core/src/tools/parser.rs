//! Tool-call marker extraction from LLM text.
//!
//! Local models emit tool invocations inline as
//! `<tool_call>{"name": …, "arguments": {…}}</tool_call>` blocks. This
//! parser splits those out and returns the remaining text as the spoken
//! response. Malformed blocks are dropped, never fatal.

use serde_json::Value;

use crate::providers::ToolInvocation;

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";

/// Splits LLM output into clean speakable text and tool invocations.
pub fn parse_response_with_tools(text: &str) -> (String, Vec<ToolInvocation>) {
    let mut clean = String::with_capacity(text.len());
    let mut calls = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(OPEN_TAG) {
        clean.push_str(&rest[..open]);
        let after_open = &rest[open + OPEN_TAG.len()..];
        let Some(close) = after_open.find(CLOSE_TAG) else {
            // Unterminated block: drop the marker and keep the tail as text.
            rest = after_open;
            break;
        };
        let body = after_open[..close].trim();
        match serde_json::from_str::<Value>(body) {
            Ok(value) => {
                if let Some(name) = value.get("name").and_then(Value::as_str) {
                    calls.push(ToolInvocation {
                        name: name.to_string(),
                        arguments: value
                            .get("arguments")
                            .cloned()
                            .unwrap_or(Value::Object(serde_json::Map::new())),
                        invocation_id: value
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                } else {
                    log::warn!("[Tools] Tool call block without a name: {body}");
                }
            }
            Err(e) => log::warn!("[Tools] Malformed tool call block dropped: {e}"),
        }
        rest = &after_open[close + CLOSE_TAG.len()..];
    }
    clean.push_str(rest);

    (clean.trim().to_string(), calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_passes_through() {
        let (clean, calls) = parse_response_with_tools("Just a normal sentence.");
        assert_eq!(clean, "Just a normal sentence.");
        assert!(calls.is_empty());
    }

    #[test]
    fn extracts_single_call_with_surrounding_text() {
        let input = r#"Sure, transferring you now. <tool_call>{"name": "transfer", "arguments": {"destination": "sales"}}</tool_call>"#;
        let (clean, calls) = parse_response_with_tools(input);
        assert_eq!(clean, "Sure, transferring you now.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "transfer");
        assert_eq!(calls[0].arguments, json!({"destination": "sales"}));
    }

    #[test]
    fn extracts_multiple_calls() {
        let input = concat!(
            r#"<tool_call>{"name": "hangup_call", "arguments": {}}</tool_call>"#,
            " Goodbye! ",
            r#"<tool_call>{"name": "request_transcript", "arguments": {"email": "a@b.co"}}</tool_call>"#,
        );
        let (clean, calls) = parse_response_with_tools(input);
        assert_eq!(clean, "Goodbye!");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "hangup_call");
        assert_eq!(calls[1].name, "request_transcript");
    }

    #[test]
    fn malformed_json_is_dropped() {
        let input = r#"Okay. <tool_call>{not json}</tool_call> Done."#;
        let (clean, calls) = parse_response_with_tools(input);
        assert_eq!(clean, "Okay.  Done.");
        assert!(calls.is_empty());
    }

    #[test]
    fn unterminated_block_keeps_tail_text() {
        let input = r#"Hello <tool_call>{"name": "transfer""#;
        let (clean, calls) = parse_response_with_tools(input);
        assert!(clean.starts_with("Hello"));
        assert!(calls.is_empty());
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let input = r#"<tool_call>{"name": "leave_voicemail"}</tool_call>"#;
        let (_, calls) = parse_response_with_tools(input);
        assert_eq!(calls[0].arguments, json!({}));
    }
}
