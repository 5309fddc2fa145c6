//! The opaque event-codec boundary.
//!
//! The upstream wire schema is not this crate's business: a codec turns
//! one decoded frame into typed [`WarpEvent`]s and nothing else. The
//! default [`JsonEventCodec`] understands the JSON rendering of upstream
//! response events (`init` / `client_actions` / `finished` markers); a
//! binary codec can be swapped in behind the same trait.

use serde_json::Value;

use crate::errors::TransportError;
use crate::events::WarpEvent;

/// Decodes one frame into zero or more typed events.
pub trait EventCodec: Send + Sync {
    /// Decode a frame. An empty vec means "nothing interesting, keep
    /// reading".
    fn decode(&self, frame: &[u8]) -> Result<Vec<WarpEvent>, TransportError>;
}

/// Codec for the JSON rendering of upstream response events.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEventCodec;

impl EventCodec for JsonEventCodec {
    fn decode(&self, frame: &[u8]) -> Result<Vec<WarpEvent>, TransportError> {
        let value: Value =
            serde_json::from_slice(frame).map_err(|e| TransportError::Codec {
                message: format!("frame is not valid JSON: {e}"),
            })?;

        if let Some(init) = get(&value, "init") {
            return Ok(vec![WarpEvent::Meta {
                conversation_id: get(init, "conversation_id")
                    .and_then(Value::as_str)
                    .map(String::from),
                task_id: get(init, "task_id").and_then(Value::as_str).map(String::from),
            }]);
        }

        if get(&value, "finished").is_some() {
            return Ok(vec![WarpEvent::End]);
        }

        if let Some(error) = get(&value, "error") {
            let message = error
                .as_str()
                .map(String::from)
                .or_else(|| get(error, "message").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| error.to_string());
            return Ok(vec![WarpEvent::Error { message }]);
        }

        if let Some(client_actions) = get(&value, "client_actions") {
            return Ok(decode_client_actions(client_actions));
        }

        // Unrecognized event kinds are skipped, not fatal.
        Ok(Vec::new())
    }
}

fn decode_client_actions(client_actions: &Value) -> Vec<WarpEvent> {
    let mut events = Vec::new();
    let Some(actions) = get(client_actions, "actions").and_then(Value::as_array) else {
        return events;
    };

    for action in actions {
        if let Some(append) = get(action, "append_to_message_content") {
            if let Some(text) = message_text(get(append, "message").unwrap_or(&Value::Null)) {
                events.push(WarpEvent::Text { text });
            }
        }

        if let Some(add) = get(action, "add_messages_to_task") {
            let Some(messages) = get(add, "messages").and_then(Value::as_array) else {
                continue;
            };
            for message in messages {
                if let Some(text) = message_text(message) {
                    events.push(WarpEvent::Text { text });
                }
                if let Some(call) = tool_call(message) {
                    events.push(call);
                }
            }
        }
    }

    events
}

fn message_text(message: &Value) -> Option<String> {
    let text = get(message, "agent_output")?.get("text")?.as_str()?;
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

fn tool_call(message: &Value) -> Option<WarpEvent> {
    let tool_call = get(message, "tool_call")?;
    let mcp = get(tool_call, "call_mcp_tool")?;
    let name = get(mcp, "name")?.as_str()?.to_string();
    let arguments = get(mcp, "args")
        .map(|args| serde_json::to_string(args).unwrap_or_else(|_| "{}".into()))
        .unwrap_or_else(|| "{}".into());
    Some(WarpEvent::ToolCall {
        id: get(tool_call, "tool_call_id")
            .and_then(Value::as_str)
            .map(String::from),
        name,
        arguments,
    })
}

/// Field lookup tolerant of snake_case and camelCase keys.
fn get<'a>(value: &'a Value, snake: &str) -> Option<&'a Value> {
    if let Some(v) = value.get(snake) {
        return Some(v);
    }
    let mut camel = String::with_capacity(snake.len());
    let mut upper_next = false;
    for ch in snake.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            camel.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            camel.push(ch);
        }
    }
    value.get(camel)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(frame: &str) -> Vec<WarpEvent> {
        JsonEventCodec.decode(frame.as_bytes()).unwrap()
    }

    #[test]
    fn init_frame_becomes_meta() {
        let events = decode(r#"{"init":{"conversation_id":"c1","task_id":"t1"}}"#);
        assert_eq!(
            events,
            vec![WarpEvent::Meta {
                conversation_id: Some("c1".into()),
                task_id: Some("t1".into()),
            }]
        );
    }

    #[test]
    fn camel_case_keys_are_accepted() {
        let events = decode(r#"{"init":{"conversationId":"c1"}}"#);
        assert_eq!(
            events,
            vec![WarpEvent::Meta {
                conversation_id: Some("c1".into()),
                task_id: None,
            }]
        );
    }

    #[test]
    fn finished_frame_becomes_end() {
        assert_eq!(decode(r#"{"finished":{}}"#), vec![WarpEvent::End]);
    }

    #[test]
    fn append_content_becomes_text() {
        let events = decode(
            r#"{"client_actions":{"actions":[
                {"append_to_message_content":{"message":{"agent_output":{"text":"hello"}}}}
            ]}}"#,
        );
        assert_eq!(events, vec![WarpEvent::Text { text: "hello".into() }]);
    }

    #[test]
    fn add_messages_yields_text_and_tool_calls() {
        let events = decode(
            r#"{"client_actions":{"actions":[
                {"add_messages_to_task":{"messages":[
                    {"agent_output":{"text":"thinking"}},
                    {"tool_call":{"tool_call_id":"tc1","call_mcp_tool":{"name":"read_file","args":{"path":"/tmp"}}}}
                ]}}
            ]}}"#,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], WarpEvent::Text { text: "thinking".into() });
        match &events[1] {
            WarpEvent::ToolCall { id, name, arguments } => {
                assert_eq!(id.as_deref(), Some("tc1"));
                assert_eq!(name, "read_file");
                assert!(arguments.contains("/tmp"));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn error_frame_becomes_error() {
        let events = decode(r#"{"error":{"message":"Something went wrong with this conversation"}}"#);
        assert_eq!(
            events,
            vec![WarpEvent::Error {
                message: "Something went wrong with this conversation".into()
            }]
        );
    }

    #[test]
    fn unknown_frames_are_skipped() {
        assert!(decode(r#"{"heartbeat":{}}"#).is_empty());
        assert!(decode(r#"{"client_actions":{"actions":[]}}"#).is_empty());
    }

    #[test]
    fn invalid_json_is_a_codec_error() {
        assert!(JsonEventCodec.decode(b"\x00\x01").is_err());
    }

    #[test]
    fn empty_text_is_not_emitted() {
        let events = decode(
            r#"{"client_actions":{"actions":[
                {"append_to_message_content":{"message":{"agent_output":{"text":""}}}}
            ]}}"#,
        );
        assert!(events.is_empty());
    }
}
