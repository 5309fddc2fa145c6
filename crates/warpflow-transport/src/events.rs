//! Typed events decoded from the upstream stream.

use std::pin::Pin;

use futures::Stream;
use serde::Serialize;

/// Boxed stream of [`WarpEvent`]s returned by a send.
pub type EventStream = Pin<Box<dyn Stream<Item = WarpEvent> + Send>>;

/// One decoded upstream event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WarpEvent {
    /// Incremental agent text output.
    Text {
        /// The text delta.
        text: String,
    },
    /// A tool invocation requested by the agent.
    ToolCall {
        /// Upstream call id, when present.
        id: Option<String>,
        /// Tool name.
        name: String,
        /// JSON-encoded arguments.
        arguments: String,
    },
    /// Conversation/task identifiers from the stream preamble.
    Meta {
        /// Upstream conversation id.
        conversation_id: Option<String>,
        /// Upstream task id.
        task_id: Option<String>,
    },
    /// The stream finished normally.
    End,
    /// Upstream reported an error (possibly mid-stream). Terminal.
    Error {
        /// Error description used for classification.
        message: String,
    },
}

impl WarpEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(WarpEvent::End.is_terminal());
        assert!(WarpEvent::Error {
            message: "x".into()
        }
        .is_terminal());
        assert!(!WarpEvent::Text { text: "hi".into() }.is_terminal());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(WarpEvent::Text { text: "hi".into() }).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");
    }
}
