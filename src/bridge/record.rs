use bytes::Bytes;
use serde::Serialize;

use crate::adapter::ExecutionMode;
use crate::backend::ExecutionEvent;
use crate::conversation::ConversationKey;

/// One NDJSON line of a chat response.
///
/// A stream is `start`, any number of `event`s, then exactly one of
/// `complete`, `cancelled` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamRecord {
    Start {
        request_id: String,
        conversation_key: ConversationKey,
        mode: ExecutionMode,
    },
    Event {
        request_id: String,
        event: ExecutionEvent,
    },
    Complete {
        request_id: String,
    },
    Cancelled {
        request_id: String,
    },
    Error {
        request_id: String,
        message: String,
    },
}

impl StreamRecord {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Start { request_id, .. }
            | Self::Event { request_id, .. }
            | Self::Complete { request_id }
            | Self::Cancelled { request_id }
            | Self::Error { request_id, .. } => request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Cancelled { .. } | Self::Error { .. }
        )
    }

    /// Serialize as a single newline-terminated JSON line.
    pub fn to_ndjson(&self) -> Result<Bytes, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_use_camel_case_fields_and_a_type_tag() {
        let start = StreamRecord::Start {
            request_id: "r1".to_string(),
            conversation_key: ConversationKey::new("u", "g", "t"),
            mode: ExecutionMode::OneShot,
        };
        let value: serde_json::Value = serde_json::from_slice(&start.to_ndjson().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "start", "requestId": "r1", "conversationKey": "u:g:t", "mode": "one_shot"})
        );

        let event = StreamRecord::Event {
            request_id: "r1".to_string(),
            event: ExecutionEvent::TextDelta {
                content: "hi".to_string(),
            },
        };
        let line = event.to_ndjson().unwrap();
        assert!(line.ends_with(b"\n"));
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["event"], json!({"type": "text_delta", "content": "hi"}));
        assert!(!event.is_terminal());
    }

    #[test]
    fn terminal_records() {
        let error = StreamRecord::Error {
            request_id: "r".to_string(),
            message: "boom".to_string(),
        };
        assert!(error.is_terminal());
        assert_eq!(error.request_id(), "r");
        assert!(StreamRecord::Cancelled {
            request_id: "r".to_string()
        }
        .is_terminal());
    }
}
