//! Line protocol spoken with pooled worker processes.
//!
//! Every message is one JSON object terminated by `\n`.
//!
//! Broker → worker: `query`, `cancel`, `shutdown`.
//! Worker → broker: `ready` once after start, then `event` and `done` per
//! query. A cancelled query must still be answered with `done`.

use serde::{Deserialize, Serialize};

use crate::backend::ExecutionEvent;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerRequest<'a> {
    Query {
        #[serde(rename = "requestId")]
        request_id: &'a str,
        prompt: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<&'a str>,
    },
    Cancel {
        #[serde(rename = "requestId")]
        request_id: &'a str,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerMessage {
    Ready,
    Event {
        #[serde(rename = "requestId")]
        request_id: String,
        event: ExecutionEvent,
    },
    Done {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default)]
        error: Option<String>,
    },
    Log {
        #[serde(default)]
        message: String,
    },
}

pub(crate) fn encode_line(request: &WorkerRequest<'_>) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    Ok(line)
}
