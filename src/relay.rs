//! Event-stream framing for relaying a completion to a browser.
//!
//! Each fragment becomes `data: {"chunk": "..."}`, the end of the stream is
//! `data: [DONE]` and a failure is `data: {"error": "..."}`; every frame is
//! followed by a blank line.

use crate::events::ChatEvent;
use crate::streaming::{DATA_PREFIX, DONE_SENTINEL};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Chunk(String),
    Done,
    Error(String),
}

impl RelayFrame {
    pub fn encode(&self) -> String {
        let data = match self {
            RelayFrame::Chunk(chunk) => json!({ "chunk": chunk }).to_string(),
            RelayFrame::Done => DONE_SENTINEL.to_string(),
            RelayFrame::Error(message) => json!({ "error": message }).to_string(),
        };
        format!("{DATA_PREFIX} {data}\n\n")
    }

    /// Frame for a chat event, if the event is relayed at all
    pub fn from_event(event: &ChatEvent) -> Option<Self> {
        match event {
            ChatEvent::Fragment(text) => Some(RelayFrame::Chunk(text.clone())),
            ChatEvent::PortalStarted => None,
            ChatEvent::Completed { .. } => Some(RelayFrame::Done),
            ChatEvent::Failed(message) => Some(RelayFrame::Error(message.clone())),
        }
    }
}
