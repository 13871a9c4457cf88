//! Portal marker protocol
//!
//! Assistant replies may carry a structured payload for the visualization
//! surface after a `#PORTAL:` marker:
//!
//! ```text
//! Denver leads sales.
//!
//! #PORTAL:
//! {"chart_type": "bar", "labels": ["Denver"], "data": [258000]}
//! ```
//!
//! Extraction only splits text. Whether the payload is JSON, and what to do
//! when it is not, is decided by the caller through [`PayloadPolicy`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Literal token separating display text from the portal payload
pub const PORTAL_MARKER: &str = "#PORTAL:";

/// Where the payload ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortalBoundary {
    /// Everything after the marker belongs to the payload
    #[default]
    EndOfText,
    /// The payload stops at the first blank line after the marker; any text
    /// after that line is kept as part of the message
    BlankLine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub message: String,
    /// Raw text after the marker, trimmed; not validated
    pub portal_payload: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("Reply has no portal payload")]
    Missing,

    #[error("Portal payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Split `text` at the first marker, payload running to end of text.
pub fn extract_portal(text: &str) -> ExtractionResult {
    extract_portal_with(text, PortalBoundary::EndOfText)
}

pub fn extract_portal_with(text: &str, boundary: PortalBoundary) -> ExtractionResult {
    let Some(index) = text.find(PORTAL_MARKER) else {
        return ExtractionResult {
            message: text.to_string(),
            portal_payload: None,
        };
    };

    let before = text[..index].trim();
    let after = &text[index + PORTAL_MARKER.len()..];

    match boundary {
        PortalBoundary::EndOfText => ExtractionResult {
            message: before.to_string(),
            portal_payload: Some(after.trim().to_string()),
        },
        PortalBoundary::BlankLine => {
            let (payload, rest) = match after.find("\n\n") {
                Some(end) => (&after[..end], after[end + 2..].trim()),
                None => (after, ""),
            };
            let message = match (before.is_empty(), rest.is_empty()) {
                (_, true) => before.to_string(),
                (true, false) => rest.to_string(),
                (false, false) => format!("{before}\n\n{rest}"),
            };
            ExtractionResult {
                message,
                portal_payload: Some(payload.trim().to_string()),
            }
        }
    }
}

impl ExtractionResult {
    pub fn has_payload(&self) -> bool {
        self.portal_payload
            .as_deref()
            .is_some_and(|payload| !payload.is_empty())
    }

    /// Parse the payload candidate as arbitrary JSON.
    pub fn parse_payload(&self) -> Result<serde_json::Value, PortalError> {
        let raw = self.portal_payload.as_deref().ok_or(PortalError::Missing)?;
        Ok(serde_json::from_str(raw)?)
    }

    /// Parse the payload candidate as a chart description.
    pub fn chart(&self) -> Result<PortalPayload, PortalError> {
        let raw = self.portal_payload.as_deref().ok_or(PortalError::Missing)?;
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply the caller's decision about payloads that fail to parse.
    ///
    /// The visible message is never blanked: with [`PayloadPolicy::Ignore`] a
    /// bad payload is dropped, with [`PayloadPolicy::KeepAsText`] it is appended
    /// to the message as plain text.
    pub fn resolve(self, policy: PayloadPolicy) -> ResolvedReply {
        let parsed = self
            .portal_payload
            .is_some()
            .then(|| self.parse_payload());

        match parsed {
            None => ResolvedReply {
                message: self.message,
                visualization: None,
            },
            Some(Ok(value)) => {
                debug!("Portal payload parsed");
                ResolvedReply {
                    message: self.message,
                    visualization: Some(value),
                }
            }
            Some(Err(e)) => {
                warn!("Discarding portal payload: {}", e);
                let message = match (policy, self.portal_payload) {
                    (PayloadPolicy::KeepAsText, Some(raw)) if !raw.is_empty() => {
                        if self.message.is_empty() {
                            raw
                        } else {
                            format!("{}\n\n{}", self.message, raw)
                        }
                    }
                    _ => self.message,
                };
                ResolvedReply {
                    message,
                    visualization: None,
                }
            }
        }
    }
}

/// What to do with a payload that is not valid JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadPolicy {
    /// Drop it silently; only the message is shown
    #[default]
    Ignore,
    /// Show it as ordinary text after the message
    KeepAsText,
}

/// A reply ready for display
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReply {
    pub message: String,
    pub visualization: Option<serde_json::Value>,
}

/// Chart description as emitted by the assistant.
///
/// Both `chart_type` and `type` occur in practice; unknown keys are kept in
/// `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PortalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<serde_json::Value>,
    /// Either a flat series or a `{ labels, datasets }` object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PortalPayload {
    pub fn chart_kind(&self) -> Option<&str> {
        self.chart_type.as_deref().or(self.kind.as_deref())
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("Chart")
    }
}

/// Consumer of parsed portal payloads, e.g. a chart panel
pub trait PortalSink {
    fn show(&mut self, payload: &serde_json::Value);
}

/// Tracks a reply as fragments arrive.
#[derive(Debug, Default, Clone)]
pub struct PortalTracker {
    buffer: String,
    boundary: PortalBoundary,
    marker_seen: bool,
}

impl PortalTracker {
    pub fn new(boundary: PortalBoundary) -> Self {
        Self {
            boundary,
            ..Default::default()
        }
    }

    /// Append a fragment; returns true when this fragment completed the marker.
    pub fn push(&mut self, fragment: &str) -> bool {
        self.buffer.push_str(fragment);
        if self.marker_seen {
            return false;
        }
        // The marker may straddle fragments, so look back far enough to catch it
        let search_from = self
            .buffer
            .len()
            .saturating_sub(fragment.len() + PORTAL_MARKER.len());
        let search_from = floor_char_boundary(&self.buffer, search_from);
        self.marker_seen = self.buffer[search_from..].contains(PORTAL_MARKER);
        self.marker_seen
    }

    pub fn marker_seen(&self) -> bool {
        self.marker_seen
    }

    pub fn current(&self) -> ExtractionResult {
        extract_portal_with(&self.buffer, self.boundary)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
