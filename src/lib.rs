//! Streaming chat-completion client with portal payload extraction
//!
//! This crate implements:
//! - A client for OpenAI-compatible chat completion endpoints, one-shot or
//!   streamed fragment by fragment
//! - Extraction of `#PORTAL:` visualization payloads from assistant replies
//! - An event channel that decouples the decoder from any UI
//! - System prompt construction from injectable dashboard data
//! - Recording and playback of streamed responses for debugging and testing

#[cfg(test)]
mod tests;

mod utils;

pub mod config;
pub mod context;
pub mod events;
pub mod openai;
pub mod portal;
pub mod recording;
pub mod relay;
pub mod streaming;
pub mod types;

pub use config::{resolve_api_key, ClientConfig, CredentialSource};
pub use events::{
    spawn_completion, spawn_completion_with_capacity, ChatEvent, ChatHandle, EVENT_CHANNEL_CAPACITY,
};
pub use openai::OpenAIClient;
pub use portal::{
    extract_portal, extract_portal_with, ExtractionResult, PayloadPolicy, PortalBoundary,
    PortalPayload, PortalSink, PortalTracker, PORTAL_MARKER,
};
pub use types::*;
pub use utils::rate_limit_fallback_text;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Receives each text fragment of a streamed completion, in order.
/// Returning an error aborts the stream.
pub type StreamingCallback = Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Trait for chat completion providers
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Sends `messages` and returns the completion. Streams fragments to
    /// `streaming_callback` when one is given.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        streaming_callback: Option<&StreamingCallback>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse>;
}
