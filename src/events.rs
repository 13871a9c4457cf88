//! Completion events for UI layers.
//!
//! Instead of calling into UI state from the decoder, a completion runs on its
//! own task and publishes [`ChatEvent`]s on a channel the UI subscribes to.
//! The channel is bounded: a subscriber that falls behind pauses chunk reading
//! until it catches up.

use crate::portal::{extract_portal_with, ExtractionResult, PortalBoundary, PortalTracker};
use crate::types::{ChatMessage, CompletionResponse};
use crate::{CompletionProvider, StreamingCallback};
use std::sync::{Arc, Mutex};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Next piece of assistant text
    Fragment(String),
    /// The portal marker has fully arrived; the payload follows in later fragments
    PortalStarted,
    /// The stream ended (normally, cancelled, or truncated)
    Completed {
        reply: ExtractionResult,
        response: CompletionResponse,
    },
    /// The request failed; the string is suitable for inline display
    Failed(String),
}

/// Events buffered before the producer waits for the subscriber
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Handle to a running completion
pub struct ChatHandle {
    events: mpsc::Receiver<ChatEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChatHandle {
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    /// Stop reading the response; a `Completed` event with the partial text follows
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain every remaining event until the task finishes.
    pub async fn collect(mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        if let Err(e) = self.task.await {
            warn!("Completion task ended abnormally: {}", e);
        }
        events
    }
}

/// Run a completion on a new task and return its event stream.
///
/// Must be called from the multi-threaded runtime: the streaming callback is
/// synchronous, so waiting for channel capacity blocks the worker in place.
/// Dropping the handle cancels the request.
pub fn spawn_completion(
    provider: Arc<dyn CompletionProvider>,
    messages: Vec<ChatMessage>,
    boundary: PortalBoundary,
) -> ChatHandle {
    spawn_completion_with_capacity(provider, messages, boundary, EVENT_CHANNEL_CAPACITY)
}

pub fn spawn_completion_with_capacity(
    provider: Arc<dyn CompletionProvider>,
    messages: Vec<ChatMessage>,
    boundary: PortalBoundary,
    capacity: usize,
) -> ChatHandle {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        if Handle::current().runtime_flavor() == RuntimeFlavor::CurrentThread {
            let _ = tx
                .send(ChatEvent::Failed(
                    "Streaming events need the multi-threaded tokio runtime".to_string(),
                ))
                .await;
            return;
        }

        let tracker = Arc::new(Mutex::new(PortalTracker::new(boundary)));

        let callback: StreamingCallback = {
            let tx = tx.clone();
            let cancel = task_cancel.clone();
            let tracker = tracker.clone();
            Box::new(move |fragment: &str| {
                let marker_arrived = tracker
                    .lock()
                    .map_err(|_| anyhow::anyhow!("portal tracker lock poisoned"))?
                    .push(fragment);

                let mut delivered = publish(&tx, ChatEvent::Fragment(fragment.to_string()));
                if delivered && marker_arrived {
                    delivered = publish(&tx, ChatEvent::PortalStarted);
                }
                if !delivered {
                    debug!("Event receiver dropped, cancelling completion");
                    cancel.cancel();
                }
                Ok(())
            })
        };

        let result = provider
            .complete(&messages, Some(&callback), &task_cancel)
            .await;

        let event = match result {
            Ok(response) => ChatEvent::Completed {
                reply: extract_portal_with(&response.text, boundary),
                response,
            },
            Err(e) => ChatEvent::Failed(e.to_string()),
        };
        let _ = tx.send(event).await;
    });

    ChatHandle {
        events: rx,
        cancel,
        task,
    }
}

/// Send from the synchronous callback, waiting while the channel is full.
/// Returns false once the receiver is gone.
fn publish(tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(event)) => {
            tokio::task::block_in_place(|| tx.blocking_send(event)).is_ok()
        }
    }
}
