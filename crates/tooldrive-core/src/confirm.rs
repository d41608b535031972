//! Single-slot human confirmation channel.
//!
//! A tool that needs the user asks through [`ConfirmationChannel::request`];
//! whichever front-end is attached sees the prompt via [`ConfirmationChannel::subscribe`]
//! and answers with [`ConfirmationChannel::reply`]. Only one request may be
//! outstanding at a time; a second one fails immediately with
//! [`ConfirmationError::Busy`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::error::ConfirmationError;
use crate::message::SECRET_DISPLAY;

/// Placeholder used when the user submits nothing.
pub const NO_REPLY: &str = "(no user reply)";

const END_SENTINEL: &str = "\"\"\"end";

/// The prompt currently waiting for an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPrompt {
    pub id: u64,
    pub prompt: String,
    /// Front-ends should not echo the answer.
    pub secret: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationReply {
    pub reply: String,
    /// What may be shown or logged; `[SECRET]` for secret answers.
    pub display_reply: String,
    pub cancelled: bool,
}

struct ActiveRequest {
    id: u64,
    reply_tx: oneshot::Sender<String>,
}

pub struct ConfirmationChannel {
    active: Mutex<Option<ActiveRequest>>,
    prompt_tx: watch::Sender<Option<PendingPrompt>>,
    next_id: AtomicU64,
}

impl Default for ConfirmationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfirmationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationChannel")
            .field("pending", &self.pending())
            .finish()
    }
}

impl ConfirmationChannel {
    pub fn new() -> Self {
        let (prompt_tx, _rx) = watch::channel(None);
        Self {
            active: Mutex::new(None),
            prompt_tx,
            next_id: AtomicU64::new(1),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveRequest>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the user and wait for the answer.
    pub async fn request(
        &self,
        prompt: impl Into<String>,
        secret: bool,
    ) -> Result<ConfirmationReply, ConfirmationError> {
        let prompt = prompt.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = {
            let mut slot = self.slot();
            if slot.is_some() {
                return Err(ConfirmationError::Busy);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            *slot = Some(ActiveRequest { id, reply_tx });
            id
        };

        debug!(request_id = id, secret, "Confirmation requested");
        self.prompt_tx.send_replace(Some(PendingPrompt { id, prompt, secret }));

        // Frees the slot if this future is dropped (timeout, abort) before a reply.
        let _release = ReleaseOnDrop { channel: self, id };

        let raw = reply_rx.await.map_err(|_| ConfirmationError::Closed)?;
        Ok(build_reply(&raw, secret))
    }

    /// Ask a yes/no question; anything but `y`/`yes` within `timeout` is a no.
    ///
    /// Library-level gate for callers that must not block indefinitely.
    /// `human_ask` waits through [`request`](Self::request) instead, with no
    /// deadline, because its answer is free text the model is waiting on.
    pub async fn confirm(&self, prompt: impl Into<String>, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.request(prompt, false)).await {
            Ok(Ok(reply)) if !reply.cancelled => {
                matches!(reply.reply.trim().to_ascii_lowercase().as_str(), "y" | "yes")
            }
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                warn!(%e, "Confirmation unavailable, treating as denied");
                false
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "Confirmation timed out");
                false
            }
        }
    }

    /// Deliver the user's answer to the waiting request.
    pub fn reply(&self, text: impl Into<String>) -> Result<(), ConfirmationError> {
        let active = self.slot().take().ok_or(ConfirmationError::NotActive)?;
        self.prompt_tx.send_replace(None);
        debug!(request_id = active.id, "Confirmation answered");
        active
            .reply_tx
            .send(text.into())
            .map_err(|_| ConfirmationError::Closed)
    }

    pub fn pending(&self) -> Option<PendingPrompt> {
        self.prompt_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PendingPrompt>> {
        self.prompt_tx.subscribe()
    }

    fn release(&self, id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|a| a.id == id) {
            *slot = None;
            drop(slot);
            self.prompt_tx.send_if_modified(|current| {
                if current.as_ref().is_some_and(|p| p.id == id) {
                    *current = None;
                    true
                } else {
                    false
                }
            });
            debug!(request_id = id, "Confirmation abandoned");
        }
    }
}

struct ReleaseOnDrop<'a> {
    channel: &'a ConfirmationChannel,
    id: u64,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.channel.release(self.id);
    }
}

/// Normalise a raw answer: CRLF to LF, trailing `"""end` sentinel and blank
/// lines dropped, empty input replaced by [`NO_REPLY`].
pub fn normalize_reply(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");
    let mut lines: Vec<&str> = text.split('\n').collect();
    while let Some(last) = lines.last() {
        let t = last.trim();
        if t.is_empty() || t == END_SENTINEL {
            lines.pop();
        } else {
            break;
        }
    }
    let joined = lines.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        NO_REPLY.to_string()
    } else {
        trimmed.to_string()
    }
}

fn build_reply(raw: &str, secret: bool) -> ConfirmationReply {
    let reply = normalize_reply(raw);
    let lowered = reply.trim().to_ascii_lowercase();
    let cancelled = lowered == "c" || lowered == "cancel";
    let display_reply = if secret && !cancelled {
        SECRET_DISPLAY.to_string()
    } else {
        reply.clone()
    };
    ConfirmationReply {
        reply,
        display_reply,
        cancelled,
    }
}
