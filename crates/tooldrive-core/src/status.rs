//! Busy/idle status signal shared with front-ends.

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub busy: bool,
    /// Short label of the current activity, e.g. `LLM` or `tool:read_file`.
    pub label: String,
}

/// Publishes the runtime's current activity. Front-ends subscribe and render it.
#[derive(Debug)]
pub struct StatusReporter {
    tx: watch::Sender<StatusSnapshot>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self { tx }
    }

    pub fn set(&self, busy: bool, label: impl Into<String>) {
        let next = StatusSnapshot {
            busy,
            label: label.into(),
        };
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            debug!(busy = next.busy, label = %next.label, "Status changed");
        }
    }

    pub fn busy(&self, label: impl Into<String>) {
        self.set(true, label);
    }

    pub fn idle(&self) {
        self.set(false, "");
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}
