//! Progress and user-facing notices emitted while talking to the portal.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PortalEvent {
    /// Transient message for the user (connect retries, portal messages,
    /// per-page failures).
    Notice(String),
    /// The portal session is established.
    Connected,
    /// Result count reported by the first page of a submission.
    TotalFound(usize),
    /// Records merged so far for the running search.
    Progress {
        fetched: usize,
        total: usize,
        elapsed: Duration,
    },
}

/// Cloneable sender for [`PortalEvent`]s. Sends never block or fail; events
/// are dropped when nobody listens.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PortalEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PortalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn send(&self, event: PortalEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        info!(notice = %message);
        self.send(PortalEvent::Notice(message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(notice = %message);
        self.send(PortalEvent::Notice(message));
    }
}
