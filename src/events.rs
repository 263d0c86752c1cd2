use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::record::QueueKind;
use crate::remote::RemoteObject;
use crate::status::QueueStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueProgress {
    pub kind: QueueKind,
    pub status: QueueStatus,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

/// Notifications a queue sends to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Progress(QueueProgress),
    Error {
        kind: QueueKind,
        error: ErrorKind,
        /// The queue gave up; no further work will happen
        fatal: bool,
    },
    Complete(RemoteObject),
}

/// Sending half of a queue's event channel; silently drops events when
/// nobody listens
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<QueueEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<QueueEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: QueueEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<QueueEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}
