use serde::{Deserialize, Serialize};
use std::fmt;

/// Activity of the recorder or of the uploader attached to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivityStatus {
    Active,
    #[default]
    Inactive,
    Cancelled,
}

/// Persisted lifecycle state of a queue
///
/// `Pending` and `Stitching` are the only states with work left. `Delete` is
/// never written back; it is the in-memory outcome of a flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Stitching,
    Done,
    NoData,
    Error,
    Delete,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Done | QueueStatus::NoData | QueueStatus::Error | QueueStatus::Delete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "Pending",
            QueueStatus::Stitching => "Stitching",
            QueueStatus::Done => "Done",
            QueueStatus::NoData => "NoData",
            QueueStatus::Error => "Error",
            QueueStatus::Delete => "Delete",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
