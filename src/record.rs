use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::constants::{BLOB_PREFIX, FLUSH_PREFIX, LOCK_PREFIX, QUEUE_PREFIX};
use crate::error::{StoreError, StoreResult};
use crate::status::QueueStatus;

/// Media track a queue carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Audio,
    Video,
    Screen,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Audio => "audio",
            QueueKind::Video => "video",
            QueueKind::Screen => "screen",
        }
    }

    /// MIME type of the stitched object
    pub fn content_type(self) -> &'static str {
        match self {
            QueueKind::Audio => "audio/webm",
            QueueKind::Video | QueueKind::Screen => "video/webm",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(QueueKind::Audio),
            "video" => Ok(QueueKind::Video),
            "screen" => Ok(QueueKind::Screen),
            other => Err(format!("Unknown queue type '{}'", other)),
        }
    }
}

/// `Queue_<draftId>_<type>`
pub fn queue_key(draft_id: &str, kind: QueueKind) -> String {
    format!("{}{}_{}", QUEUE_PREFIX, draft_id, kind)
}

/// Prefix shared by every queue key of one draft
pub fn queue_key_prefix(draft_id: &str) -> String {
    format!("{}{}_", QUEUE_PREFIX, draft_id)
}

pub fn lock_key(draft_id: &str, kind: QueueKind) -> String {
    format!("{}{}_{}", LOCK_PREFIX, draft_id, kind)
}

pub fn flush_key(draft_id: &str, kind: QueueKind) -> String {
    format!("{}{}_{}", FLUSH_PREFIX, draft_id, kind)
}

pub fn blob_key(draft_id: &str, kind: QueueKind, stamp: i64) -> String {
    format!("{}{}_{}_{}", BLOB_PREFIX, draft_id, kind, stamp)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraInfo {
    /// Path of the stitched object once concatenation succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concat_url: Option<String>,
}

/// Durable state of one recording's upload queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub draft_id: String,
    #[serde(rename = "type")]
    pub kind: QueueKind,
    pub status: QueueStatus,
    /// Pending chunk keys in arrival order
    pub record_queue: VecDeque<String>,
    /// Chunk sizes in arrival order, including already uploaded chunks
    pub chunk_sizes: Vec<u64>,
    pub total_size: u64,
    pub uploaded_size: u64,
    pub chunks_uploaded: u64,
    /// Remote paths of uploaded chunks in upload order
    pub media_keys: Vec<String>,
    pub live_queue: bool,
    pub was_stopped: bool,
    pub stitching_in_progress: bool,
    pub error_getting_element: u32,
    pub error_invoking_concat: u32,
    pub network_down: bool,
    pub queue_key: String,
    pub lock_key: String,
    pub flush_key: String,
    pub upload_path: String,
    pub stitch_path: String,
    pub content_type: String,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default)]
    pub extra_info: ExtraInfo,
}

impl QueueRecord {
    pub fn new(draft_id: &str, kind: QueueKind, upload_path: &str, stitch_path: &str) -> Self {
        Self {
            draft_id: draft_id.to_string(),
            kind,
            status: QueueStatus::Pending,
            record_queue: VecDeque::new(),
            chunk_sizes: Vec::new(),
            total_size: 0,
            uploaded_size: 0,
            chunks_uploaded: 0,
            media_keys: Vec::new(),
            live_queue: true,
            was_stopped: false,
            stitching_in_progress: false,
            error_getting_element: 0,
            error_invoking_concat: 0,
            network_down: false,
            queue_key: queue_key(draft_id, kind),
            lock_key: lock_key(draft_id, kind),
            flush_key: flush_key(draft_id, kind),
            upload_path: upload_path.trim_end_matches('/').to_string(),
            stitch_path: stitch_path.trim_end_matches('/').to_string(),
            content_type: kind.content_type().to_string(),
            start_time: 0,
            end_time: 0,
            extra_info: ExtraInfo::default(),
        }
    }

    /// Serialize for persistence; the stitching flag is never persisted as set
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut persisted = self.clone();
        persisted.stitching_in_progress = false;
        serde_json::to_vec(&persisted).map_err(|source| StoreError::Encode {
            key: self.queue_key.clone(),
            source,
        })
    }

    pub fn decode(key: &str, raw: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(raw).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })
    }
}

/// One-shot deletion request stored under a queue's flush key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushMarker {
    pub seen: bool,
}

impl FlushMarker {
    pub fn encode(&self, key: &str) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })
    }

    pub fn decode(key: &str, raw: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(raw).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(queue_key("d1", QueueKind::Audio), "Queue_d1_audio");
        assert_eq!(lock_key("d1", QueueKind::Screen), "Lock_d1_screen");
        assert_eq!(flush_key("d1", QueueKind::Video), "Flush_d1_video");
        assert_eq!(blob_key("d1", QueueKind::Audio, 42), "Blob_d1_audio_42");
        assert!(queue_key("d1", QueueKind::Video).starts_with(&queue_key_prefix("d1")));
        assert!(!queue_key("d10", QueueKind::Video).starts_with(&queue_key_prefix("d1")));
    }

    #[test]
    fn test_content_type_follows_kind() {
        assert_eq!(QueueKind::Audio.content_type(), "audio/webm");
        assert_eq!(QueueKind::Video.content_type(), "video/webm");
        assert_eq!(QueueKind::Screen.content_type(), "video/webm");
    }

    #[test]
    fn test_encode_clears_stitching_flag() {
        let mut record = QueueRecord::new("d1", QueueKind::Audio, "up/", "stitch");
        record.stitching_in_progress = true;
        let raw = record.encode().unwrap();
        let decoded = QueueRecord::decode(&record.queue_key, &raw).unwrap();
        assert!(!decoded.stitching_in_progress);
        assert_eq!(decoded.upload_path, "up");
    }

    #[test]
    fn test_record_uses_camel_case_fields() {
        let record = QueueRecord::new("d1", QueueKind::Video, "up", "stitch");
        let json: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "video");
        assert_eq!(json["queueKey"], "Queue_d1_video");
        assert_eq!(json["recordQueue"], serde_json::json!([]));
        assert_eq!(json["wasStopped"], false);
        assert!(json["extraInfo"].get("concatUrl").is_none());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("screen".parse::<QueueKind>().unwrap(), QueueKind::Screen);
        assert!("webcam".parse::<QueueKind>().is_err());
    }
}
