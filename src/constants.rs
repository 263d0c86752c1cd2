use rand::Rng;

/// Prefix of every per-identifier store name (`recording_<id>`)
pub const RECORDING_PREFIX: &str = "recording_";

pub const QUEUE_PREFIX: &str = "Queue_";
pub const LOCK_PREFIX: &str = "Lock_";
pub const FLUSH_PREFIX: &str = "Flush_";
pub const BLOB_PREFIX: &str = "Blob_";

/// Secondary index value attached to every persisted queue record
pub const QUEUE_OBJECT_TYPE: &str = "queue";

/// A lease older than this is considered abandoned and may be taken over
pub const LEASE_TTL_MS: i64 = 15_000;
pub const LEASE_RENEW_INTERVAL_MS: u64 = 5_000;
pub const LEASE_CHECK_INTERVAL_MS: u64 = 5_000;

/// Base processing tick; a random jitter below `PROCESS_JITTER_MS` is added
pub const PROCESS_INTERVAL_MS: u64 = 3_000;
pub const PROCESS_JITTER_MS: u64 = 1_000;

/// Retry bounds before a queue gives up and moves to `Error`
pub const MAX_ELEMENT_FETCH_ERRORS: u32 = 10;
pub const MAX_CONCAT_ERRORS: u32 = 10;

pub const CHUNK_EXTENSION: &str = "webm";

/// Generate a request identifier for remote operations that report one
pub fn generate_request_id() -> String {
    format!(
        "req_{}",
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(12)
            .map(char::from)
            .collect::<String>()
    )
}

/// Pick the delay before the next processing tick: `base + [0, jitter)`
pub fn jittered_interval_ms(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    base_ms + rand::thread_rng().gen_range(0..jitter_ms)
}
