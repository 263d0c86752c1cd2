// Library interface for the binary and the integration tests

pub mod capture;
pub mod clock;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod events;
pub mod lease;
pub mod queries;
pub mod queue;
pub mod record;
pub mod recovery;
pub mod remote;
pub mod runner;
pub mod schema;
pub mod service;
pub mod status;
pub mod store;

pub use error::{ConfigError, ErrorKind, QueueError, RemoteError, ServiceError, StoreError};
pub use queue::{Queue, QueueDeps, TickOutcome};
pub use record::{QueueKind, QueueRecord};
pub use service::{RecordingSession, UploadService};
pub use status::{ActivityStatus, QueueStatus};
