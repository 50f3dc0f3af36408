// ABOUTME: Sync pipeline for watermark-based change replication
// ABOUTME: Reads tracked changes from the source database and relays them to the queue

pub mod daemon;
pub mod error;
pub mod normalize;
pub mod publisher;
pub mod reader;
pub mod watermark;

pub use daemon::{DaemonConfig, StalenessPolicy, SyncDaemon, SyncStats};
pub use error::SyncError;
pub use normalize::{
    global_id, normalize, ChangeOp, ChangeRecord, Provenance, SyncMessage, TableSpec,
};
pub use publisher::{AmqpPublisher, Publisher};
pub use reader::{preflight, ChangeSource, FetchOutcome, PostgresChangeReader};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};
