pub mod api;
pub mod config;
pub mod errors;
pub mod finalizer;
pub mod ledger;
pub mod orchestrator;
pub mod planner;
pub mod transport;
pub mod types;

mod worker;

// 重新导出核心类型
pub use api::{AttachmentInfo, HttpUploadEndpoint, UploadEndpoint};
pub use config::{Config, UploadConfig, DEFAULT_CHUNK_SIZE, MAX_RETRIES};
pub use errors::{Result, UploadError};
pub use finalizer::Finalizer;
pub use ledger::{JsonFileLedger, Ledger, MemoryLedger};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use transport::ChunkTransport;
pub use types::{UploadEvent, UploadId, UploadProgress, UploadRecord, UploadStatus};
