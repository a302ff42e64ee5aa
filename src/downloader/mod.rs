//! Download engine module

pub mod engine;
pub mod fetcher;
pub mod merger;
pub mod progress;
pub mod retry;
pub mod segment;
pub mod size;
pub mod store;

// Re-export for convenience
pub use engine::{Backends, DownloadConfig, DownloadEngine, DownloadSession};
pub use fetcher::{ChunkFetcher, ChunkRequest, FetchOutcome, HttpChunkFetcher};
pub use progress::{FileProgress, ProgressSnapshot, SessionState};
pub use retry::{RetryConfig, RetryPolicy, RetryReason};
pub use segment::{ChunkSpec, ChunkState, ChunkTiers, FileChunkSet, FileTarget};
pub use size::{SizeProbe, SizeResolver};
pub use store::ChunkStore;
