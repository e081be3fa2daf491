//! Transfer execution
//!
//! - [`executor`] - one attempt of one target, HTTP or rsync, under a deadline
//! - [`manager`] - bounded pool of worker slots with per-target retries
//! - [`checksum`] - digests and the `.done.json` completion records used for resume

pub mod checksum;
pub mod error;
pub mod executor;
pub mod http;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod rsync;

pub use error::TransferError;
pub use executor::{DownloadExecutor, Executor};
pub use manager::{DownloadManager, WorkerSlot};
pub use progress::{LogProgress, NoProgress, Progress, ProgressSink};
pub use retry::{Delay, NoDelay, RetryDecision, RetryPolicy, TokioDelay};
