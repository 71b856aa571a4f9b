pub mod error;
pub mod types;
pub mod config;
pub mod retry;

pub use config::{DaemonConfig, FailurePolicy, LogConfig, RplConfig, SetupConfig, SkipConfig};
pub use error::{RplError, RplResult};
pub use retry::{
    cancellable_sleep, retry, retry_until_cancelled, retry_with, retry_with_until_cancelled, Attempt, AttemptFuture,
    RetryPolicy,
};
pub use types::*;
