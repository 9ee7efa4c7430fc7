//! Common types for BIG-IP autoscale: instance records, mailbox messages,
//! errors, retry and configuration

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod instance;
pub mod message;
pub mod retry;
pub mod telemetry;

pub use config::AutoscaleConfig;
pub use error::Error;
pub use instance::{Instance, InstanceStatus, Instances, PrimaryHealth, PrimaryStatus};
pub use message::{Credentials, JoinRequest, Message, MessageAction, SyncCompletePayload};
pub use retry::{ErrorMatcher, RetryExecutor, RetryPolicy, ShortRetry};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Minimum time between two join requests from the same instance
pub const JOIN_DEBOUNCE_SECS: i64 = 5 * 60;
