//! Retry execution with error classification.
//!
//! Every network call made during a convergence pass (directory reads and
//! writes, device commands, mailbox traffic, backup transfers) runs under a
//! [`RetryPolicy`]. Before each retry the failure is classified: some errors
//! are rejected outright, the rest are retried at a fixed interval until the
//! budget is spent.
//!
//! A policy may also carry a [`ShortRetry`] override. While the operation keeps
//! failing with one of the override codes, the executor swaps in the override's
//! (usually much smaller) budget and interval. As soon as a different error
//! shows up, the budget that was remaining when the override kicked in is
//! restored.
//!
//! # Example
//!
//! ```ignore
//! use bigip_autoscale_common::retry::{RetryExecutor, RetryPolicy};
//!
//! let executor = RetryExecutor::new(RetryPolicy::default_retry());
//! let instances = executor
//!     .run("get_instances", || directory.get_instances())
//!     .await?;
//! ```

use std::time::Duration;

use regex::Regex;
use tracing::{error, warn};

use crate::Error;

/// Matches an error message either by substring or by regular expression
#[derive(Clone, Debug)]
pub enum ErrorMatcher {
    /// Matches when the message contains this text
    Text(String),
    /// Matches when the pattern finds a match anywhere in the message
    Pattern(Regex),
}

impl ErrorMatcher {
    /// Substring matcher
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Regular expression matcher
    pub fn pattern(pattern: &str) -> Result<Self, Error> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| Error::validation_for_field("pattern", e.to_string()))
    }

    /// Whether the message matches
    pub fn matches(&self, message: &str) -> bool {
        match self {
            Self::Text(text) => message.contains(text.as_str()),
            Self::Pattern(regex) => regex.is_match(message),
        }
    }
}

/// Temporary budget used while an operation fails with specific codes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShortRetry {
    /// Error codes that switch the executor to this budget
    pub codes: Vec<u16>,
    /// Retries allowed while the override is active
    pub max_retries: u32,
    /// Interval between retries while the override is active
    pub retry_interval: Duration,
}

/// Retry policy for a single operation. Immutable per invocation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_interval: Duration,
    /// Treat 400 responses as retryable
    pub continue_on_error: bool,
    /// Treat 400 responses whose message matches as retryable
    pub continue_on_error_message: Option<ErrorMatcher>,
    /// Messages that make a failure permanent
    pub fail_on_error_messages: Vec<ErrorMatcher>,
    /// Codes that make a failure permanent
    pub fail_on_error_codes: Vec<u16>,
    /// Temporary override budget for specific codes
    pub short_retry_on_error: Option<ShortRetry>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_retry()
    }
}

impl RetryPolicy {
    /// Create a policy with the given budget and no classification rules
    pub fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries,
            retry_interval,
            continue_on_error: false,
            continue_on_error_message: None,
            fail_on_error_messages: Vec::new(),
            fail_on_error_codes: Vec::new(),
            short_retry_on_error: None,
        }
    }

    /// 90 retries, 10 seconds apart
    pub fn default_retry() -> Self {
        Self::new(90, Duration::from_secs(10))
    }

    /// 30 retries, 2 seconds apart
    pub fn medium() -> Self {
        Self::new(30, Duration::from_secs(2))
    }

    /// 3 retries, 300 milliseconds apart
    pub fn short() -> Self {
        Self::new(3, Duration::from_millis(300))
    }

    /// A single attempt
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Reject immediately on any of these codes
    pub fn with_fail_on_error_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.fail_on_error_codes = codes.into_iter().collect();
        self
    }

    /// Reject immediately on a matching message
    pub fn with_fail_on_error_message(mut self, matcher: ErrorMatcher) -> Self {
        self.fail_on_error_messages.push(matcher);
        self
    }

    /// Retry 400 responses instead of rejecting them
    pub fn with_continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Retry 400 responses whose message matches
    pub fn with_continue_on_error_message(mut self, matcher: ErrorMatcher) -> Self {
        self.continue_on_error_message = Some(matcher);
        self
    }

    /// Use a short budget while failures carry one of `codes`
    pub fn with_short_retry(
        mut self,
        codes: impl IntoIterator<Item = u16>,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Self {
        self.short_retry_on_error = Some(ShortRetry {
            codes: codes.into_iter().collect(),
            max_retries,
            retry_interval,
        });
        self
    }

    /// Whether a failure is permanent under this policy
    ///
    /// Checked in order: permanent error kinds, message rules, code rules,
    /// then the 400 rule. Anything else is retryable.
    pub fn should_reject(&self, err: &Error) -> bool {
        if err.is_permanent() {
            return true;
        }

        let message = err.message();
        if self
            .fail_on_error_messages
            .iter()
            .any(|matcher| matcher.matches(&message))
        {
            return true;
        }

        match err.code() {
            Some(code) if self.fail_on_error_codes.contains(&code) => true,
            Some(400) => {
                let continue_on_message = self
                    .continue_on_error_message
                    .as_ref()
                    .is_some_and(|matcher| matcher.matches(&message));
                !(self.continue_on_error || continue_on_message)
            }
            _ => false,
        }
    }

    fn is_short_retry_code(&self, code: Option<u16>) -> bool {
        match (&self.short_retry_on_error, code) {
            (Some(short), Some(code)) => short.codes.contains(&code),
            _ => false,
        }
    }
}

/// Runs operations to completion under a retry policy
///
/// Holds the policy used by [`RetryExecutor::run`]; callers that need a
/// different policy for one call use [`RetryExecutor::run_with`].
#[derive(Clone, Debug, Default)]
pub struct RetryExecutor {
    default_policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor with the given default policy
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self { default_policy }
    }

    /// The policy used by [`RetryExecutor::run`]
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Run an operation under the default policy
    pub async fn run<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        self.run_with(&self.default_policy, operation_name, operation)
            .await
    }

    /// Run an operation under an explicit policy
    ///
    /// Returns the first success, the first rejected failure, or the last
    /// failure wrapped with [`Error::exhausted`] once the budget is spent.
    pub async fn run_with<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let mut num_remaining = policy.max_retries;
        let mut retry_interval = policy.retry_interval;
        // Budget to restore once the short-retry override is released
        let mut resume_retries: Option<u32> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };

            if policy.should_reject(&err) {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %err,
                    "Operation failed with a permanent error"
                );
                return Err(err);
            }

            if num_remaining == 0 {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %err,
                    "Operation failed after max retries"
                );
                return Err(err.exhausted());
            }

            let short_code = policy.is_short_retry_code(err.code());
            match (&policy.short_retry_on_error, resume_retries) {
                (Some(short), None) if short_code => {
                    resume_retries = Some(num_remaining);
                    num_remaining = short.max_retries;
                    retry_interval = short.retry_interval;
                }
                (Some(_), Some(resume)) if !short_code => {
                    num_remaining = resume;
                    retry_interval = policy.retry_interval;
                    resume_retries = None;
                }
                _ => num_remaining -= 1,
            }

            warn!(
                operation = %operation_name,
                attempt,
                remaining = num_remaining,
                error = %err,
                delay_ms = retry_interval.as_millis() as u64,
                "Operation failed, retrying"
            );

            tokio::time::sleep(retry_interval).await;
        }
    }
}
