//! Cooperative cancellation for the analysis stages
//!
//! Long-running stages check a `Deadline` between operator nodes, never in
//! the middle of one, so anything computed before the check is complete at
//! node granularity.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returned by a stage that stopped because its deadline passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline exceeded")]
pub struct Interrupted;

/// Point in time after which work should stop, plus an explicit cancel signal
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: CancellationToken,
}

impl Deadline {
    /// A deadline that never expires on its own
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// A deadline that has already passed
    pub fn expired() -> Self {
        Self {
            at: Some(Instant::now()),
            token: CancellationToken::new(),
        }
    }

    /// Builds a deadline from an optional timeout in milliseconds
    pub fn from_timeout_ms(timeout_ms: Option<u64>) -> Self {
        match timeout_ms {
            Some(ms) => Self::after(Duration::from_millis(ms)),
            None => Self::unbounded(),
        }
    }

    /// Token that cancels this deadline when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels immediately, regardless of the time limit
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the time limit has passed or the token was cancelled
    pub fn is_expired(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Node-boundary check used by the tree-walking stages
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_expired() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Time left before expiry; `None` for an unbounded deadline
    pub fn remaining(&self) -> Option<Duration> {
        if self.token.is_cancelled() {
            return Some(Duration::ZERO);
        }
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}
