use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{KeelError, KeelResult};

/// The single time budget shared by every step of one deploy run.
///
/// Cloning shares the cancellation token, so cancelling any clone aborts
/// every wait that observes the deadline.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self { at: Instant::now() + budget, cancel: CancellationToken::new() }
    }

    pub fn remaining(&self) -> Duration {
        if self.cancel.is_cancelled() { return Duration::ZERO; }
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_exceeded(&self) -> bool { self.cancel.is_cancelled() || Instant::now() >= self.at }

    pub fn cancel(&self) { self.cancel.cancel(); }
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Resolves once the deadline passes or the run is cancelled.
    pub async fn expired(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.at) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Sleep for `d`, cut short by the deadline. Returns false when the
    /// deadline won the race.
    pub async fn sleep(&self, d: Duration) -> bool {
        let wake = Instant::now() + d;
        if wake >= self.at {
            self.expired().await;
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => !self.is_cancelled(),
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Race `fut` against the deadline.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> KeelResult<T>
    where
        F: Future<Output = KeelResult<T>>,
    {
        if self.is_exceeded() {
            return Err(self.timeout_error(what));
        }
        tokio::select! {
            res = fut => res,
            _ = self.expired() => Err(self.timeout_error(what)),
        }
    }

    pub fn timeout_error(&self, what: &str) -> KeelError {
        if self.is_cancelled() {
            KeelError::Timeout(format!("{}: run cancelled", what))
        } else {
            KeelError::Timeout(format!("{}: deadline exceeded", what))
        }
    }
}
