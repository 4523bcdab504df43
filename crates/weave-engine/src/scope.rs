use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a scoped future did not run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    Deadline,
}

/// Cancellation plus an optional deadline, shared by everything running
/// under one chain or one step attempt.
///
/// Child scopes inherit cancellation from their parent and never outlive
/// the parent's deadline.
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl Scope {
    /// A scope cancelled together with `parent`, expiring after `timeout`.
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token: parent.child_token(),
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
        }
    }

    /// A nested scope whose deadline is the earlier of the parent's and `timeout`.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        Self {
            token: self.token.child_token(),
            deadline,
            timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The timeout this scope was created with (not inherited).
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn done(&self) -> Interrupt {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Interrupt::Cancelled,
            _ = deadline_reached(self.deadline) => Interrupt::Deadline,
        }
    }

    /// Drive `fut` until it completes or the scope ends.
    ///
    /// When the deadline fires first the scope's token is cancelled, so
    /// work observing it (tools holding the token) stops as well.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            _ = deadline_reached(self.deadline) => {
                self.token.cancel();
                Err(Interrupt::Deadline)
            }
            out = fut => Ok(out),
        }
    }

    /// Sleep for `delay`, waking early if the scope ends.
    pub async fn sleep(&self, delay: Duration) -> Result<(), Interrupt> {
        if delay.is_zero() {
            if self.is_done() {
                return Err(self.interrupt());
            }
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            _ = deadline_reached(self.deadline) => Err(Interrupt::Deadline),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn interrupt(&self) -> Interrupt {
        if self.is_expired() {
            Interrupt::Deadline
        } else {
            Interrupt::Cancelled
        }
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
