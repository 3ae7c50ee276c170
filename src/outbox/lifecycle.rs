//! Delivery lifecycle of outbox records and its retry policy.
//!
//! ```text
//!  Delayed ──┐
//!            ├──> Sending ──> Succeeded
//!  Pending ──┘     │  ^
//!     ^            │  └─ lease expired
//!     │            ├──> Pending   (retries += 1, backoff)
//!     └────────────┘
//!                  └──> Failed    (retries >= failed_retry_count)
//! ```
//!
//! A record enters `Sending` with a lease: its `next_attempt_at` is pushed
//! `in_flight_lease` ahead. If the attempt never records an outcome (the
//! process dies, or persisting the outcome fails) the record becomes due
//! again once the lease runs out.
//!
//! [`RetryPolicy`] is the only code that moves a [`MediumMessage`] between
//! states. Storage backends persist whatever it decided; they never change
//! state on their own.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::outbox::MediumMessage;

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Waiting for its delay time to pass.
    Delayed,
    /// Waiting for its first or next delivery attempt.
    Pending,
    /// A delivery attempt is in progress.
    Sending,
    /// Delivered; kept until it expires.
    Succeeded,
    /// Retries exhausted or the message can never be delivered.
    Failed,
}

impl MessageState {
    /// Terminal records are never attempted again.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Succeeded | MessageState::Failed)
    }
}

/// Maps the number of failed attempts so far to the wait before the next
/// attempt.
pub trait BackoffStrategy: fmt::Debug + Send + Sync {
    fn delay(&self, retries: u32) -> Duration;
}

/// `base * 2^(retries - 1)`, capped at `max`.
///
/// | retries | delay (base = 2s) |
/// |---------|-------------------|
/// | 1       | 2s                |
/// | 2       | 4s                |
/// | 3       | 8s                |
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, retries: u32) -> Duration {
        if retries == 0 {
            return Duration::ZERO;
        }

        let shift = retries.saturating_sub(1);
        let multiplier = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

/// The same wait after every failure.
#[derive(Debug, Clone)]
pub struct FixedBackoff(pub Duration);

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _retries: u32) -> Duration {
        self.0
    }
}

/// What happened to a record after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`; the next attempt is due at `next_attempt_at`.
    Scheduled {
        retries: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retries exhausted; the record is terminally `Failed`.
    Exhausted { retries: u32 },
}

/// State transitions and timers of the outbox lifecycle.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    failed_retry_count: u32,
    backoff: Arc<dyn BackoffStrategy>,
    succeed_expiration: Duration,
    failed_expiration: Duration,
    in_flight_lease: Duration,
}

impl RetryPolicy {
    /// Policy with the given backoff, 50 attempts, succeeded records kept for
    /// a day, failed records for 15 days and a 4 minute in-flight lease.
    pub fn new(backoff: impl BackoffStrategy + 'static) -> Self {
        Self {
            failed_retry_count: 50,
            backoff: Arc::new(backoff),
            succeed_expiration: Duration::from_secs(24 * 3600),
            failed_expiration: Duration::from_secs(15 * 24 * 3600),
            in_flight_lease: DEFAULT_IN_FLIGHT_LEASE,
        }
    }

    pub fn with_failed_retry_count(mut self, count: u32) -> Self {
        self.failed_retry_count = count;
        self
    }

    pub fn with_succeed_expiration(mut self, expiration: Duration) -> Self {
        self.succeed_expiration = expiration;
        self
    }

    pub fn with_failed_expiration(mut self, expiration: Duration) -> Self {
        self.failed_expiration = expiration;
        self
    }

    /// How long a `Sending` record is left alone before it is due again.
    pub fn with_in_flight_lease(mut self, lease: Duration) -> Self {
        self.in_flight_lease = lease;
        self
    }

    pub fn failed_retry_count(&self) -> u32 {
        self.failed_retry_count
    }

    /// Wait before the attempt following `retries` failures.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        self.backoff.delay(retries)
    }

    /// `Pending | Delayed → Sending`, leasing the record until
    /// `now + in_flight_lease`.
    ///
    /// A `Sending` record whose lease has run out may be taken again.
    pub fn begin_attempt(
        &self,
        msg: &mut MediumMessage,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        match msg.state {
            MessageState::Pending | MessageState::Delayed => {}
            MessageState::Sending if msg.lease_expired(now) => {
                tracing::warn!(id = %msg.id, "Taking over a record whose in-flight lease expired");
            }
            from => return Err(LifecycleError::new(&msg.id, from, MessageState::Sending)),
        }
        msg.state = MessageState::Sending;
        msg.next_attempt_at = Some(after(now, self.in_flight_lease));
        Ok(())
    }

    /// `Sending → Succeeded`, expiring after the succeed expiration.
    pub fn succeed(&self, msg: &mut MediumMessage, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.expect_sending(msg, MessageState::Succeeded)?;
        msg.state = MessageState::Succeeded;
        msg.next_attempt_at = None;
        msg.expires_at = Some(after(now, self.succeed_expiration));
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// `Sending → Pending` with the next attempt scheduled by the backoff,
    /// or `Sending → Failed` once `retries` reaches the retry count. The
    /// failure is summarized in the exception header either way.
    pub fn fail(
        &self,
        msg: &mut MediumMessage,
        now: DateTime<Utc>,
        type_name: &str,
        reason: impl fmt::Display,
    ) -> Result<RetryDecision, LifecycleError> {
        self.expect_sending(msg, MessageState::Pending)?;
        msg.retries = msg.retries.saturating_add(1);
        msg.headers.set_exception(type_name, reason);

        if msg.retries >= self.failed_retry_count {
            self.mark_failed(msg, now);
            return Ok(RetryDecision::Exhausted {
                retries: msg.retries,
            });
        }

        let next_attempt_at = after(now, self.backoff.delay(msg.retries));
        msg.state = MessageState::Pending;
        msg.next_attempt_at = Some(next_attempt_at);
        Ok(RetryDecision::Scheduled {
            retries: msg.retries,
            next_attempt_at,
        })
    }

    /// Fail a record that can never be delivered, without further retries.
    pub fn fail_terminal(
        &self,
        msg: &mut MediumMessage,
        now: DateTime<Utc>,
        type_name: &str,
        reason: impl fmt::Display,
    ) -> Result<(), LifecycleError> {
        if msg.state.is_terminal() {
            return Err(LifecycleError::new(&msg.id, msg.state, MessageState::Failed));
        }
        msg.retries = msg.retries.saturating_add(1);
        msg.headers.set_exception(type_name, reason);
        self.mark_failed(msg, now);
        Ok(())
    }

    fn mark_failed(&self, msg: &mut MediumMessage, now: DateTime<Utc>) {
        msg.state = MessageState::Failed;
        msg.next_attempt_at = None;
        msg.expires_at = Some(after(now, self.failed_expiration));
    }

    fn expect_sending(&self, msg: &MediumMessage, to: MessageState) -> Result<(), LifecycleError> {
        if msg.state == MessageState::Sending {
            Ok(())
        } else {
            Err(LifecycleError::new(&msg.id, msg.state, to))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(ExponentialBackoff::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ))
    }
}

const DEFAULT_IN_FLIGHT_LEASE: Duration = Duration::from_secs(240);

fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Error returned for a transition the lifecycle does not allow.
#[derive(Debug)]
pub struct LifecycleError {
    context: SpanTrace,
    id: String,
    from: MessageState,
    to: MessageState,
}

impl LifecycleError {
    fn new(id: &str, from: MessageState, to: MessageState) -> Self {
        Self {
            context: SpanTrace::capture(),
            id: id.to_owned(),
            from,
            to,
        }
    }

    pub fn from_state(&self) -> MessageState {
        self.from
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Message {} cannot move from {:?} to {:?}",
            self.id, self.from, self.to
        )?;
        self.context.fmt(f)
    }
}

impl std::error::Error for LifecycleError {}
