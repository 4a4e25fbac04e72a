//! Protocol adapters.
//!
//! Each adapter owns one live transport session inside a single supervisor
//! task: the task runs the read loop and drives reconnect backoff.
//! `disconnect` aborts the task, which guarantees that no timer or retry
//! belonging to a torn-down session can ever fire again. A network outage
//! ends the session with a `Disconnected` signal; redialing once
//! connectivity returns is the orchestrator's job.

pub mod socket;
pub mod streaming;

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::event::{ConnectionState, UnifiedEvent};

/// How long a dial attempt may take before it counts as failed.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an application-level ping may go unanswered.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// What an adapter reports back to the orchestrator.
#[derive(Debug)]
pub enum AdapterSignal {
    /// The session moved to a new state, with an optional error detail.
    State(ConnectionState, Option<String>),
    /// A data event arrived and parsed cleanly.
    Event(UnifiedEvent),
    /// Something went wrong mid-session. The adapter keeps handling its own
    /// recovery; this exists so the orchestrator can track failure rates and
    /// consider switching protocols.
    Failure { reason: String },
}

/// Shared reconnect pacing for both adapters.
pub(crate) struct ReconnectPacer {
    backoff: BackoffPolicy,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPacer {
    pub(crate) fn new(base_ms: u64, max_attempts: u32) -> Self {
        Self {
            backoff: BackoffPolicy::new(base_ms),
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or None when attempts are exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.backoff.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
