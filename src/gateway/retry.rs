use std::cmp;
use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectOptions;
use crate::error::{CloseStatus, VoiceGatewayError};
use crate::gateway::connection::State;

/// Close codes that end the session for good: 4004 (authentication failed)
/// and 4014 (channel deleted or client kicked). 4014 is terminal but clean.
pub const NON_RETRYABLE_STATUS_CODES: &[u16] = &[4004, 4014];

pub fn is_non_retryable(code: u16) -> bool {
    NON_RETRYABLE_STATUS_CODES.contains(&code)
}

/// What the driver should do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Stop,
    Retry(State),
}

/// Pure classification of a close. A server migration always rebuilds the
/// session from scratch on the new endpoint; otherwise a session that was
/// connected at least once is worth resuming.
pub fn classify(
    status: &CloseStatus,
    cause: Option<&VoiceGatewayError>,
    connected_once: bool,
) -> Action {
    if is_non_retryable(status.code) {
        return Action::Stop;
    }
    if matches!(cause, Some(VoiceGatewayError::ServerMigration)) {
        return Action::Retry(State::Connecting);
    }
    if connected_once {
        Action::Retry(State::Resuming)
    } else {
        Action::Retry(State::Connecting)
    }
}

/// Mutable backoff state for one `start` call. Reset whenever an attempt
/// reaches CONNECTED.
#[derive(Debug)]
pub struct ReconnectContext {
    attempts: u32,
    backoff: Duration,
}

impl ReconnectContext {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Books one more attempt and returns its delay, or `None` once the
    /// attempt budget is spent.
    pub fn next_backoff(&mut self, options: &ReconnectOptions) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts > options.max_attempts {
            return None;
        }
        let base = if self.attempts == 1 {
            options.first_backoff()
        } else {
            cmp::min(self.backoff.mul_f64(options.factor), options.max_backoff())
        };
        self.backoff = base;
        let jitter = base.mul_f64(options.jitter * rand::thread_rng().gen_range(0.0..=1.0));
        Some(base + jitter)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff = Duration::ZERO;
    }
}

impl Default for ReconnectContext {
    fn default() -> Self {
        Self::new()
    }
}
