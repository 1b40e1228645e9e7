//! Session Reconnection Module
//!
//! Decides when an interactive session should be reconnected after the
//! channel drops. The machine is purely synchronous and clock-driven: the
//! owner feeds it transport outcomes plus the current instant, and it hands
//! back at most one [`RetryTicket`] describing when the next attempt is due.
//! Arming the timer for that ticket is the caller's job.
//!
//! A ticket is only honoured if it is still the pending one when it fires,
//! so a timer that outlives `stop`, `retry_now` or a successful connect is
//! a no-op.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lower bound for any computed delay
pub const MIN_RETRY_DELAY_MS: u64 = 100;

/// Reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of scheduled attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before the first attempt (ms)
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts (ms)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.15 = ±15%)
    pub jitter: f64,
    /// Whether to enable automatic reconnection
    pub enabled: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 800,
            max_delay_ms: 20_000,
            backoff_multiplier: 1.8,
            jitter: 0.0,
            enabled: true,
        }
    }
}

impl ReconnectConfig {
    /// Nominal delay for an attempt number (1-based), before jitter
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let cap = self.max_delay_ms.max(MIN_RETRY_DELAY_MS) as f64;
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = (self.initial_delay_ms as f64 * multiplier.powi(exponent)).floor();
        let delay = delay.max(MIN_RETRY_DELAY_MS as f64).min(cap);
        Duration::from_millis(delay as u64)
    }
}

/// Connection phase as seen by the retry machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPhase {
    Idle,
    Connecting,
    Connected,
    Retrying,
}

/// A scheduled reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTicket {
    pub generation: u64,
    pub attempt: u32,
    pub delay: Duration,
    pub due: Instant,
}

/// Observable retry state for status indicators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryProgress {
    pub phase: RetryPhase,
    pub active: bool,
    pub blocked: bool,
    pub exhausted: bool,
    pub attempt: u32,
    pub next_attempt_at: Option<Instant>,
    pub remaining: Option<Duration>,
}

/// Reconnection state machine for a single session
#[derive(Debug)]
pub struct ReconnectMachine {
    config: ReconnectConfig,
    phase: RetryPhase,
    attempt: u32,
    blocked: bool,
    exhausted: bool,
    generation: u64,
    pending: Option<RetryTicket>,
    last_delay: Duration,
}

impl ReconnectMachine {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            phase: RetryPhase::Idle,
            attempt: 0,
            blocked: false,
            exhausted: false,
            generation: 0,
            pending: None,
            last_delay: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Retry is in progress: a ticket is pending or a retry attempt is connecting
    pub fn is_active(&self) -> bool {
        match self.phase {
            RetryPhase::Retrying => true,
            RetryPhase::Connecting => self.attempt > 0,
            RetryPhase::Idle | RetryPhase::Connected => false,
        }
    }

    pub fn pending(&self) -> Option<RetryTicket> {
        self.pending
    }

    /// A connect attempt is starting (initial open or manual reconnect)
    pub fn begin_connect(&mut self) {
        self.cancel_pending();
        self.phase = RetryPhase::Connecting;
    }

    /// The channel is open: the retry cycle is over
    pub fn on_connected(&mut self) {
        if self.attempt > 0 {
            info!("Reconnected after {} attempt(s)", self.attempt);
        }
        self.cancel_pending();
        self.phase = RetryPhase::Connected;
        self.attempt = 0;
        self.blocked = false;
        self.exhausted = false;
        self.last_delay = Duration::ZERO;
    }

    /// The channel dropped without being asked to.
    ///
    /// Returns the ticket to arm, or `None` when retry is disabled, blocked,
    /// exhausted, or a ticket is already pending.
    pub fn on_unexpected_disconnect(&mut self, now: Instant) -> Option<RetryTicket> {
        if self.pending.is_some() {
            debug!("Retry already scheduled, ignoring duplicate disconnect report");
            return None;
        }

        if !self.config.enabled || self.blocked {
            self.phase = RetryPhase::Idle;
            return None;
        }

        if self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts {
            warn!(
                "Reconnection given up after {} attempt(s)",
                self.attempt
            );
            self.phase = RetryPhase::Idle;
            self.exhausted = true;
            return None;
        }

        self.attempt += 1;
        let delay = self.next_delay(self.attempt);
        self.last_delay = delay;
        self.generation += 1;

        let ticket = RetryTicket {
            generation: self.generation,
            attempt: self.attempt,
            delay,
            due: now + delay,
        };
        self.pending = Some(ticket);
        self.phase = RetryPhase::Retrying;

        info!(
            "Scheduling reconnect attempt {} in {}ms",
            ticket.attempt,
            delay.as_millis()
        );
        Some(ticket)
    }

    /// A retry timer fired. Returns `true` if the caller should connect now.
    pub fn accept(&mut self, ticket: RetryTicket) -> bool {
        match self.pending {
            Some(pending) if pending.generation == ticket.generation => {
                self.pending = None;
                self.phase = RetryPhase::Connecting;
                true
            }
            _ => {
                debug!("Ignoring stale retry ticket {}", ticket.generation);
                false
            }
        }
    }

    /// Manual "reconnect now": skip the wait, keep the attempt count
    pub fn retry_now(&mut self) {
        self.cancel_pending();
        self.blocked = false;
        self.exhausted = false;
        self.phase = RetryPhase::Connecting;
    }

    /// Manual "stop retry": no further automatic attempts until unblocked
    pub fn stop(&mut self) {
        self.cancel_pending();
        self.blocked = true;
        if self.phase != RetryPhase::Connected {
            self.phase = RetryPhase::Idle;
        }
    }

    /// Intentional teardown (close, detach, mode change): forget the cycle
    /// without blocking future retries
    pub fn pause(&mut self) {
        self.cancel_pending();
        self.phase = RetryPhase::Idle;
        self.attempt = 0;
        self.exhausted = false;
        self.last_delay = Duration::ZERO;
    }

    pub fn unblock(&mut self) {
        self.blocked = false;
        self.exhausted = false;
    }

    pub fn progress(&self, now: Instant) -> RetryProgress {
        let next_attempt_at = self.pending.map(|t| t.due);
        RetryProgress {
            phase: self.phase,
            active: self.is_active(),
            blocked: self.blocked,
            exhausted: self.exhausted,
            attempt: self.attempt,
            next_attempt_at,
            remaining: next_attempt_at.map(|due| due.saturating_duration_since(now)),
        }
    }

    fn cancel_pending(&mut self) {
        if self.pending.take().is_some() {
            self.generation += 1;
        }
    }

    /// Jittered delay, never shorter than the previous one in this cycle
    fn next_delay(&self, attempt: u32) -> Duration {
        let nominal = self.config.calculate_delay(attempt);
        let jitter = if self.config.jitter.is_finite() {
            self.config.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let delay = if jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-jitter..=jitter);
            let ms = (nominal.as_millis() as f64 * (1.0 + spread)).floor();
            let cap = self.config.max_delay_ms.max(MIN_RETRY_DELAY_MS) as f64;
            Duration::from_millis(ms.clamp(MIN_RETRY_DELAY_MS as f64, cap) as u64)
        } else {
            nominal
        };

        delay.max(self.last_delay)
    }
}
