//! Session management
//!
//! One terminal session moves between three modes:
//! - `shell` / `command`: discrete runs through the lite transport
//! - `interactive`: a live PTY over WebSocket, reattachable and
//!   retried with backoff when it drops
//!
//! [`SessionController`] holds the transition rules. [`SessionHandle`] is
//! the cloneable front of the actor task that owns it.

pub mod controller;
pub mod handle;
pub mod reconnect;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{ScheduledRetry, SessionController, NO_WIDGET_NOTICE};
pub use handle::{
    spawn_session, start_session, SessionCommand, SessionError, SessionHandle, SessionSnapshot,
};
pub use reconnect::{
    ReconnectConfig, ReconnectMachine, RetryPhase, RetryProgress, RetryTicket, MIN_RETRY_DELAY_MS,
};
pub use types::{CloseReason, ConnectionState, DisconnectReason, SessionMode};
