//! Transport abstraction
//!
//! Two kinds share the [`Transport`] trait:
//! - [`PtyTransport`]: persistent, order-preserving WebSocket channel to a
//!   remote PTY, reattachable by session id
//! - [`LiteTransport`]: one HTTP command run per submitted line
//!
//! Transports never call back into the controller. Everything they observe
//! is pushed as a [`TransportEvent`] stamped with the connection generation
//! that produced it, so the owner can drop events from superseded
//! connections.

pub mod api;
pub mod error;
pub mod lite;
pub mod protocol;
pub mod pty;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::session::{CloseReason, DisconnectReason, SessionMode};

pub use api::{CommandReply, CommandRequest, PanelApi};
pub use error::TransportError;
pub use lite::{
    detect_confirm_prompt, highlight_warn_err, CommandExecutor, CommandOutcome,
    HttpCommandExecutor, LiteTransport,
};
pub use protocol::{parse_server_frame, ClientFrame, ServerFrame};
pub use pty::PtyTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Interactive,
    Lite,
}

impl TransportKind {
    pub fn for_mode(mode: SessionMode) -> Self {
        if mode.is_interactive() {
            Self::Interactive
        } else {
            Self::Lite
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => write!(f, "pty"),
            Self::Lite => write!(f, "lite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub cols: u16,
    pub rows: u16,
    /// Stamped on every event this connection produces
    pub generation: u64,
    /// Resume from the last seen output sequence instead of a full replay
    pub preserve_screen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Tell the remote side to terminate the process before tearing down
    pub send_close: bool,
    /// Forget the reattachment key
    pub clear_session: bool,
    pub reason: DisconnectReason,
}

impl DisconnectOptions {
    pub fn graceful(reason: DisconnectReason) -> Self {
        Self {
            send_close: true,
            clear_session: false,
            reason,
        }
    }

    /// Local teardown only; the remote process keeps running
    pub fn silent(reason: DisconnectReason) -> Self {
        Self {
            send_close: false,
            clear_session: false,
            reason,
        }
    }

    pub fn kill(reason: DisconnectReason) -> Self {
        Self {
            send_close: true,
            clear_session: true,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub prefer: Option<TransportKind>,
    /// Queue instead of failing while disconnected; flushed on next connect
    pub allow_when_disconnected: bool,
    /// Feed the line to the previous command's stdin (lite only)
    pub as_stdin: bool,
}

impl SendOptions {
    pub fn queued() -> Self {
        Self {
            allow_when_disconnected: true,
            ..Self::default()
        }
    }

    pub fn prefer(kind: TransportKind) -> Self {
        Self {
            prefer: Some(kind),
            ..Self::default()
        }
    }
}

/// Reattachment key for a server-side PTY
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionKey {
    pub session_id: Option<String>,
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Connecting,
    Connected {
        session_key: SessionKey,
    },
    Output(String),
    /// Screen lines replayed by the server on (re)attach
    Replay(Vec<String>),
    SessionInfo {
        session_id: Option<String>,
        shell: Option<String>,
        reused: bool,
    },
    Closed(CloseReason),
    Error {
        message: String,
        permanent: bool,
    },
    Exited {
        code: Option<i32>,
    },
    /// Unterminated lite input held until a line terminator arrives
    InputBuffered {
        text: String,
    },
    CommandFinished {
        exit_code: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub kind: TransportKind,
    pub generation: u64,
    pub payload: TransportEventKind,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self, opts: ConnectOptions) -> Result<(), TransportError>;

    async fn disconnect(&self, opts: DisconnectOptions);

    /// Returns `false` when the data was not delivered or queued
    fn send(&self, data: &str, opts: SendOptions) -> bool;

    fn is_connected(&self) -> bool;

    /// Returns whether a resize frame went out
    fn resize(&self, _cols: u16, _rows: u16) -> bool {
        false
    }

    fn send_signal(&self, _name: &str) -> bool {
        false
    }

    fn session_key(&self) -> SessionKey {
        SessionKey::default()
    }

    /// Discrete transports shape requests by mode
    fn set_mode(&self, _mode: SessionMode) {}
}

/// Both transports, routed by mode or by an explicit preference
#[derive(Clone)]
pub struct TransportSet {
    interactive: Arc<dyn Transport>,
    lite: Arc<dyn Transport>,
}

impl TransportSet {
    pub fn new(interactive: Arc<dyn Transport>, lite: Arc<dyn Transport>) -> Self {
        Self { interactive, lite }
    }

    pub fn interactive(&self) -> &Arc<dyn Transport> {
        &self.interactive
    }

    pub fn lite(&self) -> &Arc<dyn Transport> {
        &self.lite
    }

    pub fn get(&self, kind: TransportKind) -> &Arc<dyn Transport> {
        match kind {
            TransportKind::Interactive => &self.interactive,
            TransportKind::Lite => &self.lite,
        }
    }

    pub fn route(&self, mode: SessionMode, prefer: Option<TransportKind>) -> &Arc<dyn Transport> {
        self.get(prefer.unwrap_or_else(|| TransportKind::for_mode(mode)))
    }
}
