//! Terminal event bus
//!
//! Typed publish/subscribe channel shared by the surface manager and the
//! session controller. Publishing never blocks and never fails: events sent
//! while nobody is subscribed are dropped, slow subscribers observe
//! `RecvError::Lagged`.

use tokio::sync::broadcast;

use crate::session::reconnect::RetryProgress;
use crate::session::types::{ConnectionState, SessionMode};

pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Raw key event reported by the terminal widget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

impl KeyEvent {
    pub fn plain(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            alt: false,
            shift: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    /// User input produced by the widget
    Data(String),
    Key(KeyEvent),
    Resize { cols: u16, rows: u16 },
    ModeChanged(SessionMode),
    ConnectionState(ConnectionState),
    Retry(RetryProgress),
    /// Line-input field should be enabled (discrete modes) or disabled
    LineInput { enabled: bool },
    /// Plain-text fallback region visibility
    FallbackVisible(bool),
    /// Server identified the interactive session
    SessionInfo {
        session_id: Option<String>,
        shell: Option<String>,
        reused: bool,
    },
    HistoryChanged { len: usize },
    /// Lite output looks like it is waiting for a confirmation answer
    ConfirmPrompt { text: String },
    /// A discrete command finished
    CommandFinished { exit_code: i32 },
    Exited { code: Option<i32> },
    Notice { level: NoticeLevel, message: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TerminalEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: TerminalEvent) {
        // Err only means there are no subscribers right now
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.publish(TerminalEvent::Notice {
            level,
            message: message.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(TerminalEvent::Data("x".into()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(TerminalEvent::Resize { cols: 80, rows: 24 });
        bus.notice(NoticeLevel::Info, "hello");

        assert_eq!(
            rx.recv().await.unwrap(),
            TerminalEvent::Resize { cols: 80, rows: 24 }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            TerminalEvent::Notice { level: NoticeLevel::Info, .. }
        ));
    }
}
