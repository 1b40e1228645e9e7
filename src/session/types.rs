//! Session type definitions

use serde::{Deserialize, Serialize};

/// Terminal mode for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Discrete shell commands through the lite runner
    #[default]
    Shell,
    /// Discrete runs of the panel's own command (line input is its flag)
    Command,
    /// Raw PTY byte stream
    Interactive,
}

impl SessionMode {
    pub fn is_interactive(self) -> bool {
        matches!(self, Self::Interactive)
    }

    /// Discrete modes accept input through the line-input field
    pub fn uses_line_input(self) -> bool {
        !self.is_interactive()
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell => write!(f, "shell"),
            Self::Command => write!(f, "command"),
            Self::Interactive => write!(f, "interactive"),
        }
    }
}

/// Connection indicator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Why the local side is tearing a channel down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Disconnect,
    Close,
    Detach,
    Kill,
    NewSession,
    ModeChange,
    Lite,
    /// Old channel dropped right before a fresh connect
    ConnectPrep,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnect => "disconnect",
            Self::Close => "close",
            Self::Detach => "detach",
            Self::Kill => "kill",
            Self::NewSession => "new_session",
            Self::ModeChange => "mode_change",
            Self::Lite => "lite",
            Self::ConnectPrep => "connect_prep",
        };
        f.write_str(s)
    }
}

/// How a channel ended, as reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local teardown requested by the controller
    Requested(DisconnectReason),
    /// Socket error or close nobody asked for
    Unexpected(String),
    /// Server sent a `close` frame
    ServerClose,
    /// Remote process exited
    Exited(Option<i32>),
}

impl CloseReason {
    /// Whether the retry machinery should schedule an attempt
    pub fn schedules_retry(&self) -> bool {
        matches!(self, Self::Unexpected(_) | Self::ServerClose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_is_shell() {
        assert_eq!(SessionMode::default(), SessionMode::Shell);
        assert!(SessionMode::Command.uses_line_input());
        assert!(!SessionMode::Interactive.uses_line_input());
    }

    #[test]
    fn test_only_unplanned_closes_retry() {
        assert!(CloseReason::Unexpected("reset".into()).schedules_retry());
        assert!(CloseReason::ServerClose.schedules_retry());
        assert!(!CloseReason::Requested(DisconnectReason::Detach).schedules_retry());
        assert!(!CloseReason::Exited(Some(0)).schedules_retry());
    }

    #[test]
    fn test_mode_serde() {
        let json = serde_json::to_string(&SessionMode::Interactive).unwrap();
        assert_eq!(json, "\"interactive\"");
        let mode: SessionMode = serde_json::from_str("\"command\"").unwrap();
        assert_eq!(mode, SessionMode::Command);
    }
}
