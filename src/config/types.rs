//! Terminal configuration types

use serde::{Deserialize, Serialize};

use crate::session::reconnect::ReconnectConfig;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Control panel endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Panel origin, e.g. `http://192.168.1.1:8088`
    pub base_url: String,
    /// Interactive PTY WebSocket path
    pub ws_path: String,
    /// One-shot WebSocket token endpoint. `None` connects without a token.
    pub token_path: Option<String>,
    /// Capability probe endpoint. `None` assumes WebSocket support.
    pub capabilities_path: Option<String>,
    /// Discrete command runner endpoint
    pub run_command_path: String,
    /// Poll interval while waiting for a command job (ms)
    pub job_poll_interval_ms: u64,
    /// Client-side limit for a single command job (seconds)
    pub job_max_wait_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088".to_string(),
            ws_path: "/ws/pty".to_string(),
            token_path: Some("/api/ws-token".to_string()),
            capabilities_path: Some("/api/capabilities".to_string()),
            run_command_path: "/api/run-command".to_string(),
            job_poll_interval_ms: 1000,
            job_max_wait_secs: 300,
        }
    }
}

impl ServerConfig {
    /// Join an absolute path onto the HTTP origin
    pub fn http_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// WebSocket origin derived from the HTTP origin (`http` → `ws`, `https` → `wss`)
    pub fn ws_origin(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        }
    }
}

/// Post-processing applied to lite (discrete) command output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiteOutputConfig {
    pub strip_ansi: bool,
    pub highlight_warn_err: bool,
    pub detect_confirm_prompts: bool,
}

impl Default for LiteOutputConfig {
    fn default() -> Self {
        Self {
            strip_ansi: false,
            highlight_warn_err: false,
            detect_confirm_prompts: true,
        }
    }
}

/// Root terminal configuration (`terminal.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub version: u32,
    pub server: ServerConfig,
    /// Identifies this client tab; reattachment keys are scoped by it
    pub tab_id: String,
    /// Keepalive ping interval on the interactive channel (seconds)
    pub keepalive_secs: u64,
    /// WebSocket handshake timeout (seconds)
    pub connect_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
    pub lite: LiteOutputConfig,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerConfig::default(),
            tab_id: uuid::Uuid::new_v4().to_string(),
            keepalive_secs: 25,
            connect_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
            lite: LiteOutputConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_origin() {
        let mut server = ServerConfig::default();
        server.base_url = "https://panel.lan/".to_string();
        assert_eq!(server.ws_origin(), "wss://panel.lan");

        server.base_url = "http://10.0.0.1:8088".to_string();
        assert_eq!(server.ws_origin(), "ws://10.0.0.1:8088");
        assert_eq!(
            server.http_url("/api/ws-token"),
            "http://10.0.0.1:8088/api/ws-token"
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TerminalConfig =
            serde_json::from_str(r#"{"server": {"base_url": "http://r1"}}"#).unwrap();
        assert_eq!(config.server.base_url, "http://r1");
        assert_eq!(config.server.ws_path, "/ws/pty");
        assert_eq!(config.keepalive_secs, 25);
        assert!(!config.tab_id.is_empty());
    }
}
