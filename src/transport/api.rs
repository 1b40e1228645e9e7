//! Control panel HTTP endpoints used by the transports
//!
//! - `POST <token_path>` → `{ok, token}`: one-shot WebSocket token
//! - `GET <capabilities_path>` → `{websocket}`: capability probe
//! - `POST <run_command_path>` `{cmd|flag, stdin?}`: start a command job,
//!   then `GET <run_command_path>/<job_id>` until it finishes

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::TransportError;
use crate::config::ServerConfig;

/// What a discrete run executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandRequest {
    /// Arbitrary shell command line
    Shell {
        cmd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stdin: Option<String>,
    },
    /// The panel's own command with this flag
    Flag {
        flag: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stdin: Option<String>,
    },
}

impl CommandRequest {
    pub fn text(&self) -> &str {
        match self {
            Self::Shell { cmd, .. } => cmd,
            Self::Flag { flag, .. } => flag,
        }
    }
}

/// Normalized result of a command run or one poll of its job
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandReply {
    pub ok: bool,
    pub job_id: Option<String>,
    /// `running`, `finished`, `error` for jobs; `None` for direct replies
    pub status: Option<String>,
    pub output: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl CommandReply {
    pub fn is_finished(&self) -> bool {
        match self.status.as_deref() {
            Some("finished") | Some("error") => true,
            Some(_) => false,
            None => self.job_id.is_none(),
        }
    }

    fn from_value(value: &Value, http_ok: bool) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let exit_code = ["exit_code", "exitCode"]
            .iter()
            .find_map(|key| value.get(*key))
            .and_then(|v| match v {
                Value::Number(n) => n.as_i64().map(|c| c as i32),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            });
        let ok = http_ok && value.get("ok").and_then(Value::as_bool).unwrap_or(true);

        Self {
            ok,
            job_id: value.get("job_id").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            status: text("status"),
            output: text("stdout")
                .or_else(|| text("output"))
                .or_else(|| text("text"))
                .unwrap_or_default(),
            exit_code,
            error: text("error"),
        }
    }
}

#[derive(Clone)]
pub struct PanelApi {
    client: reqwest::Client,
    server: ServerConfig,
}

impl PanelApi {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            server,
        }
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// Fetch a one-shot WebSocket token. `Ok(None)` when no token endpoint
    /// is configured.
    pub async fn fetch_ws_token(&self) -> Result<Option<String>, TransportError> {
        let Some(path) = self.server.token_path.as_deref() else {
            return Ok(None);
        };

        let response = self
            .client
            .post(self.server.http_url(path))
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await
            .map_err(|e| TransportError::Token(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Token(e.to_string()))?;
        let value: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

        let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !status.is_success() || !ok {
            let msg = value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(TransportError::Token(msg));
        }

        Ok(Some(
            value
                .get("token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ))
    }

    /// Whether the panel serves the interactive WebSocket. A panel that
    /// answers without `websocket: true` is a "no"; failing to get an
    /// answer at all is an error.
    pub async fn websocket_supported(&self) -> Result<bool, TransportError> {
        let Some(path) = self.server.capabilities_path.as_deref() else {
            return Ok(true);
        };

        let response = self.client.get(self.server.http_url(path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Capability probe answered HTTP {}", status.as_u16());
            return Err(TransportError::Http(format!(
                "capability probe answered HTTP {}",
                status.as_u16()
            )));
        }
        let body = response.text().await?;
        Ok(serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("websocket").and_then(Value::as_bool))
            .unwrap_or(false))
    }

    /// Run a command to completion, handing each new output chunk to
    /// `on_chunk`. Direct replies and job-based replies are both handled.
    pub async fn run_command<F>(
        &self,
        request: &CommandRequest,
        mut on_chunk: F,
    ) -> Result<CommandReply, TransportError>
    where
        F: FnMut(&str) + Send,
    {
        let url = self.server.http_url(&self.server.run_command_path);
        let body = serde_json::to_string(request)?;

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        let http_ok = response.status().is_success();
        let status_code = response.status().as_u16();
        let text = response.text().await?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let reply = CommandReply::from_value(&value, http_ok);

        if !reply.ok {
            return Err(TransportError::Server(
                reply
                    .error
                    .unwrap_or_else(|| format!("HTTP {}", status_code)),
            ));
        }

        let Some(job_id) = reply.job_id.clone() else {
            if !reply.output.is_empty() {
                on_chunk(&reply.output);
            }
            return Ok(reply);
        };

        debug!("Command job {} started", job_id);
        self.wait_for_job(&url, &job_id, on_chunk).await
    }

    async fn wait_for_job<F>(
        &self,
        base_url: &str,
        job_id: &str,
        mut on_chunk: F,
    ) -> Result<CommandReply, TransportError>
    where
        F: FnMut(&str) + Send,
    {
        let poll = Duration::from_millis(self.server.job_poll_interval_ms.max(50));
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.server.job_max_wait_secs.max(1));
        let job_url = job_url(base_url, job_id)?;
        let mut seen_chars = 0usize;
        let mut accumulated = String::new();

        loop {
            let response = self.client.get(job_url.clone()).send().await?;
            let http_ok = response.status().is_success();
            let status_code = response.status().as_u16();
            let text = response.text().await?;
            let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let mut reply = CommandReply::from_value(&value, http_ok);

            // Jobs report cumulative output, hand out only the new tail
            let total = reply.output.chars().count();
            if total > seen_chars {
                let chunk: String = reply.output.chars().skip(seen_chars).collect();
                seen_chars = total;
                on_chunk(&chunk);
                accumulated.push_str(&chunk);
            }

            if !reply.ok {
                let msg = reply
                    .error
                    .take()
                    .unwrap_or_else(|| format!("HTTP {}", status_code));
                return Err(TransportError::Server(msg));
            }

            if reply.is_finished() {
                reply.output = accumulated;
                return Ok(reply);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Timeout(format!(
                    "command job {} did not finish in time",
                    job_id
                )));
            }

            tokio::time::sleep(poll).await;
        }
    }
}

/// `<base_url>/<job_id>` with the id as one percent-encoded path segment
fn job_url(base_url: &str, job_id: &str) -> Result<reqwest::Url, TransportError> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| TransportError::Http(format!("invalid command url: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::Http(format!("command url cannot take a path: {}", base_url)))?
        .pop_if_empty()
        .push(job_id);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_request_body() {
        let shell = CommandRequest::Shell {
            cmd: "uptime".into(),
            stdin: None,
        };
        assert_eq!(serde_json::to_string(&shell).unwrap(), r#"{"cmd":"uptime"}"#);

        let flag = CommandRequest::Flag {
            flag: "-status".into(),
            stdin: Some("y\n".into()),
        };
        assert_eq!(
            serde_json::to_string(&flag).unwrap(),
            r#"{"flag":"-status","stdin":"y\n"}"#
        );
    }

    #[test]
    fn test_job_id_is_one_path_segment() {
        let url = job_url("http://10.0.0.1:8080/api/run-command", "a/b c?d").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:8080/api/run-command/a%2Fb%20c%3Fd");

        let url = job_url("http://10.0.0.1/api/run-command/", "j1").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1/api/run-command/j1");
    }

    #[test]
    fn test_direct_reply() {
        let value: Value =
            serde_json::from_str(r#"{"output":"up 3 days","exitCode":0}"#).unwrap();
        let reply = CommandReply::from_value(&value, true);
        assert!(reply.ok);
        assert!(reply.is_finished());
        assert_eq!(reply.output, "up 3 days");
        assert_eq!(reply.exit_code, Some(0));
    }

    #[test]
    fn test_job_reply_states() {
        let running: Value =
            serde_json::from_str(r#"{"ok":true,"job_id":"j1","status":"running","output":"a"}"#)
                .unwrap();
        let reply = CommandReply::from_value(&running, true);
        assert_eq!(reply.job_id.as_deref(), Some("j1"));
        assert!(!reply.is_finished());

        let failed: Value =
            serde_json::from_str(r#"{"ok":false,"error":"busy"}"#).unwrap();
        let reply = CommandReply::from_value(&failed, true);
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("busy"));

        let http_error = CommandReply::from_value(&Value::Null, false);
        assert!(!http_error.ok);
    }
}
