//! Lite transport: discrete HTTP command runs
//!
//! Each terminated line becomes one request. Runs are serialized through a
//! single worker task so output from consecutive lines never interleaves.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::api::{CommandRequest, PanelApi};
use super::error::TransportError;
use super::{
    ConnectOptions, DisconnectOptions, EventSender, SendOptions, Transport, TransportEvent,
    TransportEventKind, TransportKind,
};
use crate::config::{LiteOutputConfig, ServerConfig};
use crate::session::{CloseReason, SessionMode};

static CONFIRM_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)для\s+подтвержден|нужно\s+подтверд|подтверд(?:ите|ить)",
        r"|введите\s+(?:yes|y)\b|нажмите\s+enter\b|type\s+(?:yes|y)\b",
        r"|are\s+you\s+sure|\bconfirm\b|\b(?:y/n|yes/no)\b",
        r"|\[y\s*/\s*n\]|\(y\s*/\s*n\)|press\s+enter\b",
    ))
    .expect("confirm prompt regex pattern is valid")
});

static ERROR_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ERROR|ERR|FATAL|FAIL|FAILED)\b")
        .expect("error word regex pattern is valid")
});

static WARN_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:WARN|WARNING)\b").expect("warn word regex pattern is valid")
});

const RED: &str = "\x1b[31;1m";
const YELLOW: &str = "\x1b[33;1m";
const RESET: &str = "\x1b[0m";

/// Output that asks the user to confirm something (`[y/N]`, "are you sure", ...)
pub fn detect_confirm_prompt(text: &str) -> bool {
    CONFIRM_PROMPT_RE.is_match(text)
}

/// Wrap error words in bold red and warning words in bold yellow
pub fn highlight_warn_err(text: &str) -> String {
    let red = ERROR_WORD_RE.replace_all(text, |caps: &regex::Captures| {
        format!("{}{}{}", RED, &caps[0], RESET)
    });
    WARN_WORD_RE
        .replace_all(&red, |caps: &regex::Captures| {
            format!("{}{}{}", YELLOW, &caps[0], RESET)
        })
        .into_owned()
}

/// Prompts usually expect a newline-terminated answer
fn normalize_stdin(raw: &str) -> String {
    if raw.is_empty() {
        "\n".to_string()
    } else if raw.ends_with('\n') || raw.contains('\r') {
        raw.to_string()
    } else {
        format!("{}\n", raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
}

/// Executes one discrete command, streaming output chunks as they arrive
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &CommandRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CommandOutcome, TransportError>;
}

/// Runs commands through the panel's run-command endpoint
pub struct HttpCommandExecutor {
    api: PanelApi,
}

impl HttpCommandExecutor {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            api: PanelApi::new(server),
        }
    }
}

#[async_trait]
impl CommandExecutor for HttpCommandExecutor {
    async fn execute(
        &self,
        request: &CommandRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<CommandOutcome, TransportError> {
        let reply = self.api.run_command(request, &mut *on_chunk).await?;
        if reply.status.as_deref() == Some("error") {
            return Err(TransportError::Server(
                reply.error.unwrap_or_else(|| "command failed".to_string()),
            ));
        }
        Ok(CommandOutcome {
            exit_code: reply.exit_code.unwrap_or(0),
        })
    }
}

struct LiteJob {
    generation: u64,
    request: CommandRequest,
}

struct LiteState {
    mode: SessionMode,
    generation: u64,
    /// Unterminated input
    buffered: String,
    /// Re-run target for stdin answers
    last_request: Option<CommandRequest>,
    worker: Option<mpsc::UnboundedSender<LiteJob>>,
}

pub struct LiteTransport {
    executor: Arc<dyn CommandExecutor>,
    output: LiteOutputConfig,
    events: EventSender,
    state: Mutex<LiteState>,
}

impl LiteTransport {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        output: LiteOutputConfig,
        events: EventSender,
    ) -> Self {
        Self {
            executor,
            output,
            events,
            state: Mutex::new(LiteState {
                mode: SessionMode::Shell,
                generation: 0,
                buffered: String::new(),
                last_request: None,
                worker: None,
            }),
        }
    }

    fn emit(&self, generation: u64, payload: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            kind: TransportKind::Lite,
            generation,
            payload,
        });
    }

    fn worker(&self, state: &mut LiteState) -> Option<mpsc::UnboundedSender<LiteJob>> {
        if let Some(tx) = state.worker.as_ref().filter(|tx| !tx.is_closed()) {
            return Some(tx.clone());
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Lite runner needs a tokio runtime: {}", e);
                return None;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_jobs(
            rx,
            self.executor.clone(),
            self.output.clone(),
            self.events.clone(),
        ));
        state.worker = Some(tx.clone());
        Some(tx)
    }

    fn build_request(state: &LiteState, line: &str, as_stdin: bool) -> CommandRequest {
        let text = line.trim().to_string();
        if as_stdin {
            let stdin = Some(normalize_stdin(line.trim_end_matches(['\r', '\n'])));
            return match state.last_request.clone() {
                Some(CommandRequest::Shell { cmd, .. }) => CommandRequest::Shell { cmd, stdin },
                Some(CommandRequest::Flag { flag, .. }) => CommandRequest::Flag { flag, stdin },
                None => CommandRequest::Shell { cmd: text, stdin },
            };
        }
        match state.mode {
            SessionMode::Command => CommandRequest::Flag {
                flag: text,
                stdin: None,
            },
            SessionMode::Shell | SessionMode::Interactive => CommandRequest::Shell {
                cmd: text,
                stdin: None,
            },
        }
    }

    /// Queue one complete line. Returns `false` for an empty line or when
    /// no worker can run it.
    fn run_line(&self, state: &mut LiteState, line: &str, as_stdin: bool) -> bool {
        let generation = state.generation;
        if line.trim().is_empty() && !as_stdin {
            self.emit(
                generation,
                TransportEventKind::Error {
                    message: TransportError::EmptyCommand.to_string(),
                    permanent: false,
                },
            );
            return false;
        }

        let request = Self::build_request(state, line, as_stdin);
        let Some(worker) = self.worker(state) else {
            self.emit(
                generation,
                TransportEventKind::Error {
                    message: "command runner is not available".to_string(),
                    permanent: true,
                },
            );
            return false;
        };

        state.last_request = Some(request.clone());
        if worker.send(LiteJob { generation, request }).is_err() {
            state.worker = None;
            return false;
        }
        true
    }
}

async fn run_jobs(
    mut rx: mpsc::UnboundedReceiver<LiteJob>,
    executor: Arc<dyn CommandExecutor>,
    output: LiteOutputConfig,
    events: EventSender,
) {
    while let Some(job) = rx.recv().await {
        let generation = job.generation;
        let emit = |payload: TransportEventKind| {
            let _ = events.send(TransportEvent {
                kind: TransportKind::Lite,
                generation,
                payload,
            });
        };

        emit(TransportEventKind::Output(format!(
            "\r\n$ {}\r\n",
            job.request.text()
        )));

        let mut on_chunk = |chunk: &str| {
            if chunk.is_empty() {
                return;
            }
            let mut out = if output.strip_ansi {
                strip_ansi_escapes::strip_str(chunk)
            } else {
                chunk.to_string()
            };
            if output.highlight_warn_err {
                out = highlight_warn_err(&out);
            }
            emit(TransportEventKind::Output(out));
        };

        match executor.execute(&job.request, &mut on_chunk).await {
            Ok(outcome) => {
                if outcome.exit_code != 0 {
                    emit(TransportEventKind::Output(format!(
                        "\r\n[Exit] code={}\r\n",
                        outcome.exit_code
                    )));
                }
                emit(TransportEventKind::CommandFinished {
                    exit_code: outcome.exit_code,
                });
            }
            Err(e) => {
                debug!("Lite command '{}' failed: {}", job.request.text(), e);
                emit(TransportEventKind::Error {
                    message: e.to_string(),
                    permanent: false,
                });
            }
        }
    }
    debug!("Lite runner stopped");
}

#[async_trait]
impl Transport for LiteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lite
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<(), TransportError> {
        self.state.lock().generation = opts.generation;
        Ok(())
    }

    async fn disconnect(&self, opts: DisconnectOptions) {
        let generation = {
            let mut state = self.state.lock();
            state.buffered.clear();
            state.generation
        };
        self.emit(
            generation,
            TransportEventKind::Closed(CloseReason::Requested(opts.reason)),
        );
    }

    fn send(&self, data: &str, opts: SendOptions) -> bool {
        let mut state = self.state.lock();

        if !data.contains(['\r', '\n']) {
            state.buffered.push_str(data);
            let text = state.buffered.clone();
            let generation = state.generation;
            drop(state);
            self.emit(generation, TransportEventKind::InputBuffered { text });
            return true;
        }

        let mut ok = true;
        let mut rest = data;
        while let Some(pos) = rest.find(['\r', '\n']) {
            let mut line = std::mem::take(&mut state.buffered);
            line.push_str(&rest[..pos]);
            let skip = if rest[pos..].starts_with("\r\n") { 2 } else { 1 };
            rest = &rest[pos + skip..];
            ok &= self.run_line(&mut state, &line, opts.as_stdin);
        }
        state.buffered.push_str(rest);
        ok
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn set_mode(&self, mode: SessionMode) {
        let mut state = self.state.lock();
        if state.mode != mode {
            state.mode = mode;
            state.last_request = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{event_channel, EventReceiver};
    use std::time::Duration;

    /// Replies from a script keyed by command text
    struct ScriptedExecutor {
        seen: Mutex<Vec<CommandRequest>>,
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            request: &CommandRequest,
            on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<CommandOutcome, TransportError> {
            self.seen.lock().push(request.clone());
            match request.text() {
                "false" => Ok(CommandOutcome { exit_code: 1 }),
                "boom" => Err(TransportError::Server("backend down".into())),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    on_chunk("slow done\n");
                    Ok(CommandOutcome { exit_code: 0 })
                }
                other => {
                    on_chunk(&format!("ran {}\n", other));
                    on_chunk("\x1b[32mERROR\x1b[0m here\n");
                    Ok(CommandOutcome { exit_code: 0 })
                }
            }
        }
    }

    fn lite(output: LiteOutputConfig) -> (LiteTransport, Arc<ScriptedExecutor>, EventReceiver) {
        let executor = Arc::new(ScriptedExecutor {
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = event_channel();
        (LiteTransport::new(executor.clone(), output, tx), executor, rx)
    }

    async fn collect_until_done(rx: &mut EventReceiver) -> Vec<TransportEventKind> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(
                event.payload,
                TransportEventKind::CommandFinished { .. } | TransportEventKind::Error { .. }
            );
            out.push(event.payload);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_confirm_prompt_detection() {
        assert!(detect_confirm_prompt("Continue? [Y/n]"));
        assert!(detect_confirm_prompt("Are you  sure you want to restart?"));
        assert!(detect_confirm_prompt("Для подтверждения введите yes"));
        assert!(detect_confirm_prompt("Press ENTER to continue"));
        assert!(detect_confirm_prompt("(y / n)"));
        assert!(!detect_confirm_prompt("configuration reloaded"));
        assert!(!detect_confirm_prompt("xray started"));
    }

    #[test]
    fn test_highlight_whole_words_only() {
        assert_eq!(
            highlight_warn_err("error: disk, warning: low"),
            "\x1b[31;1merror\x1b[0m: disk, \x1b[33;1mwarning\x1b[0m: low"
        );
        assert_eq!(highlight_warn_err("terrible warnings"), "terrible warnings");
        assert_eq!(
            highlight_warn_err("FAILED"),
            "\x1b[31;1mFAILED\x1b[0m"
        );
    }

    #[test]
    fn test_normalize_stdin() {
        assert_eq!(normalize_stdin(""), "\n");
        assert_eq!(normalize_stdin("y"), "y\n");
        assert_eq!(normalize_stdin("y\n"), "y\n");
    }

    #[tokio::test]
    async fn test_unterminated_input_is_buffered() {
        let (lite, executor, mut rx) = lite(LiteOutputConfig::default());
        assert!(lite.is_connected());
        assert!(lite.send("upt", SendOptions::default()));
        assert!(lite.send("ime", SendOptions::default()));

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.payload,
            TransportEventKind::InputBuffered { text: "upt".into() }
        );
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.payload,
            TransportEventKind::InputBuffered {
                text: "uptime".into()
            }
        );

        assert!(lite.send("\r", SendOptions::default()));
        let events = collect_until_done(&mut rx).await;
        assert_eq!(events[0], TransportEventKind::Output("\r\n$ uptime\r\n".into()));
        assert_eq!(events[1], TransportEventKind::Output("ran uptime\n".into()));
        assert_eq!(
            *events.last().unwrap(),
            TransportEventKind::CommandFinished { exit_code: 0 }
        );
        assert_eq!(
            executor.seen.lock()[0],
            CommandRequest::Shell {
                cmd: "uptime".into(),
                stdin: None
            }
        );
    }

    #[tokio::test]
    async fn test_empty_line_is_an_error() {
        let (lite, executor, mut rx) = lite(LiteOutputConfig::default());
        assert!(!lite.send("   \n", SendOptions::default()));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.payload, TransportEventKind::Error { .. }));
        assert!(executor.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let (lite, _executor, mut rx) = lite(LiteOutputConfig::default());
        lite.send("false\n", SendOptions::default());
        let events = collect_until_done(&mut rx).await;
        assert!(events.contains(&TransportEventKind::Output("\r\n[Exit] code=1\r\n".into())));
        assert_eq!(
            *events.last().unwrap(),
            TransportEventKind::CommandFinished { exit_code: 1 }
        );
    }

    #[tokio::test]
    async fn test_failure_surfaces_as_error_event() {
        let (lite, _executor, mut rx) = lite(LiteOutputConfig::default());
        lite.send("boom\n", SendOptions::default());
        let events = collect_until_done(&mut rx).await;
        match events.last().unwrap() {
            TransportEventKind::Error { message, permanent } => {
                assert!(message.contains("backend down"));
                assert!(!permanent);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lines_run_in_order() {
        let (lite, executor, mut rx) = lite(LiteOutputConfig::default());
        lite.send("slow\r\nfast\n", SendOptions::default());
        let first = collect_until_done(&mut rx).await;
        let second = collect_until_done(&mut rx).await;
        assert!(first.contains(&TransportEventKind::Output("slow done\n".into())));
        assert!(second.contains(&TransportEventKind::Output("ran fast\n".into())));
        let seen: Vec<String> = executor
            .seen
            .lock()
            .iter()
            .map(|r| r.text().to_string())
            .collect();
        assert_eq!(seen, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_command_mode_and_stdin_answer() {
        let (lite, executor, mut rx) = lite(LiteOutputConfig::default());
        lite.set_mode(SessionMode::Command);
        lite.send("-restart\n", SendOptions::default());
        collect_until_done(&mut rx).await;

        let answer = SendOptions {
            as_stdin: true,
            ..SendOptions::default()
        };
        lite.send("y\n", answer);
        collect_until_done(&mut rx).await;

        let seen = executor.seen.lock();
        assert_eq!(
            seen[0],
            CommandRequest::Flag {
                flag: "-restart".into(),
                stdin: None
            }
        );
        assert_eq!(
            seen[1],
            CommandRequest::Flag {
                flag: "-restart".into(),
                stdin: Some("y\n".into())
            }
        );
    }

    #[tokio::test]
    async fn test_output_filters() {
        let (lite, _executor, mut rx) = lite(LiteOutputConfig {
            strip_ansi: true,
            highlight_warn_err: true,
            detect_confirm_prompts: true,
        });
        lite.send("ls\n", SendOptions::default());
        let events = collect_until_done(&mut rx).await;
        assert!(events.contains(&TransportEventKind::Output(
            "\x1b[31;1mERROR\x1b[0m here\n".into()
        )));
    }
}
