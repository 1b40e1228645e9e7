//! Session actor
//!
//! Only one task owns the [`SessionController`]. Everything else talks to it
//! through a cloneable [`SessionHandle`], so lifecycle transitions, transport
//! events, widget input and retry timers are applied strictly one at a time.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep_until;
use tracing::{debug, info};

use super::controller::{ScheduledRetry, SessionController};
use super::reconnect::RetryProgress;
use super::types::{ConnectionState, SessionMode};
use crate::config::{LocalStore, TerminalConfig, TerminalPrefs};
use crate::events::{EventBus, TerminalEvent};
use crate::surface::{
    HostSurface, SurfaceInput, SurfaceInputReceiver, SurfaceManager, WidgetFactory,
};
use crate::transport::{
    event_channel, EventReceiver, HttpCommandExecutor, LiteTransport, PtyTransport, TransportSet,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session actor has stopped")]
    Stopped,
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub mode: SessionMode,
    pub state: ConnectionState,
    pub epoch: u64,
    pub retry: RetryProgress,
    pub history_len: usize,
    pub pending_line: String,
}

/// Commands sent to the session actor
pub enum SessionCommand {
    Open {
        mode: SessionMode,
        initial_command: Option<String>,
        reply_tx: oneshot::Sender<()>,
    },
    SwitchMode {
        mode: SessionMode,
        reply_tx: oneshot::Sender<()>,
    },
    Close {
        reply_tx: oneshot::Sender<()>,
    },
    Detach {
        reply_tx: oneshot::Sender<()>,
    },
    Kill {
        reply_tx: oneshot::Sender<()>,
    },
    NewSession {
        reply_tx: oneshot::Sender<()>,
    },
    Reconnect {
        reply_tx: oneshot::Sender<()>,
    },
    RetryNow {
        reply_tx: oneshot::Sender<()>,
    },
    StopRetry,
    SubmitLine {
        text: String,
        reply_tx: oneshot::Sender<bool>,
    },
    AnswerPrompt {
        text: String,
        reply_tx: oneshot::Sender<bool>,
    },
    /// Raw input, as if typed into the widget
    Input {
        data: String,
        reply_tx: oneshot::Sender<bool>,
    },
    Signal {
        name: String,
        reply_tx: oneshot::Sender<bool>,
    },
    CtrlC {
        reply_tx: oneshot::Sender<bool>,
    },
    CtrlD {
        reply_tx: oneshot::Sender<bool>,
    },
    AttachHost(HostSurface),
    ApplyPreferences(TerminalPrefs),
    SetTypographyScale(f64),
    HistoryItems {
        reply_tx: oneshot::Sender<Vec<String>>,
    },
    ClearHistory,
    Snapshot {
        reply_tx: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Cloneable handle to a running session actor
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    bus: EventBus,
}

impl SessionHandle {
    /// Everything the session reports: output visibility, state, retry
    /// progress, notices
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.cmd_tx.send(cmd).await.map_err(|_| SessionError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(build(reply_tx)).await?;
        reply_rx.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn open(
        &self,
        mode: SessionMode,
        initial_command: Option<String>,
    ) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::Open {
            mode,
            initial_command,
            reply_tx,
        })
        .await
    }

    pub async fn switch_mode(&self, mode: SessionMode) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::SwitchMode { mode, reply_tx })
            .await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::Close { reply_tx })
            .await
    }

    pub async fn detach(&self) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::Detach { reply_tx })
            .await
    }

    pub async fn kill(&self) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::Kill { reply_tx })
            .await
    }

    pub async fn new_session(&self) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::NewSession { reply_tx })
            .await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::Reconnect { reply_tx })
            .await
    }

    pub async fn retry_now(&self) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::RetryNow { reply_tx })
            .await
    }

    pub async fn stop_retry(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StopRetry).await
    }

    pub async fn submit_line(&self, text: impl Into<String>) -> Result<bool, SessionError> {
        let text = text.into();
        self.request(|reply_tx| SessionCommand::SubmitLine { text, reply_tx })
            .await
    }

    pub async fn answer_prompt(&self, text: impl Into<String>) -> Result<bool, SessionError> {
        let text = text.into();
        self.request(|reply_tx| SessionCommand::AnswerPrompt { text, reply_tx })
            .await
    }

    pub async fn input(&self, data: impl Into<String>) -> Result<bool, SessionError> {
        let data = data.into();
        self.request(|reply_tx| SessionCommand::Input { data, reply_tx })
            .await
    }

    pub async fn send_signal(&self, name: impl Into<String>) -> Result<bool, SessionError> {
        let name = name.into();
        self.request(|reply_tx| SessionCommand::Signal { name, reply_tx })
            .await
    }

    pub async fn send_ctrl_c(&self) -> Result<bool, SessionError> {
        self.request(|reply_tx| SessionCommand::CtrlC { reply_tx })
            .await
    }

    pub async fn send_ctrl_d(&self) -> Result<bool, SessionError> {
        self.request(|reply_tx| SessionCommand::CtrlD { reply_tx })
            .await
    }

    pub async fn attach_host(&self, host: HostSurface) -> Result<(), SessionError> {
        self.send(SessionCommand::AttachHost(host)).await
    }

    pub async fn apply_preferences(&self, prefs: TerminalPrefs) -> Result<(), SessionError> {
        self.send(SessionCommand::ApplyPreferences(prefs)).await
    }

    pub async fn set_typography_scale(&self, scale: f64) -> Result<(), SessionError> {
        self.send(SessionCommand::SetTypographyScale(scale)).await
    }

    pub async fn history(&self) -> Result<Vec<String>, SessionError> {
        self.request(|reply_tx| SessionCommand::HistoryItems { reply_tx })
            .await
    }

    pub async fn clear_history(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ClearHistory).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply_tx| SessionCommand::Snapshot { reply_tx })
            .await
    }

    /// Stop the actor. The interactive channel is left as is; call
    /// [`close`](Self::close) or [`detach`](Self::detach) first.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }
}

/// Build a session wired to the real transports and spawn its actor
pub fn start_session(
    config: TerminalConfig,
    store: Arc<LocalStore>,
    factory: Option<Arc<dyn WidgetFactory>>,
) -> SessionHandle {
    let (events_tx, events_rx) = event_channel();
    let bus = EventBus::new();

    let pty = Arc::new(PtyTransport::new(&config, store.clone(), events_tx.clone()));
    let executor = Arc::new(HttpCommandExecutor::new(config.server.clone()));
    let lite = Arc::new(LiteTransport::new(executor, config.lite.clone(), events_tx));

    let surface = SurfaceManager::new(factory, bus.clone());
    let controller =
        SessionController::new(config, TransportSet::new(pty, lite), surface, store, bus);

    spawn_session(controller, events_rx)
}

/// Spawn the actor that owns `controller`. `events_rx` must be the receiving
/// end of the channel its transports emit on.
pub fn spawn_session(controller: SessionController, events_rx: EventReceiver) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(64);
    let bus = controller.bus().clone();
    // Taken before spawning so no widget input is missed
    let input_rx = controller.surface().input_channel();

    tokio::spawn(run_session(controller, cmd_rx, events_rx, input_rx));

    SessionHandle { cmd_tx, bus }
}

async fn wait_retry(pending: Option<ScheduledRetry>) -> ScheduledRetry {
    match pending {
        Some(scheduled) => {
            sleep_until(scheduled.ticket.due).await;
            scheduled
        }
        None => std::future::pending().await,
    }
}

async fn run_session(
    mut controller: SessionController,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut events_rx: EventReceiver,
    mut input_rx: SurfaceInputReceiver,
) {
    info!("Session actor started");

    loop {
        let pending = controller.pending_retry();

        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("All session handles dropped");
                    break;
                };
                if !handle_command(&mut controller, cmd).await {
                    break;
                }
            }

            Some(event) = events_rx.recv() => {
                controller.handle_transport_event(event).await;
            }

            scheduled = wait_retry(pending) => {
                controller.on_retry_fire(scheduled).await;
            }

            Some(input) = input_rx.recv() => match input {
                SurfaceInput::Data(data) => {
                    controller.on_surface_data(&data);
                }
                SurfaceInput::Resize { cols, rows } => {
                    controller.on_surface_resize(cols, rows);
                }
            },
        }
    }

    info!("Session actor stopped");
}

/// Returns `false` when the actor should stop
async fn handle_command(controller: &mut SessionController, cmd: SessionCommand) -> bool {
    match cmd {
        SessionCommand::Open {
            mode,
            initial_command,
            reply_tx,
        } => {
            controller.open(mode, initial_command).await;
            let _ = reply_tx.send(());
        }
        SessionCommand::SwitchMode { mode, reply_tx } => {
            controller.switch_mode(mode).await;
            let _ = reply_tx.send(());
        }
        SessionCommand::Close { reply_tx } => {
            controller.close().await;
            let _ = reply_tx.send(());
        }
        SessionCommand::Detach { reply_tx } => {
            controller.detach().await;
            let _ = reply_tx.send(());
        }
        SessionCommand::Kill { reply_tx } => {
            controller.kill().await;
            let _ = reply_tx.send(());
        }
        SessionCommand::NewSession { reply_tx } => {
            controller.new_session().await;
            let _ = reply_tx.send(());
        }
        SessionCommand::Reconnect { reply_tx } => {
            controller.reconnect().await;
            let _ = reply_tx.send(());
        }
        SessionCommand::RetryNow { reply_tx } => {
            controller.retry_now().await;
            let _ = reply_tx.send(());
        }
        SessionCommand::StopRetry => controller.stop_retry(),
        SessionCommand::SubmitLine { text, reply_tx } => {
            let _ = reply_tx.send(controller.submit_line(&text));
        }
        SessionCommand::AnswerPrompt { text, reply_tx } => {
            let _ = reply_tx.send(controller.answer_prompt(&text));
        }
        SessionCommand::Input { data, reply_tx } => {
            let _ = reply_tx.send(controller.on_surface_data(&data));
        }
        SessionCommand::Signal { name, reply_tx } => {
            let _ = reply_tx.send(controller.send_signal(&name));
        }
        SessionCommand::CtrlC { reply_tx } => {
            let _ = reply_tx.send(controller.send_ctrl_c());
        }
        SessionCommand::CtrlD { reply_tx } => {
            let _ = reply_tx.send(controller.send_ctrl_d());
        }
        SessionCommand::AttachHost(host) => controller.set_host(host),
        SessionCommand::ApplyPreferences(prefs) => controller.apply_preferences(prefs),
        SessionCommand::SetTypographyScale(scale) => {
            controller.surface().set_typography_scale(scale)
        }
        SessionCommand::HistoryItems { reply_tx } => {
            let _ = reply_tx.send(controller.history().items().to_vec());
        }
        SessionCommand::ClearHistory => controller.clear_history(),
        SessionCommand::Snapshot { reply_tx } => {
            let snapshot = SessionSnapshot {
                mode: controller.mode(),
                state: controller.connection_state(),
                epoch: controller.epoch(),
                retry: controller.retry_progress(),
                history_len: controller.history().len(),
                pending_line: controller.reconstructor().pending_line(),
            };
            let _ = reply_tx.send(snapshot);
        }
        SessionCommand::Shutdown => return false,
    }
    true
}
