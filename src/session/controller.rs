//! Session/mode controller
//!
//! Drives one terminal session across the `shell`, `command` and
//! `interactive` modes. The controller is the only place lifecycle
//! transitions happen; transports, the surface and the retry machine only
//! report back through events.
//!
//! # Staleness guards
//!
//! - **epoch**: bumped by every lifecycle teardown (`close`, `detach`,
//!   `kill`, `new_session`). A retry ticket scheduled under an older epoch
//!   is ignored when it fires.
//! - **generation**: bumped by every interactive connect. Events from a
//!   superseded connection are dropped.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::reconnect::{ReconnectMachine, RetryProgress, RetryTicket};
use super::types::{CloseReason, ConnectionState, DisconnectReason, SessionMode};
use crate::config::{LocalStore, TerminalConfig, TerminalPrefs};
use crate::events::{EventBus, NoticeLevel, TerminalEvent};
use crate::history::{HistoryDirection, HistoryStore, LineReconstructor};
use crate::surface::{HostSurface, SurfaceManager};
use crate::transport::{
    detect_confirm_prompt, ConnectOptions, DisconnectOptions, SendOptions, TransportError,
    TransportEvent, TransportEventKind, TransportKind, TransportSet,
};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Text shown when interactive mode is requested without a widget library
pub const NO_WIDGET_NOTICE: &str =
    "Interactive terminal is unavailable: no terminal widget. Use shell mode instead.";

/// A retry ticket together with the epoch it was scheduled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub epoch: u64,
    pub ticket: RetryTicket,
}

pub struct SessionController {
    config: TerminalConfig,
    mode: SessionMode,
    state: ConnectionState,
    epoch: u64,
    generation: u64,
    retry_epoch: u64,
    transports: TransportSet,
    retry: ReconnectMachine,
    surface: SurfaceManager,
    host: Option<HostSurface>,
    prefs: TerminalPrefs,
    store: Arc<LocalStore>,
    reconstructor: LineReconstructor,
    history: HistoryStore,
    bus: EventBus,
}

impl SessionController {
    pub fn new(
        config: TerminalConfig,
        transports: TransportSet,
        surface: SurfaceManager,
        store: Arc<LocalStore>,
        bus: EventBus,
    ) -> Self {
        let retry = ReconnectMachine::new(config.reconnect.clone());
        let history = HistoryStore::load(store.clone());
        let prefs = TerminalPrefs::load(&store);

        Self {
            config,
            mode: SessionMode::default(),
            state: ConnectionState::Disconnected,
            epoch: 0,
            generation: 0,
            retry_epoch: 0,
            transports,
            retry,
            surface,
            host: None,
            prefs,
            store,
            reconstructor: LineReconstructor::new(),
            history,
            bus,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn surface(&self) -> &SurfaceManager {
        &self.surface
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn reconstructor(&self) -> &LineReconstructor {
        &self.reconstructor
    }

    pub fn prefs(&self) -> TerminalPrefs {
        self.prefs
    }

    pub fn retry_progress(&self) -> RetryProgress {
        self.retry.progress(Instant::now())
    }

    /// The retry the owner should sleep on, if any
    pub fn pending_retry(&self) -> Option<ScheduledRetry> {
        self.retry.pending().map(|ticket| ScheduledRetry {
            epoch: self.retry_epoch,
            ticket,
        })
    }

    /// Region the widget mounts into when interactive mode starts
    pub fn set_host(&mut self, host: HostSurface) {
        if self.surface.has_widget() {
            self.surface.attach(host.clone());
        }
        self.host = Some(host);
    }

    pub fn apply_preferences(&mut self, prefs: TerminalPrefs) {
        self.prefs = prefs;
        if let Err(e) = prefs.save(&self.store) {
            warn!("Failed to save terminal preferences: {}", e);
        }
        self.surface.apply_preferences(prefs);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Enter `mode`. In interactive mode `initial_command` is typed into the
    /// shell once the channel opens; otherwise it runs as a discrete line.
    pub async fn open(&mut self, mode: SessionMode, initial_command: Option<String>) {
        info!("Opening terminal session in {} mode", mode);

        if mode == self.mode && mode.is_interactive() {
            if self.state != ConnectionState::Connected && self.state != ConnectionState::Connecting
            {
                self.retry.unblock();
                self.retry.begin_connect();
                self.connect_interactive(true).await;
            }
        } else {
            self.switch_mode(mode).await;
        }

        let Some(command) = initial_command.filter(|c| !c.trim().is_empty()) else {
            return;
        };
        if self.mode.is_interactive() {
            let line = format!("{}\r", command.trim_end_matches(['\r', '\n']));
            if !self.transports.interactive().send(&line, SendOptions::queued()) {
                warn!("Initial command could not be queued");
            }
        } else {
            self.submit_line(&command);
        }
    }

    /// Mode transition with its side effects
    pub async fn switch_mode(&mut self, mode: SessionMode) {
        let previous = self.mode;
        if previous == mode {
            return;
        }

        if previous.is_interactive() {
            self.retry.pause();
            self.transports
                .interactive()
                .disconnect(DisconnectOptions::graceful(DisconnectReason::ModeChange))
                .await;
            self.reconstructor.reset();
        }

        self.mode = mode;
        self.transports.lite().set_mode(mode);
        debug!("Terminal mode {} -> {}", previous, mode);
        self.bus.publish(TerminalEvent::ModeChanged(mode));

        if mode.is_interactive() {
            self.enter_interactive().await;
        } else {
            self.enter_discrete();
        }
    }

    async fn enter_interactive(&mut self) {
        self.bus.publish(TerminalEvent::LineInput { enabled: false });
        self.reconstructor.reset();

        if !self.ensure_surface() {
            self.surface.writeln(NO_WIDGET_NOTICE);
            self.bus.notice(NoticeLevel::Error, NO_WIDGET_NOTICE);
            self.retry.stop();
            self.set_state(ConnectionState::Error);
            return;
        }
        self.surface.set_convert_eol(false);

        self.retry.unblock();
        self.retry.begin_connect();
        self.connect_interactive(false).await;
    }

    fn enter_discrete(&mut self) {
        self.bus.publish(TerminalEvent::LineInput { enabled: true });
        if self.surface.has_widget() {
            self.surface.set_convert_eol(true);
        }
        // Discrete runs need no channel
        self.set_state(ConnectionState::Connected);
    }

    /// Graceful teardown: the remote process is terminated and the widget
    /// destroyed
    pub async fn close(&mut self) {
        info!("Closing terminal session");
        self.retry.stop();
        self.bump_epoch();
        self.transports
            .interactive()
            .disconnect(DisconnectOptions::graceful(DisconnectReason::Close))
            .await;
        if self.surface.has_widget() {
            self.surface.dispose();
        }
        self.reconstructor.reset();
        self.reset_mode();
    }

    /// Local teardown; the remote process keeps running and can be
    /// reattached later
    pub async fn detach(&mut self) {
        info!("Detaching terminal session");
        self.retry.stop();
        self.bump_epoch();
        self.transports
            .interactive()
            .disconnect(DisconnectOptions::silent(DisconnectReason::Detach))
            .await;
        self.surface.detach_host();
        self.reconstructor.reset();
        self.reset_mode();
    }

    /// Terminate the remote process and forget the reattachment key,
    /// whatever the current mode
    pub async fn kill(&mut self) {
        info!("Killing terminal session");
        self.retry.stop();
        self.bump_epoch();
        self.transports
            .interactive()
            .disconnect(DisconnectOptions::kill(DisconnectReason::Kill))
            .await;
        self.reconstructor.reset();
        if self.mode.is_interactive() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Discard the reattachment key, then open a fresh interactive session
    pub async fn new_session(&mut self) {
        info!("Starting a new terminal session");
        self.retry.stop();
        self.bump_epoch();
        self.transports
            .interactive()
            .disconnect(DisconnectOptions::kill(DisconnectReason::NewSession))
            .await;
        self.reconstructor.reset();

        if self.mode.is_interactive() {
            self.surface.clear();
            self.retry.unblock();
            self.retry.begin_connect();
            self.connect_interactive(false).await;
        } else {
            self.switch_mode(SessionMode::Interactive).await;
        }
    }

    /// Manual reconnect. Outside interactive mode this opens one.
    pub async fn reconnect(&mut self) {
        if !self.mode.is_interactive() {
            self.open(SessionMode::Interactive, None).await;
            return;
        }
        self.retry_now().await;
    }

    /// Skip the backoff wait; the attempt count is kept
    pub async fn retry_now(&mut self) {
        if !self.mode.is_interactive() {
            return;
        }
        if !self.surface.has_widget() && !self.ensure_surface() {
            self.set_state(ConnectionState::Error);
            return;
        }
        self.retry.retry_now();
        self.publish_retry();
        self.connect_interactive(true).await;
    }

    /// Manual "stop retry": stay disconnected until told otherwise
    pub fn stop_retry(&mut self) {
        self.retry.stop();
        self.publish_retry();
        if self.mode.is_interactive() && self.state != ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// A retry timer fired
    pub async fn on_retry_fire(&mut self, scheduled: ScheduledRetry) {
        if scheduled.epoch != self.epoch || !self.mode.is_interactive() {
            debug!("Ignoring retry from a finished session");
            return;
        }
        if !self.retry.accept(scheduled.ticket) {
            return;
        }
        info!("Reconnect attempt {}", scheduled.ticket.attempt);
        self.publish_retry();
        self.connect_interactive(true).await;
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    /// Single consumer of the surface `data` event: the same payload feeds
    /// history capture and goes out on the interactive channel.
    pub fn on_surface_data(&mut self, data: &str) -> bool {
        if !self.mode.is_interactive() {
            return false;
        }

        for line in self.reconstructor.consume(data) {
            self.record_history(&line);
        }

        let sent = self
            .transports
            .interactive()
            .send(data, SendOptions::default());
        if !sent {
            debug!("Input dropped: interactive channel is not connected");
        }
        sent
    }

    pub fn on_surface_resize(&mut self, cols: u16, rows: u16) {
        if self.mode.is_interactive() {
            self.transports.interactive().resize(cols, rows);
        }
    }

    /// Run one line from the line-input field (discrete modes)
    pub fn submit_line(&mut self, text: &str) -> bool {
        let line = text.trim();
        if !line.is_empty() {
            self.record_history(line);
        }
        self.prepare_discrete_output();
        self.transports
            .route(self.mode, Some(TransportKind::Lite))
            .send(&format!("{}\n", line), SendOptions::default())
    }

    /// Answer a confirmation prompt of the previous discrete command
    pub fn answer_prompt(&mut self, text: &str) -> bool {
        self.prepare_discrete_output();
        let opts = SendOptions {
            as_stdin: true,
            ..SendOptions::prefer(TransportKind::Lite)
        };
        self.transports
            .route(self.mode, opts.prefer)
            .send(&format!("{}\n", text), opts)
    }

    /// Deliver a named signal to the remote process
    pub fn send_signal(&self, name: &str) -> bool {
        self.mode.is_interactive() && self.transports.interactive().send_signal(name)
    }

    pub fn send_ctrl_c(&mut self) -> bool {
        self.send_control("\x03")
    }

    pub fn send_ctrl_d(&mut self) -> bool {
        self.send_control("\x04")
    }

    fn send_control(&mut self, byte: &str) -> bool {
        if !self.mode.is_interactive() {
            return false;
        }
        self.reconstructor.consume(byte);
        self.transports
            .interactive()
            .send(byte, SendOptions::default())
    }

    /// Browse history for the line-input field
    pub fn history_navigate(&mut self, direction: HistoryDirection) -> Option<String> {
        self.history.navigate(direction)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.bus.publish(TerminalEvent::HistoryChanged { len: 0 });
    }

    fn record_history(&mut self, line: &str) {
        if self.history.push(line) {
            self.bus.publish(TerminalEvent::HistoryChanged {
                len: self.history.len(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event.kind {
            TransportKind::Interactive => {
                if event.generation != self.generation {
                    debug!(
                        "Dropping event from stale connection {} (current {})",
                        event.generation, self.generation
                    );
                    return;
                }
                self.handle_interactive(event.payload);
            }
            TransportKind::Lite => self.handle_lite(event.payload),
        }
    }

    fn handle_interactive(&mut self, payload: TransportEventKind) {
        match payload {
            // Set when the connect started
            TransportEventKind::Connecting => {}
            TransportEventKind::Connected { session_key } => {
                debug!("Interactive channel connected: {:?}", session_key);
                self.retry.on_connected();
                self.set_state(ConnectionState::Connected);
                self.publish_retry();
            }
            TransportEventKind::Output(data) => {
                self.reconstructor.mark_sensitive_from_output(&data);
                self.surface.write(&data);
            }
            TransportEventKind::Replay(lines) => {
                for line in &lines {
                    self.reconstructor.mark_sensitive_from_output(line);
                    self.surface.writeln(line);
                }
            }
            TransportEventKind::SessionInfo {
                session_id,
                shell,
                reused,
            } => {
                if reused {
                    self.bus
                        .notice(NoticeLevel::Info, "Reattached to the running session");
                }
                self.bus.publish(TerminalEvent::SessionInfo {
                    session_id,
                    shell,
                    reused,
                });
            }
            TransportEventKind::Closed(reason) => self.on_channel_closed(reason),
            TransportEventKind::Error { message, permanent } => {
                warn!("Interactive transport error: {}", message);
                self.bus.notice(NoticeLevel::Error, message);
                if permanent {
                    self.retry.stop();
                    self.set_state(ConnectionState::Error);
                }
            }
            TransportEventKind::Exited { code } => {
                self.retry.stop();
                let text = match code {
                    Some(code) => format!("[Process exited with code {}]", code),
                    None => "[Process exited]".to_string(),
                };
                self.surface.write("\r\n");
                self.surface.writeln(&text);
                self.bus.publish(TerminalEvent::Exited { code });
            }
            TransportEventKind::InputBuffered { .. }
            | TransportEventKind::CommandFinished { .. } => {}
        }
    }

    fn on_channel_closed(&mut self, reason: CloseReason) {
        match reason {
            CloseReason::Requested(why) => {
                debug!("Interactive channel closed ({})", why);
            }
            CloseReason::Exited(code) => {
                info!("Remote process exited ({:?}), not reconnecting", code);
                self.retry.stop();
                self.set_state(ConnectionState::Disconnected);
                self.publish_retry();
            }
            reason if reason.schedules_retry() => {
                if !self.mode.is_interactive() {
                    return;
                }
                warn!("Interactive channel lost: {:?}", reason);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_retry();
            }
            _ => {}
        }
    }

    fn handle_lite(&mut self, payload: TransportEventKind) {
        match payload {
            TransportEventKind::Output(data) => {
                self.write_discrete(&data);
                if self.config.lite.detect_confirm_prompts
                    && !self.mode.is_interactive()
                    && detect_confirm_prompt(&data)
                {
                    self.bus
                        .publish(TerminalEvent::ConfirmPrompt { text: data });
                }
            }
            TransportEventKind::Error { message, .. } => {
                self.write_discrete(&format!("\r\n[Error] {}\r\n", message));
                self.bus.notice(NoticeLevel::Error, message);
            }
            TransportEventKind::CommandFinished { exit_code } => {
                self.bus.publish(TerminalEvent::CommandFinished { exit_code });
            }
            TransportEventKind::InputBuffered { text } => {
                debug!("Lite input buffered ({} chars)", text.chars().count());
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn connect_interactive(&mut self, preserve_screen: bool) {
        self.generation += 1;
        let generation = self.generation;
        let epoch = self.epoch;
        let (cols, rows) = self.surface.size().unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));

        self.set_state(ConnectionState::Connecting);
        let result = self
            .transports
            .interactive()
            .connect(ConnectOptions {
                cols,
                rows,
                generation,
                preserve_screen,
            })
            .await;

        if epoch != self.epoch || generation != self.generation {
            return;
        }
        if let Err(e) = result {
            self.on_connect_failed(e);
        }
    }

    fn on_connect_failed(&mut self, error: TransportError) {
        warn!("Interactive connect failed: {}", error);

        if error.is_permanent() {
            self.retry.stop();
            let message = format!("{}. Interactive mode is unavailable.", error);
            self.surface.writeln(&message);
            self.bus.notice(NoticeLevel::Error, message);
            self.set_state(ConnectionState::Error);
            self.publish_retry();
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        self.bus
            .notice(NoticeLevel::Warning, format!("Connection failed: {}", error));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.retry.on_unexpected_disconnect(Instant::now()).is_some() {
            self.retry_epoch = self.epoch;
        } else if self.retry.progress(Instant::now()).exhausted {
            self.set_state(ConnectionState::Error);
            self.bus
                .notice(NoticeLevel::Error, "Reconnection attempts exhausted");
        }
        self.publish_retry();
    }

    /// Interactive mode needs a widget. Returns `false` when none can exist.
    fn ensure_surface(&mut self) -> bool {
        let Some(ensured) = self.surface.ensure(self.prefs) else {
            return false;
        };
        if ensured.created || !self.surface.is_mounted() {
            if let Some(host) = self.host.clone() {
                self.surface.attach(host);
            }
        }
        true
    }

    /// A closed session leaves a disposed surface behind; discrete output
    /// gets a fresh widget when one can be built
    fn prepare_discrete_output(&mut self) {
        if self.surface.is_disposed() && self.ensure_surface() {
            self.surface.set_convert_eol(true);
        }
    }

    fn write_discrete(&mut self, data: &str) {
        self.prepare_discrete_output();
        self.surface.write(data);
    }

    fn reset_mode(&mut self) {
        if self.mode != SessionMode::default() {
            self.mode = SessionMode::default();
            self.transports.lite().set_mode(self.mode);
            self.bus.publish(TerminalEvent::ModeChanged(self.mode));
        }
        self.bus.publish(TerminalEvent::LineInput { enabled: true });
        self.set_state(ConnectionState::Disconnected);
        self.publish_retry();
    }

    fn bump_epoch(&mut self) {
        self.epoch += 1;
        self.generation += 1;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.bus.publish(TerminalEvent::ConnectionState(state));
        }
    }

    fn publish_retry(&self) {
        self.bus.publish(TerminalEvent::Retry(self.retry_progress()));
    }
}
