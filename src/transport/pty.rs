//! Interactive PTY transport over WebSocket
//!
//! # Connection layout
//!
//! A live connection is three tasks sharing one socket:
//! - **writer**: owns the sink, serializes raw input (binary) and control
//!   frames (JSON text) in the order they were queued
//! - **reader**: owns the stream, turns server frames into
//!   [`TransportEvent`]s, tracks the resume sequence
//! - **keepalive**: queues a `ping` every `keepalive_secs`
//!
//! Local teardown marks the connection as manually closed first, so the
//! reader never reports a close the controller asked for as unexpected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::api::PanelApi;
use super::error::TransportError;
use super::protocol::{parse_server_frame, ClientFrame, ServerFrame};
use super::{
    ConnectOptions, DisconnectOptions, EventSender, SendOptions, SessionKey, Transport,
    TransportEvent, TransportEventKind, TransportKind,
};
use crate::config::{LocalStore, TerminalConfig};
use crate::session::{CloseReason, DisconnectReason};

/// Storage key prefix for the reattachable server session id
pub const SESSION_ID_KEY_PREFIX: &str = "pty_session_id_v1__";
/// Storage key prefix for the last output sequence seen
pub const LAST_SEQ_KEY_PREFIX: &str = "pty_last_seq_v1__";

enum Outbound {
    Input(Vec<u8>),
    Control(ClientFrame),
    Shutdown { send_close: bool },
}

struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    manual_close: Arc<AtomicBool>,
    keepalive: JoinHandle<()>,
}

impl Connection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn push(&self, msg: Outbound) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// Tear down locally; the reader stays quiet about it
    fn shutdown(self, send_close: bool) {
        self.manual_close.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        self.keepalive.abort();
        let _ = self.outbound.send(Outbound::Shutdown { send_close });
    }
}

struct PtyState {
    conn: Option<Connection>,
    generation: u64,
    /// Input accepted while disconnected, flushed in order on connect
    pending: VecDeque<String>,
    last_resize: Option<(u16, u16)>,
    size: (u16, u16),
}

/// Resume position shared with the reader task
struct SessionKeys {
    store: Arc<LocalStore>,
    session_id_key: String,
    last_seq_key: String,
    current: Mutex<SessionKey>,
}

impl SessionKeys {
    fn load(store: Arc<LocalStore>, tab_id: &str) -> Self {
        let session_id_key = format!("{}{}", SESSION_ID_KEY_PREFIX, tab_id);
        let last_seq_key = format!("{}{}", LAST_SEQ_KEY_PREFIX, tab_id);
        let current = SessionKey {
            session_id: store.get(&session_id_key).filter(|s| !s.is_empty()),
            last_seq: store
                .get(&last_seq_key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
        };
        Self {
            store,
            session_id_key,
            last_seq_key,
            current: Mutex::new(current),
        }
    }

    fn snapshot(&self) -> SessionKey {
        self.current.lock().clone()
    }

    fn set_session_id(&self, session_id: &str) {
        self.current.lock().session_id = Some(session_id.to_string());
        if let Err(e) = self.store.set(&self.session_id_key, session_id) {
            warn!("Failed to persist PTY session id: {}", e);
        }
    }

    /// Accept a sequenced chunk. Returns `false` for a replayed duplicate.
    fn advance(&self, seq: u64) -> bool {
        let mut current = self.current.lock();
        if seq <= current.last_seq {
            return false;
        }
        current.last_seq = seq;
        drop(current);
        if let Err(e) = self.store.set(&self.last_seq_key, seq.to_string()) {
            warn!("Failed to persist PTY output sequence: {}", e);
        }
        true
    }

    fn reset_seq(&self) {
        self.current.lock().last_seq = 0;
        if let Err(e) = self.store.remove(&self.last_seq_key) {
            warn!("Failed to reset PTY output sequence: {}", e);
        }
    }

    fn clear(&self) {
        *self.current.lock() = SessionKey::default();
        for key in [&self.session_id_key, &self.last_seq_key] {
            if let Err(e) = self.store.remove(key) {
                warn!("Failed to clear PTY session key {}: {}", key, e);
            }
        }
    }
}

pub struct PtyTransport {
    api: PanelApi,
    ws_path: String,
    keepalive: Duration,
    connect_timeout: Duration,
    keys: Arc<SessionKeys>,
    /// Capability probe answer, kept once the panel has given one
    ws_supported: Mutex<Option<bool>>,
    events: EventSender,
    state: Arc<Mutex<PtyState>>,
}

impl PtyTransport {
    pub fn new(config: &TerminalConfig, store: Arc<LocalStore>, events: EventSender) -> Self {
        Self {
            api: PanelApi::new(config.server.clone()),
            ws_path: config.server.ws_path.clone(),
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            keys: Arc::new(SessionKeys::load(store, &config.tab_id)),
            ws_supported: Mutex::new(None),
            events,
            state: Arc::new(Mutex::new(PtyState {
                conn: None,
                generation: 0,
                pending: VecDeque::new(),
                last_resize: None,
                size: (80, 24),
            })),
        }
    }

    fn emit(&self, generation: u64, payload: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            kind: TransportKind::Interactive,
            generation,
            payload,
        });
    }

    /// Probe the panel until it answers, then reuse the answer
    async fn resolve_capability(&self) -> Result<bool, TransportError> {
        if let Some(known) = *self.ws_supported.lock() {
            return Ok(known);
        }
        let supported = self.api.websocket_supported().await?;
        info!("Panel WebSocket support: {}", supported);
        *self.ws_supported.lock() = Some(supported);
        Ok(supported)
    }

    fn build_url(&self, token: Option<&str>, cols: u16, rows: u16) -> Result<String, TransportError> {
        let origin = self.api.server().ws_origin();
        let mut url = reqwest::Url::parse(&format!("{}{}", origin, self.ws_path))
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid ws url: {}", e)))?;

        let key = self.keys.snapshot();
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = token {
                query.append_pair("token", token);
            }
            query.append_pair("cols", &cols.to_string());
            query.append_pair("rows", &rows.to_string());
            if let Some(session_id) = key.session_id.as_deref() {
                query.append_pair("session_id", session_id);
            }
            if key.last_seq > 0 {
                query.append_pair("last_seq", &key.last_seq.to_string());
            }
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl Transport for PtyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Interactive
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<(), TransportError> {
        // Only one channel per transport
        let old = {
            let mut state = self.state.lock();
            state.generation = opts.generation;
            state.size = (opts.cols, opts.rows);
            state.conn.take()
        };
        if let Some(old) = old {
            debug!("Dropping previous PTY channel ({})", DisconnectReason::ConnectPrep);
            old.shutdown(false);
        }

        self.emit(opts.generation, TransportEventKind::Connecting);

        if !self.resolve_capability().await? {
            return Err(TransportError::Unsupported);
        }

        let token = self.api.fetch_ws_token().await?;

        if !opts.preserve_screen {
            self.keys.reset_seq();
        }

        let url = self.build_url(token.as_deref(), opts.cols, opts.rows)?;
        debug!("Connecting PTY channel (generation {})", opts.generation);

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| {
                    TransportError::Timeout(format!(
                        "WebSocket handshake exceeded {}s",
                        self.connect_timeout.as_secs()
                    ))
                })??;

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let open = Arc::new(AtomicBool::new(true));
        let manual_close = Arc::new(AtomicBool::new(false));
        let generation = opts.generation;

        // Task: writer
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let result = match msg {
                    Outbound::Input(bytes) => sink.send(Message::Binary(bytes)).await,
                    Outbound::Control(frame) => sink.send(Message::Text(frame.to_json())).await,
                    Outbound::Shutdown { send_close } => {
                        if send_close {
                            if let Err(e) =
                                sink.send(Message::Text(ClientFrame::Close.to_json())).await
                            {
                                debug!("Failed to send close frame: {}", e);
                            }
                        }
                        let _ = sink.close().await;
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!("PTY send failed: {}", e);
                    break;
                }
            }
            debug!("PTY writer stopped");
        });

        // Task: reader
        {
            let events = self.events.clone();
            let keys = self.keys.clone();
            let open = open.clone();
            let manual_close = manual_close.clone();
            let outbound = outbound_tx.clone();

            tokio::spawn(async move {
                let emit = |payload: TransportEventKind| {
                    let _ = events.send(TransportEvent {
                        kind: TransportKind::Interactive,
                        generation,
                        payload,
                    });
                };
                let mut utf8 = Utf8Carry::default();
                let mut exited: Option<Option<i32>> = None;
                let mut server_close = false;
                let mut failure: Option<String> = None;

                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match parse_server_frame(&text) {
                            Some(ServerFrame::Init {
                                lines,
                                session_id,
                                shell,
                                reused,
                            }) => {
                                if let Some(id) = session_id.as_deref() {
                                    keys.set_session_id(id);
                                }
                                if !lines.is_empty() {
                                    emit(TransportEventKind::Replay(lines));
                                }
                                emit(TransportEventKind::SessionInfo {
                                    session_id,
                                    shell,
                                    reused,
                                });
                            }
                            Some(ServerFrame::Line { line }) => {
                                emit(TransportEventKind::Output(format!("{}\r\n", line)));
                            }
                            Some(ServerFrame::Output { data, seq }) => {
                                if let Some(seq) = seq.filter(|s| *s > 0) {
                                    if !keys.advance(seq) {
                                        debug!("Dropping replayed output seq={}", seq);
                                        continue;
                                    }
                                }
                                if !data.is_empty() {
                                    emit(TransportEventKind::Output(data));
                                }
                            }
                            Some(ServerFrame::Exit { code }) => {
                                info!("Remote PTY exited with {:?}", code);
                                keys.clear();
                                exited = Some(code);
                                emit(TransportEventKind::Exited { code });
                            }
                            Some(ServerFrame::Error { message }) => {
                                emit(TransportEventKind::Error {
                                    message: message.unwrap_or_else(|| "PTY error".to_string()),
                                    permanent: false,
                                });
                            }
                            Some(ServerFrame::Close) => {
                                server_close = true;
                            }
                            Some(ServerFrame::Pong { .. }) | Some(ServerFrame::Unknown) | None => {}
                        },
                        Ok(Message::Binary(bytes)) => {
                            let text = utf8.decode(&bytes);
                            if !text.is_empty() {
                                emit(TransportEventKind::Output(text));
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            debug!("PTY channel closed by peer: {:?}", frame);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            failure = Some(e.to_string());
                            break;
                        }
                    }
                }

                open.store(false, Ordering::SeqCst);
                let _ = outbound.send(Outbound::Shutdown { send_close: false });

                if manual_close.load(Ordering::SeqCst) {
                    debug!("PTY reader stopped after local teardown");
                    return;
                }

                let reason = if let Some(code) = exited {
                    CloseReason::Exited(code)
                } else if server_close {
                    CloseReason::ServerClose
                } else {
                    CloseReason::Unexpected(
                        failure.unwrap_or_else(|| "connection closed".to_string()),
                    )
                };
                info!("PTY channel ended: {:?}", reason);
                emit(TransportEventKind::Closed(reason));
            });
        }

        // Task: keepalive
        let keepalive = {
            let outbound = outbound_tx.clone();
            let period = self.keepalive;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let ping = ClientFrame::Ping {
                        ts: chrono::Utc::now().timestamp_millis(),
                    };
                    if outbound.send(Outbound::Control(ping)).is_err() {
                        break;
                    }
                }
            })
        };

        let conn = Connection {
            outbound: outbound_tx,
            open,
            manual_close,
            keepalive,
        };

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                // A newer connect or a disconnect raced us
                drop(state);
                conn.shutdown(false);
                return Err(TransportError::Disconnected);
            }
            let (cols, rows) = state.size;
            conn.push(Outbound::Control(ClientFrame::Resize { cols, rows }));
            state.last_resize = Some((cols, rows));
            while let Some(data) = state.pending.pop_front() {
                conn.push(Outbound::Input(data.into_bytes()));
            }
            state.conn = Some(conn);
        }

        info!("PTY channel open (generation {})", generation);
        self.emit(
            generation,
            TransportEventKind::Connected {
                session_key: self.keys.snapshot(),
            },
        );
        Ok(())
    }

    async fn disconnect(&self, opts: DisconnectOptions) {
        let (conn, generation) = {
            let mut state = self.state.lock();
            state.pending.clear();
            state.last_resize = None;
            // Invalidates any connect still in flight
            state.generation = state.generation.wrapping_add(1);
            (state.conn.take(), state.generation.wrapping_sub(1))
        };

        if opts.clear_session {
            self.keys.clear();
        }

        if let Some(conn) = conn {
            let was_open = conn.is_open();
            conn.shutdown(opts.send_close && was_open);
            info!(
                "PTY channel closed locally ({}, send_close={})",
                opts.reason,
                opts.send_close && was_open
            );
            self.emit(
                generation,
                TransportEventKind::Closed(CloseReason::Requested(opts.reason)),
            );
        }
    }

    fn send(&self, data: &str, opts: SendOptions) -> bool {
        let mut state = self.state.lock();
        if let Some(conn) = state.conn.as_ref().filter(|c| c.is_open()) {
            return conn.push(Outbound::Input(data.as_bytes().to_vec()));
        }
        if opts.allow_when_disconnected {
            state.pending.push_back(data.to_string());
            return true;
        }
        false
    }

    fn is_connected(&self) -> bool {
        self.state
            .lock()
            .conn
            .as_ref()
            .map(Connection::is_open)
            .unwrap_or(false)
    }

    fn resize(&self, cols: u16, rows: u16) -> bool {
        let mut state = self.state.lock();
        state.size = (cols, rows);
        if state.last_resize == Some((cols, rows)) {
            return false;
        }
        let sent = state
            .conn
            .as_ref()
            .filter(|c| c.is_open())
            .map(|c| c.push(Outbound::Control(ClientFrame::Resize { cols, rows })))
            .unwrap_or(false);
        if sent {
            state.last_resize = Some((cols, rows));
        }
        sent
    }

    fn send_signal(&self, name: &str) -> bool {
        let state = self.state.lock();
        state
            .conn
            .as_ref()
            .filter(|c| c.is_open())
            .map(|c| {
                c.push(Outbound::Control(ClientFrame::Signal {
                    name: name.to_uppercase(),
                }))
            })
            .unwrap_or(false)
    }

    fn session_key(&self) -> SessionKey {
        self.keys.snapshot()
    }
}

/// Decodes binary output, holding back a multi-byte character split
/// across frames
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let buf = std::mem::take(&mut self.pending);
        match std::str::from_utf8(&buf) {
            Ok(s) => s.to_string(),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.pending = buf[valid..].to_vec();
                String::from_utf8_lossy(&buf[..valid]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&buf).into_owned(),
        }
    }
}
