//! Transport doubles shared by the session tests

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::controller::SessionController;
use super::types::{CloseReason, SessionMode};
use crate::config::{LocalStore, TerminalConfig};
use crate::events::EventBus;
use crate::surface::{HeadlessFactory, HeadlessInput, SurfaceManager, WidgetFactory};
use crate::transport::{
    event_channel, ConnectOptions, DisconnectOptions, EventReceiver, EventSender, SendOptions,
    SessionKey, Transport, TransportError, TransportEvent, TransportEventKind, TransportKind,
    TransportSet,
};

/// Interactive transport double: records calls, connects on demand
pub(crate) struct FakePty {
    pub(crate) events: EventSender,
    pub(crate) connected: Mutex<bool>,
    pub(crate) generation: Mutex<u64>,
    /// Scripted connect results, `Ok` when empty
    pub(crate) results: Mutex<VecDeque<Result<(), TransportError>>>,
    /// When set, connect waits for a permit before it resolves
    pub(crate) gate: Mutex<Option<Arc<Notify>>>,
    pub(crate) connects: Mutex<Vec<ConnectOptions>>,
    pub(crate) disconnects: Mutex<Vec<DisconnectOptions>>,
    pub(crate) sent: Mutex<Vec<String>>,
    pub(crate) signals: Mutex<Vec<String>>,
}

impl FakePty {
    pub(crate) fn new(events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            events,
            connected: Mutex::new(false),
            generation: Mutex::new(0),
            results: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            connects: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn emit(&self, payload: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            kind: TransportKind::Interactive,
            generation: *self.generation.lock(),
            payload,
        });
    }

    /// Simulate the socket dropping
    pub(crate) fn drop_connection(&self) {
        *self.connected.lock() = false;
        self.emit(TransportEventKind::Closed(CloseReason::Unexpected(
            "reset".into(),
        )));
    }
}

#[async_trait]
impl Transport for FakePty {
    fn kind(&self) -> TransportKind {
        TransportKind::Interactive
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<(), TransportError> {
        self.connects.lock().push(opts);
        *self.generation.lock() = opts.generation;
        self.emit(TransportEventKind::Connecting);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let result = self.results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            *self.connected.lock() = true;
            self.emit(TransportEventKind::Connected {
                session_key: SessionKey::default(),
            });
        }
        result
    }

    async fn disconnect(&self, opts: DisconnectOptions) {
        self.disconnects.lock().push(opts);
        let was_connected = std::mem::replace(&mut *self.connected.lock(), false);
        if was_connected {
            self.emit(TransportEventKind::Closed(CloseReason::Requested(opts.reason)));
        }
    }

    fn send(&self, data: &str, opts: SendOptions) -> bool {
        if *self.connected.lock() || opts.allow_when_disconnected {
            self.sent.lock().push(data.to_string());
            return true;
        }
        false
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    fn send_signal(&self, name: &str) -> bool {
        self.signals.lock().push(name.to_uppercase());
        true
    }
}

/// Lite transport double
pub(crate) struct FakeLite {
    pub(crate) events: EventSender,
    pub(crate) sent: Mutex<Vec<(String, SendOptions)>>,
    pub(crate) modes: Mutex<Vec<SessionMode>>,
}

#[async_trait]
impl Transport for FakeLite {
    fn kind(&self) -> TransportKind {
        TransportKind::Lite
    }

    async fn connect(&self, _opts: ConnectOptions) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self, _opts: DisconnectOptions) {}

    fn send(&self, data: &str, opts: SendOptions) -> bool {
        self.sent.lock().push((data.to_string(), opts));
        let _ = self.events.send(TransportEvent {
            kind: TransportKind::Lite,
            generation: 0,
            payload: TransportEventKind::Output(format!("out: {}", data.trim())),
        });
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn set_mode(&self, mode: SessionMode) {
        self.modes.lock().push(mode);
    }
}

pub(crate) struct Fixture {
    pub(crate) controller: SessionController,
    pub(crate) pty: Arc<FakePty>,
    pub(crate) lite: Arc<FakeLite>,
    pub(crate) rx: EventReceiver,
    pub(crate) store: Arc<LocalStore>,
    /// Keyboard of the headless widget, detached without one
    pub(crate) input: HeadlessInput,
}

impl Fixture {
    pub(crate) fn new(with_widget: bool) -> Self {
        let (tx, rx) = event_channel();
        let pty = FakePty::new(tx.clone());
        let lite = Arc::new(FakeLite {
            events: tx,
            sent: Mutex::new(Vec::new()),
            modes: Mutex::new(Vec::new()),
        });
        let bus = EventBus::new();
        let headless = Arc::new(HeadlessFactory::new());
        let input = headless.input();
        let factory: Option<Arc<dyn WidgetFactory>> = if with_widget {
            Some(headless as Arc<dyn WidgetFactory>)
        } else {
            None
        };
        let surface = SurfaceManager::new(factory, bus.clone());
        let store = Arc::new(LocalStore::in_memory());
        let controller = SessionController::new(
            TerminalConfig::default(),
            TransportSet::new(pty.clone(), lite.clone()),
            surface,
            store.clone(),
            bus,
        );
        Self {
            controller,
            pty,
            lite,
            rx,
            store,
            input,
        }
    }

    /// Deliver every queued transport event
    pub(crate) async fn pump(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.controller.handle_transport_event(event).await;
        }
    }

    pub(crate) fn type_text(&mut self, text: &str) {
        for ch in text.chars() {
            self.controller.on_surface_data(&ch.to_string());
        }
    }
}
