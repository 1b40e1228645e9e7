//! Terminal Surface Module
//!
//! Owns the single terminal widget of a session:
//! - creation with user preferences and every extension the host offers
//! - mounting into a host region, with size observation and re-fit
//! - handing widget input to the session owner over a lossless channel,
//!   and republishing it as [`TerminalEvent`]s for observers
//! - teardown that is safe after partial failure
//!
//! Nothing outside this module holds the widget. Callers go through
//! [`SurfaceManager`], whose methods become logged no-ops once the surface
//! has been disposed.

pub mod capabilities;
pub mod headless;
pub mod widget;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use capabilities::{Capabilities, Extension};
pub use headless::{HeadlessFactory, HeadlessInput, HeadlessWidget};
pub use widget::{
    CellMetrics, HostSize, HostSizeSender, HostSurface, SearchMatch, SerializeFormat,
    SurfaceError, TerminalWidget, WidgetEvent, WidgetFactory, WidgetListener, WidgetOptions,
};

use crate::config::TerminalPrefs;
use crate::events::{EventBus, NoticeLevel, TerminalEvent};

/// Delay between a host size change and the re-fit it triggers
pub const FIT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Plain-text output kept when no widget can be created
pub const FALLBACK_MAX_CHARS: usize = 256 * 1024;

/// Result of [`SurfaceManager::ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ensured {
    /// A new widget was constructed by this call
    pub created: bool,
}

/// Widget input for the session owner, in the order the widget produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceInput {
    Data(String),
    Resize { cols: u16, rows: u16 },
}

pub type SurfaceInputReceiver = mpsc::UnboundedReceiver<SurfaceInput>;

struct SurfaceInner {
    widget: Option<Box<dyn TerminalWidget>>,
    loaded: BTreeSet<Extension>,
    prefs: TerminalPrefs,
    typography_scale: f64,
    convert_eol: bool,
    host: Option<HostSurface>,
    mounted: bool,
    observer: Option<JoinHandle<()>>,
    fallback: String,
    fallback_visible: bool,
    disposed: bool,
}

/// Surface manager for one session
#[derive(Clone)]
pub struct SurfaceManager {
    factory: Option<Arc<dyn WidgetFactory>>,
    capabilities: Capabilities,
    bus: EventBus,
    inner: Arc<Mutex<SurfaceInner>>,
    /// Last `{cols, rows}` broadcast on the bus
    last_size: Arc<Mutex<Option<(u16, u16)>>>,
    renderer_lost: Arc<AtomicBool>,
    input_tx: Arc<Mutex<Option<mpsc::UnboundedSender<SurfaceInput>>>>,
}

impl SurfaceManager {
    /// `factory` is `None` when no terminal widget library is available.
    /// Capabilities are resolved here, once.
    pub fn new(factory: Option<Arc<dyn WidgetFactory>>, bus: EventBus) -> Self {
        let capabilities = factory
            .as_ref()
            .map(|f| f.capabilities())
            .unwrap_or_else(Capabilities::none);

        Self {
            factory,
            capabilities,
            bus,
            inner: Arc::new(Mutex::new(SurfaceInner {
                widget: None,
                loaded: BTreeSet::new(),
                prefs: TerminalPrefs::default(),
                typography_scale: 1.0,
                convert_eol: true,
                host: None,
                mounted: false,
                observer: None,
                fallback: String::new(),
                fallback_visible: true,
                disposed: false,
            })),
            last_size: Arc::new(Mutex::new(None)),
            renderer_lost: Arc::new(AtomicBool::new(false)),
            input_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Route widget data and size changes to the returned receiver. A later
    /// call replaces the previous receiver. Until one is taken, input only
    /// reaches the bus.
    pub fn input_channel(&self) -> SurfaceInputReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.input_tx.lock() = Some(tx);
        rx
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_available(&self) -> bool {
        self.factory.is_some()
    }

    /// Create the widget if it does not exist yet.
    ///
    /// Returns `None` when no widget library is available, or creation
    /// failed. The caller then falls back to plain-text output.
    pub fn ensure(&self, prefs: TerminalPrefs) -> Option<Ensured> {
        let factory = self.factory.clone()?;
        let mut inner = self.inner.lock();

        if inner.widget.is_some() {
            return Some(Ensured { created: false });
        }

        inner.prefs = prefs;
        let options = WidgetOptions {
            font_size: prefs.effective_font_size(inner.typography_scale),
            cursor_blink: prefs.cursor_blink,
            convert_eol: inner.convert_eol,
            ..Default::default()
        };

        let mut widget = match factory.create(&options) {
            Ok(widget) => widget,
            Err(e) => {
                warn!("Terminal widget creation failed: {}", e);
                self.bus
                    .notice(NoticeLevel::Warning, format!("Terminal unavailable: {}", e));
                return None;
            }
        };

        let mut loaded = BTreeSet::new();
        for ext in self.capabilities.available() {
            match widget.load_extension(ext) {
                Ok(()) => {
                    loaded.insert(ext);
                }
                Err(e) => warn!("Terminal extension {} not loaded: {}", ext, e),
            }
        }
        debug!("Terminal extensions loaded: {:?}", loaded);

        widget.set_listener(Some(self.listener()));

        *self.last_size.lock() = Some(widget.size());
        self.renderer_lost.store(false, Ordering::Release);

        inner.widget = Some(widget);
        inner.loaded = loaded;
        inner.disposed = false;
        info!("Terminal widget created");

        Some(Ensured { created: true })
    }

    /// Forward widget events to the input channel and the bus, dropping
    /// repeated sizes
    fn listener(&self) -> WidgetListener {
        let bus = self.bus.clone();
        let last_size = self.last_size.clone();
        let renderer_lost = self.renderer_lost.clone();
        let input_tx = self.input_tx.clone();
        let forward = move |input: SurfaceInput| {
            if let Some(tx) = input_tx.lock().as_ref() {
                if tx.send(input).is_err() {
                    debug!("Surface input dropped: session owner has stopped");
                }
            }
        };

        Arc::new(move |event| match event {
            WidgetEvent::Data(data) => {
                forward(SurfaceInput::Data(data.clone()));
                bus.publish(TerminalEvent::Data(data));
            }
            WidgetEvent::Key(key) => bus.publish(TerminalEvent::Key(key)),
            WidgetEvent::Resize { cols, rows } => {
                let mut last = last_size.lock();
                if *last == Some((cols, rows)) {
                    return;
                }
                *last = Some((cols, rows));
                drop(last);
                forward(SurfaceInput::Resize { cols, rows });
                bus.publish(TerminalEvent::Resize { cols, rows });
            }
            WidgetEvent::RendererLost => {
                renderer_lost.store(true, Ordering::Release);
            }
        })
    }

    /// Mount the widget into `host` and start observing its size.
    ///
    /// Without a widget the plain-text fallback stays visible.
    pub fn attach(&self, host: HostSurface) {
        let mut inner = self.inner.lock();

        let same_host = inner.host.as_ref().map(|h| h.id()) == Some(host.id());
        if same_host && inner.mounted {
            return;
        }

        if let Some(task) = inner.observer.take() {
            task.abort();
        }

        let mounted = match inner.widget.as_mut() {
            Some(widget) => match widget.open(&host) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to mount terminal on {}: {}", host.id(), e);
                    false
                }
            },
            None => false,
        };

        inner.mounted = mounted;
        inner.host = Some(host.clone());
        self.set_fallback_visible(&mut inner, !mounted);

        if mounted {
            self.fit_locked(&mut inner);
            inner.observer = self.spawn_observer(host);
        }
    }

    fn spawn_observer(&self, host: HostSurface) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, host size changes will not re-fit the terminal");
            return None;
        };

        let manager = self.clone();
        let mut size_rx = host.watch();
        Some(runtime.spawn(async move {
            while size_rx.changed().await.is_ok() {
                tokio::time::sleep(FIT_DEBOUNCE).await;
                size_rx.borrow_and_update();
                manager.fit();
            }
            debug!("Host {} size observer finished", host.id());
        }))
    }

    /// Release the host region but keep the widget for a later reattach
    pub fn detach_host(&self) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.observer.take() {
            task.abort();
        }
        inner.host = None;
        inner.mounted = false;
    }

    /// Re-derive cols/rows from the host size (requires the fit extension)
    pub fn fit(&self) {
        let mut inner = self.inner.lock();
        self.fit_locked(&mut inner);
    }

    fn fit_locked(&self, inner: &mut SurfaceInner) {
        self.drop_lost_renderer(inner);

        if !inner.loaded.contains(&Extension::Fit) || !inner.mounted {
            return;
        }
        let Some(host) = inner.host.as_ref() else {
            return;
        };
        let size = host.size();
        if size.width_px == 0 || size.height_px == 0 {
            // Hidden host, keep the current geometry
            return;
        }
        let Some(widget) = inner.widget.as_mut() else {
            return;
        };

        let cell = widget.cell_metrics();
        let cols = (size.width_px as f64 / cell.width_px).floor().clamp(2.0, u16::MAX as f64);
        let rows = (size.height_px as f64 / cell.height_px).floor().clamp(1.0, u16::MAX as f64);
        widget.resize(cols as u16, rows as u16);
    }

    /// Apply display preferences; font size is `base * typography scale`
    pub fn apply_preferences(&self, prefs: TerminalPrefs) {
        let mut inner = self.inner.lock();
        inner.prefs = prefs;
        self.apply_locked(&mut inner);
    }

    /// Global typography scale changed
    pub fn set_typography_scale(&self, scale: f64) {
        let mut inner = self.inner.lock();
        inner.typography_scale = scale;
        self.apply_locked(&mut inner);
    }

    fn apply_locked(&self, inner: &mut SurfaceInner) {
        let size = inner.prefs.effective_font_size(inner.typography_scale);
        let blink = inner.prefs.cursor_blink;
        if let Some(widget) = inner.widget.as_mut() {
            widget.set_font_size(size);
            widget.set_cursor_blink(blink);
        }
        self.fit_locked(inner);
    }

    pub fn effective_font_size(&self) -> u16 {
        let inner = self.inner.lock();
        inner.prefs.effective_font_size(inner.typography_scale)
    }

    /// Raw PTY output needs `convert_eol` off; discrete output wants it on
    pub fn set_convert_eol(&self, convert: bool) {
        let mut inner = self.inner.lock();
        inner.convert_eol = convert;
        if let Some(widget) = inner.widget.as_mut() {
            widget.set_convert_eol(convert);
        }
    }

    pub fn write(&self, data: &str) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            debug!("write on disposed terminal surface ignored");
            return;
        }
        self.drop_lost_renderer(&mut inner);
        match inner.widget.as_mut() {
            Some(widget) => widget.write(data),
            None => push_fallback(&mut inner.fallback, data),
        }
    }

    pub fn writeln(&self, line: &str) {
        self.write(&format!("{}\r\n", line));
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        match inner.widget.as_mut() {
            Some(widget) => widget.clear(),
            None => inner.fallback.clear(),
        }
    }

    pub fn focus(&self) {
        let mut inner = self.inner.lock();
        if let Some(widget) = inner.widget.as_mut() {
            widget.focus();
        }
    }

    pub fn size(&self) -> Option<(u16, u16)> {
        self.inner.lock().widget.as_ref().map(|w| w.size())
    }

    pub fn has_widget(&self) -> bool {
        self.inner.lock().widget.is_some()
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.lock().mounted
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn loaded_extensions(&self) -> Vec<Extension> {
        self.inner.lock().loaded.iter().copied().collect()
    }

    pub fn fallback_visible(&self) -> bool {
        self.inner.lock().fallback_visible
    }

    /// Text written while no widget existed
    pub fn fallback_text(&self) -> String {
        self.inner.lock().fallback.clone()
    }

    /// Export the buffer; `None` without the serialize extension
    pub fn serialize(&self, format: SerializeFormat) -> Option<String> {
        let inner = self.inner.lock();
        if !inner.loaded.contains(&Extension::Serialize) {
            return None;
        }
        inner.widget.as_ref().map(|w| w.serialize(format))
    }

    /// Search the buffer; empty without the search extension
    pub fn find(&self, query: &str) -> Vec<SearchMatch> {
        let inner = self.inner.lock();
        if !inner.loaded.contains(&Extension::Search) {
            return Vec::new();
        }
        inner
            .widget
            .as_ref()
            .map(|w| w.find(query))
            .unwrap_or_default()
    }

    /// Hyperlinks in the buffer; empty without the web-links extension
    pub fn links(&self) -> Vec<String> {
        let inner = self.inner.lock();
        if !inner.loaded.contains(&Extension::WebLinks) {
            return Vec::new();
        }
        inner
            .widget
            .as_ref()
            .map(|w| w.links())
            .unwrap_or_default()
    }

    /// Tear everything down. Safe to call repeatedly or after a failed
    /// `ensure`.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();

        if let Some(task) = inner.observer.take() {
            task.abort();
        }

        if let Some(mut widget) = inner.widget.take() {
            widget.set_listener(None);
            for ext in inner.loaded.iter().rev() {
                widget.unload_extension(*ext);
            }
            widget.dispose();
            info!("Terminal widget disposed");
        }

        inner.loaded.clear();
        inner.host = None;
        inner.mounted = false;
        inner.disposed = true;
        inner.fallback.clear();
        *self.last_size.lock() = None;
        self.renderer_lost.store(false, Ordering::Release);
        self.set_fallback_visible(&mut inner, true);
    }

    fn set_fallback_visible(&self, inner: &mut SurfaceInner, visible: bool) {
        if inner.fallback_visible != visible {
            inner.fallback_visible = visible;
            self.bus.publish(TerminalEvent::FallbackVisible(visible));
        }
    }

    fn drop_lost_renderer(&self, inner: &mut SurfaceInner) {
        if !self.renderer_lost.swap(false, Ordering::AcqRel) {
            return;
        }
        if inner.loaded.remove(&Extension::Webgl) {
            if let Some(widget) = inner.widget.as_mut() {
                widget.unload_extension(Extension::Webgl);
            }
            warn!("GPU renderer context lost, continuing without it");
            self.bus.notice(
                NoticeLevel::Warning,
                "GPU renderer lost, using the default renderer",
            );
        }
    }
}

fn push_fallback(buffer: &mut String, data: &str) {
    buffer.push_str(&strip_ansi_escapes::strip_str(data));
    if buffer.len() > FALLBACK_MAX_CHARS {
        let mut cut = buffer.len() - FALLBACK_MAX_CHARS;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}
