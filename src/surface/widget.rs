//! Terminal widget seam
//!
//! The emulator itself is a black box: anything that can render bytes and
//! report input implements [`TerminalWidget`]. A [`WidgetFactory`] creates
//! widgets and declares which optional extensions the host can load.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use super::capabilities::{Capabilities, Extension};
use crate::events::KeyEvent;

/// Surface errors
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("Terminal widget library is not available")]
    Unavailable,

    #[error("Failed to create terminal widget: {0}")]
    CreateFailed(String),

    #[error("Failed to mount terminal widget: {0}")]
    MountFailed(String),

    #[error("Extension {0} failed to load: {1}")]
    ExtensionFailed(Extension, String),

    #[error("Terminal surface has been disposed")]
    Disposed,
}

/// Options applied when a widget is created
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetOptions {
    pub font_size: u16,
    pub cursor_blink: bool,
    /// Translate bare `\n` into `\r\n` (off for raw PTY output)
    pub convert_eol: bool,
    pub scrollback: usize,
    pub cols: u16,
    pub rows: u16,
}

impl Default for WidgetOptions {
    fn default() -> Self {
        Self {
            font_size: crate::config::prefs::DEFAULT_FONT_SIZE,
            cursor_blink: false,
            convert_eol: true,
            scrollback: 2000,
            cols: 80,
            rows: 24,
        }
    }
}

/// Events a widget reports back to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetEvent {
    Data(String),
    Key(KeyEvent),
    Resize { cols: u16, rows: u16 },
    /// The GPU renderer lost its context and must be dropped
    RendererLost,
}

pub type WidgetListener = Arc<dyn Fn(WidgetEvent) + Send + Sync>;

/// Pixel size of one character cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellMetrics {
    pub width_px: f64,
    pub height_px: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeFormat {
    Text,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    /// Line index within the buffer (0 = oldest)
    pub line: usize,
    /// Char offset within the line
    pub column: usize,
    pub text: String,
}

/// Size of the display region a widget is mounted into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostSize {
    pub width_px: u32,
    pub height_px: u32,
}

/// A visible display region. The embedding application keeps the
/// [`HostSizeSender`] and reports layout changes through it.
#[derive(Debug, Clone)]
pub struct HostSurface {
    id: String,
    size: watch::Receiver<HostSize>,
}

pub type HostSizeSender = watch::Sender<HostSize>;

impl HostSurface {
    pub fn new(id: impl Into<String>, initial: HostSize) -> (Self, HostSizeSender) {
        let (tx, rx) = watch::channel(initial);
        (
            Self {
                id: id.into(),
                size: rx,
            },
            tx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> HostSize {
        *self.size.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<HostSize> {
        self.size.clone()
    }
}

pub trait TerminalWidget: Send {
    /// Mount into a host region
    fn open(&mut self, host: &HostSurface) -> Result<(), SurfaceError>;

    fn write(&mut self, data: &str);

    fn clear(&mut self);

    fn focus(&mut self);

    fn resize(&mut self, cols: u16, rows: u16);

    fn size(&self) -> (u16, u16);

    fn cell_metrics(&self) -> CellMetrics;

    fn set_font_size(&mut self, size: u16);

    fn set_cursor_blink(&mut self, blink: bool);

    fn set_convert_eol(&mut self, convert: bool);

    fn load_extension(&mut self, ext: Extension) -> Result<(), SurfaceError>;

    fn unload_extension(&mut self, ext: Extension);

    fn serialize(&self, format: SerializeFormat) -> String;

    fn find(&self, query: &str) -> Vec<SearchMatch>;

    fn links(&self) -> Vec<String>;

    fn set_listener(&mut self, listener: Option<WidgetListener>);

    fn dispose(&mut self);
}

pub trait WidgetFactory: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn create(&self, options: &WidgetOptions) -> Result<Box<dyn TerminalWidget>, SurfaceError>;
}
