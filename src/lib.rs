//! PanelTerm - remote terminal sessions for router control panels
//!
//! A session either runs discrete commands over the panel's HTTP API or
//! drives a live PTY over WebSocket. Input typed into the terminal is
//! reconstructed into command lines for a persistent history.
//!
//! ```ignore
//! let store = Arc::new(LocalStore::open_default()?);
//! let config = ConfigStorage::new()?.load().await?;
//! let session = start_session(config, store, Some(Arc::new(HeadlessFactory::new())));
//! session.open(SessionMode::Interactive, None).await?;
//! ```

pub mod config;
pub mod events;
pub mod history;
pub mod session;
pub mod surface;
pub mod transport;

pub use config::{ConfigStorage, LocalStore, TerminalConfig, TerminalPrefs};
pub use events::{EventBus, NoticeLevel, TerminalEvent};
pub use history::{HistoryDirection, HistoryStore, LineReconstructor};
pub use session::{
    start_session, ConnectionState, SessionController, SessionHandle, SessionMode,
};
pub use surface::{HeadlessFactory, HostSurface, SurfaceManager, WidgetFactory};
pub use transport::{LiteTransport, PtyTransport, Transport, TransportError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global `tracing` subscriber. Filter comes from `RUST_LOG`,
/// `info` otherwise.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
