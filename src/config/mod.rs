//! Configuration Management Module
//!
//! Handles the terminal config file (`terminal.json`), the client-side
//! key/value state store and display preferences.

pub mod prefs;
pub mod storage;
pub mod types;

pub use prefs::{clamp_font_size, TerminalPrefs, MAX_FONT_SIZE, MIN_FONT_SIZE};
pub use storage::{
    config_dir, local_state_file, terminal_config_file, ConfigStorage, LocalStore, StorageError,
};
pub use types::{LiteOutputConfig, ServerConfig, TerminalConfig, CONFIG_VERSION};
