//! Command History
//!
//! - [`LineReconstructor`]: rebuilds typed lines from the raw interactive
//!   keystroke stream
//! - [`HistoryStore`]: bounded, persisted list of committed commands

pub mod capture;
pub mod store;

pub use capture::LineReconstructor;
pub use store::{HistoryDirection, HistoryStore, HISTORY_KEY, HISTORY_LIMIT};
