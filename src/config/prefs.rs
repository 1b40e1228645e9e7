//! Display preferences for the terminal surface
//!
//! Stored as plain strings in the [`LocalStore`] and always read with safe
//! fallbacks: a missing or unparsable value yields the default.

use serde::{Deserialize, Serialize};

use super::storage::{LocalStore, StorageError};

pub const FONT_SIZE_KEY: &str = "term_font_size_v1";
pub const CURSOR_BLINK_KEY: &str = "term_cursor_blink_v1";

pub const MIN_FONT_SIZE: u16 = 8;
pub const MAX_FONT_SIZE: u16 = 32;
pub const DEFAULT_FONT_SIZE: u16 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminalPrefs {
    pub font_size: u16,
    pub cursor_blink: bool,
}

impl Default for TerminalPrefs {
    fn default() -> Self {
        Self {
            font_size: DEFAULT_FONT_SIZE,
            cursor_blink: false,
        }
    }
}

impl TerminalPrefs {
    pub fn load(store: &LocalStore) -> Self {
        let font_size = store
            .get(FONT_SIZE_KEY)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .map(|v| clamp_font_size(v.round()))
            .unwrap_or(DEFAULT_FONT_SIZE);

        let cursor_blink = store
            .get(CURSOR_BLINK_KEY)
            .map(|raw| matches!(raw.trim(), "1" | "true"))
            .unwrap_or(false);

        Self {
            font_size,
            cursor_blink,
        }
    }

    pub fn save(&self, store: &LocalStore) -> Result<(), StorageError> {
        store.set(FONT_SIZE_KEY, clamp_font_size(self.font_size as f64).to_string())?;
        store.set(CURSOR_BLINK_KEY, if self.cursor_blink { "1" } else { "0" })?;
        Ok(())
    }

    /// Font size actually applied to the widget for a given typography scale
    pub fn effective_font_size(&self, typography_scale: f64) -> u16 {
        let scale = if typography_scale.is_finite() && typography_scale > 0.0 {
            typography_scale
        } else {
            1.0
        };
        clamp_font_size((self.font_size as f64 * scale).round())
    }
}

pub fn clamp_font_size(size: f64) -> u16 {
    if !size.is_finite() {
        return DEFAULT_FONT_SIZE;
    }
    size.clamp(MIN_FONT_SIZE as f64, MAX_FONT_SIZE as f64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_absent() {
        let store = LocalStore::in_memory();
        assert_eq!(TerminalPrefs::load(&store), TerminalPrefs::default());
    }

    #[test]
    fn test_corrupt_values_fall_back() {
        let store = LocalStore::in_memory();
        store.set(FONT_SIZE_KEY, "huge").unwrap();
        store.set(CURSOR_BLINK_KEY, "maybe").unwrap();

        let prefs = TerminalPrefs::load(&store);
        assert_eq!(prefs.font_size, DEFAULT_FONT_SIZE);
        assert!(!prefs.cursor_blink);
    }

    #[test]
    fn test_stored_size_is_clamped() {
        let store = LocalStore::in_memory();
        store.set(FONT_SIZE_KEY, "64").unwrap();
        store.set(CURSOR_BLINK_KEY, "1").unwrap();

        let prefs = TerminalPrefs::load(&store);
        assert_eq!(prefs.font_size, MAX_FONT_SIZE);
        assert!(prefs.cursor_blink);
    }

    #[test]
    fn test_effective_font_size() {
        let prefs = TerminalPrefs {
            font_size: 14,
            cursor_blink: false,
        };
        assert_eq!(prefs.effective_font_size(1.0), 14);
        assert_eq!(prefs.effective_font_size(1.25), 18);
        assert_eq!(prefs.effective_font_size(0.1), MIN_FONT_SIZE);
        assert_eq!(prefs.effective_font_size(4.0), MAX_FONT_SIZE);
        assert_eq!(prefs.effective_font_size(f64::NAN), 14);
    }

    #[test]
    fn test_save_roundtrip_through_store() {
        let store = LocalStore::in_memory();
        let prefs = TerminalPrefs {
            font_size: 16,
            cursor_blink: true,
        };
        prefs.save(&store).unwrap();
        assert_eq!(store.get(FONT_SIZE_KEY).as_deref(), Some("16"));
        assert_eq!(TerminalPrefs::load(&store), prefs);
    }
}
