//! Bounded command history persisted in the local state store

use std::sync::Arc;

use tracing::warn;

use crate::config::LocalStore;

pub const HISTORY_KEY: &str = "terminal_history";
pub const HISTORY_LIMIT: usize = 50;

/// Direction for browsing history from a line-input field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDirection {
    Older,
    Newer,
}

/// Committed commands, oldest first.
///
/// Adjacent duplicates are collapsed and only the newest
/// [`HISTORY_LIMIT`] entries are kept.
pub struct HistoryStore {
    items: Vec<String>,
    /// Browse position; `items.len()` means "past the newest entry"
    index: usize,
    store: Arc<LocalStore>,
}

impl HistoryStore {
    pub fn load(store: Arc<LocalStore>) -> Self {
        let items = match store.get(HISTORY_KEY) {
            Some(raw) => match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
                Ok(values) => {
                    let mut items: Vec<String> = values
                        .into_iter()
                        .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                        .filter(|s| !s.is_empty())
                        .collect();
                    let excess = items.len().saturating_sub(HISTORY_LIMIT);
                    items.drain(..excess);
                    items
                }
                Err(e) => {
                    warn!("Stored terminal history is corrupted, ignoring: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let index = items.len();
        Self {
            items,
            index,
            store,
        }
    }

    /// Append a command. Returns `true` if the history grew.
    pub fn push(&mut self, command: &str) -> bool {
        let text = command.trim();
        if text.is_empty() {
            return false;
        }

        if self.items.last().map(String::as_str) == Some(text) {
            self.index = self.items.len();
            return false;
        }

        self.items.push(text.to_string());
        if self.items.len() > HISTORY_LIMIT {
            let excess = self.items.len() - HISTORY_LIMIT;
            self.items.drain(..excess);
        }
        self.index = self.items.len();
        self.save();
        true
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index = 0;
        if let Err(e) = self.store.remove(HISTORY_KEY) {
            warn!("Failed to clear terminal history: {}", e);
        }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest-first, case-insensitive substring match
    pub fn filter(&self, query: &str) -> Vec<&str> {
        let q = query.trim().to_lowercase();
        self.items
            .iter()
            .rev()
            .filter(|c| q.is_empty() || c.to_lowercase().contains(&q))
            .map(String::as_str)
            .collect()
    }

    /// Step through history for the line-input field.
    ///
    /// `None` when history is empty. Moving newer past the newest entry
    /// yields an empty string (the field is cleared).
    pub fn navigate(&mut self, direction: HistoryDirection) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        match direction {
            HistoryDirection::Older => {
                self.index = self.index.min(self.items.len()).saturating_sub(1);
            }
            HistoryDirection::Newer => {
                if self.index + 1 >= self.items.len() {
                    self.index = self.items.len();
                    return Some(String::new());
                }
                self.index += 1;
            }
        }
        self.items.get(self.index).cloned()
    }

    fn save(&self) {
        match serde_json::to_string(&self.items) {
            Ok(raw) => {
                if let Err(e) = self.store.set(HISTORY_KEY, raw) {
                    warn!("Failed to persist terminal history: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode terminal history: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> HistoryStore {
        HistoryStore::load(Arc::new(LocalStore::in_memory()))
    }

    #[test]
    fn test_adjacent_duplicates_collapse() {
        let mut h = history();
        assert!(h.push("ls"));
        assert!(!h.push("ls"));
        assert!(!h.push("  ls "));
        assert_eq!(h.items(), &["ls".to_string()]);

        h.push("pwd");
        h.push("ls");
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn test_limit_keeps_newest() {
        let mut h = history();
        for i in 0..60 {
            h.push(&format!("cmd {}", i));
        }
        assert_eq!(h.len(), HISTORY_LIMIT);
        assert_eq!(h.items()[0], "cmd 10");
        assert_eq!(h.items()[HISTORY_LIMIT - 1], "cmd 59");
    }

    #[test]
    fn test_persist_and_reload() {
        let store = Arc::new(LocalStore::in_memory());
        let mut h = HistoryStore::load(store.clone());
        h.push("cd /tmp");
        h.push("xkeen -restart");

        let reloaded = HistoryStore::load(store);
        assert_eq!(
            reloaded.items(),
            &["cd /tmp".to_string(), "xkeen -restart".to_string()]
        );
    }

    #[test]
    fn test_corrupt_storage_is_ignored() {
        let store = Arc::new(LocalStore::in_memory());
        store.set(HISTORY_KEY, "{oops").unwrap();
        assert!(HistoryStore::load(store.clone()).is_empty());

        store.set(HISTORY_KEY, r#"["a", 3, "", "  b  "]"#).unwrap();
        let h = HistoryStore::load(store);
        assert_eq!(h.items(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_reload_keeps_newest_valid_entries() {
        let store = Arc::new(LocalStore::in_memory());
        let mut raw: Vec<serde_json::Value> =
            (0..HISTORY_LIMIT).map(|i| format!("cmd {}", i).into()).collect();
        raw.extend(std::iter::repeat(serde_json::Value::Null).take(5));
        raw.push("".into());
        store.set(HISTORY_KEY, serde_json::to_string(&raw).unwrap()).unwrap();

        let h = HistoryStore::load(store);
        assert_eq!(h.len(), HISTORY_LIMIT);
        assert_eq!(h.items()[0], "cmd 0");
        assert_eq!(h.items()[HISTORY_LIMIT - 1], format!("cmd {}", HISTORY_LIMIT - 1));
    }

    #[test]
    fn test_clear_removes_key() {
        let store = Arc::new(LocalStore::in_memory());
        let mut h = HistoryStore::load(store.clone());
        h.push("uptime");
        h.clear();
        assert!(h.is_empty());
        assert!(!store.contains(HISTORY_KEY));
    }

    #[test]
    fn test_filter_newest_first() {
        let mut h = history();
        h.push("ip route");
        h.push("uptime");
        h.push("IP addr");
        assert_eq!(h.filter("ip"), vec!["IP addr", "ip route"]);
        assert_eq!(h.filter("").len(), 3);
    }

    #[test]
    fn test_navigate() {
        let mut h = history();
        assert_eq!(h.navigate(HistoryDirection::Older), None);

        h.push("one");
        h.push("two");
        assert_eq!(h.navigate(HistoryDirection::Older).as_deref(), Some("two"));
        assert_eq!(h.navigate(HistoryDirection::Older).as_deref(), Some("one"));
        assert_eq!(h.navigate(HistoryDirection::Older).as_deref(), Some("one"));
        assert_eq!(h.navigate(HistoryDirection::Newer).as_deref(), Some("two"));
        assert_eq!(h.navigate(HistoryDirection::Newer).as_deref(), Some(""));
    }
}
