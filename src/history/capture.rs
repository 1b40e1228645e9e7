//! Typed-line capture for interactive sessions
//!
//! The remote shell owns the real line editor and its echo is not available
//! here, so the reconstructor replays the keystroke stream through a small
//! local line model and reports the lines the user most likely submitted.
//!
//! Every `consume` call is expected to carry complete escape sequences.
//! A sequence split across two calls is not stitched back together.

use std::sync::LazyLock;

use regex::Regex;

const ESC: char = '\x1b';

static PASSWORD_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(password|passphrase|парол[ья])")
        .expect("PASSWORD_PROMPT_RE regex pattern is valid")
});

/// Line reconstruction state for one keystroke stream
#[derive(Debug, Default, Clone)]
pub struct LineReconstructor {
    line: Vec<char>,
    cursor: usize,
    had_printable: bool,
    sensitive: bool,
}

impl LineReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw input destined for the remote shell.
    ///
    /// Returns the lines committed by this chunk, in order. Lines typed while
    /// the sensitive flag was set are not returned.
    pub fn consume(&mut self, chunk: &str) -> Vec<String> {
        let mut committed = Vec::new();
        let s: Vec<char> = chunk.chars().collect();
        let mut i = 0;

        while i < s.len() {
            let ch = s[i];

            if ch == ESC {
                i += self.consume_escape(&s[i..]);
                continue;
            }

            match ch {
                '\r' | '\n' => {
                    if let Some(line) = self.commit() {
                        committed.push(line);
                    }
                }
                '\x7f' | '\x08' => {
                    if self.cursor > 0 {
                        self.line.remove(self.cursor - 1);
                        self.cursor -= 1;
                        self.had_printable = true;
                    }
                }
                // Ctrl-C / Ctrl-D
                '\x03' | '\x04' => {
                    self.sensitive = false;
                    self.reset_line();
                }
                // Ctrl-U
                '\x15' => {
                    let was_empty = self.line.is_empty();
                    self.reset_line();
                    if !was_empty {
                        self.had_printable = true;
                    }
                }
                // Ctrl-W
                '\x17' => self.kill_word(),
                // Ctrl-A / Ctrl-E
                '\x01' => self.cursor = 0,
                '\x05' => self.cursor = self.line.len(),
                c if c == '\t' || (c as u32) >= 0x20 => {
                    self.line.insert(self.cursor, c);
                    self.cursor += 1;
                    self.had_printable = true;
                }
                _ => {}
            }
            i += 1;
        }

        committed
    }

    /// Handle an escape sequence at the start of `s`, returning how many
    /// chars were consumed.
    fn consume_escape(&mut self, s: &[char]) -> usize {
        match (s.get(1), s.get(2), s.get(3)) {
            // Up / Down: history recall inside the remote shell, content unknown
            (Some('['), Some('A' | 'B'), _) => {
                self.sensitive = false;
                self.reset_line();
                3
            }
            (Some('['), Some('C'), _) => {
                self.cursor = (self.cursor + 1).min(self.line.len());
                3
            }
            (Some('['), Some('D'), _) => {
                self.cursor = self.cursor.saturating_sub(1);
                3
            }
            (Some('['), Some('3'), Some('~')) => {
                if self.cursor < self.line.len() {
                    self.line.remove(self.cursor);
                    self.had_printable = true;
                }
                4
            }
            (Some('['), Some('H'), _) => {
                self.cursor = 0;
                3
            }
            (Some('['), Some('F'), _) => {
                self.cursor = self.line.len();
                3
            }
            (Some('[' | 'O'), _, _) => {
                // Generic CSI / SS3: absorb through the final byte
                let mut j = 2;
                while j < s.len() {
                    let c = s[j];
                    j += 1;
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
                j
            }
            _ => 1,
        }
    }

    fn kill_word(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let mut k = self.cursor;
        while k > 0 && self.line[k - 1].is_whitespace() {
            k -= 1;
        }
        while k > 0 && !self.line[k - 1].is_whitespace() {
            k -= 1;
        }
        self.line.drain(k..self.cursor);
        self.cursor = k;
        self.had_printable = true;
    }

    fn commit(&mut self) -> Option<String> {
        let text: String = self.line.iter().collect();
        let text = text.trim();
        let result = if !text.is_empty() && self.had_printable && !self.sensitive {
            Some(text.to_string())
        } else {
            None
        };
        self.sensitive = false;
        self.reset_line();
        result
    }

    fn reset_line(&mut self) {
        self.line.clear();
        self.cursor = 0;
        self.had_printable = false;
    }

    /// Inspect remote output; a password-like prompt makes the next commit
    /// non-recordable.
    pub fn mark_sensitive_from_output(&mut self, chunk: &str) {
        if !chunk.is_empty() && PASSWORD_PROMPT_RE.is_match(chunk) {
            self.sensitive = true;
        }
    }

    pub fn set_sensitive(&mut self, sensitive: bool) {
        self.sensitive = sensitive;
    }

    /// Drop all in-progress state, including sensitivity
    pub fn reset(&mut self) {
        self.sensitive = false;
        self.reset_line();
    }

    pub fn pending_line(&self) -> String {
        self.line.iter().collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn had_printable_input(&self) -> bool {
        self.had_printable
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorbed_sequences_leave_state_unchanged() {
        let mut r = LineReconstructor::new();
        r.consume("ab");
        r.consume("\x1bOP\x1b[1;5R\x1b[?25h\x1b[200~");

        assert_eq!(r.pending_line(), "ab");
        assert_eq!(r.cursor(), 2);
    }

    #[test]
    fn test_enter_on_fresh_buffer_commits_nothing() {
        let mut r = LineReconstructor::new();
        assert!(r.consume("\r").is_empty());
        assert!(r.consume("   \r").is_empty());
    }

    #[test]
    fn test_backspace_at_start_is_noop() {
        let mut r = LineReconstructor::new();
        r.consume("\x7f");
        assert_eq!(r.cursor(), 0);
        assert!(!r.had_printable_input());

        r.consume("ab\x1b[H\x08");
        assert_eq!(r.pending_line(), "ab");
        assert_eq!(r.cursor(), 0);
    }

    #[test]
    fn test_kill_word() {
        let mut r = LineReconstructor::new();
        r.consume("git commit -m foo");
        r.consume("\x17");
        assert_eq!(r.pending_line(), "git commit -m ");
        assert_eq!(r.cursor(), "git commit -m ".len());

        r.consume("\x17");
        assert_eq!(r.pending_line(), "git commit ");
    }

    #[test]
    fn test_cursor_editing() {
        let mut r = LineReconstructor::new();
        // type "lx", move left, insert 's' before 'x', delete 'x'
        r.consume("lx\x1b[Ds\x1b[3~");
        assert_eq!(r.pending_line(), "ls");

        r.consume("\x01#\x05 -la");
        assert_eq!(r.pending_line(), "#ls -la");

        // right arrow at end is clamped
        r.consume("\x1b[C\x1b[C");
        assert_eq!(r.cursor(), 7);

        assert_eq!(r.consume("\r"), vec!["#ls -la".to_string()]);
        assert_eq!(r.pending_line(), "");
    }

    #[test]
    fn test_history_recall_resets_buffer() {
        let mut r = LineReconstructor::new();
        r.consume("echo hi");
        r.consume("\x1b[A");
        assert_eq!(r.pending_line(), "");
        // recalled line content is unknown, Enter records nothing
        assert!(r.consume("\r").is_empty());
    }

    #[test]
    fn test_cancel_abandons_line() {
        let mut r = LineReconstructor::new();
        r.mark_sensitive_from_output("Password: ");
        r.consume("secret\x03");
        assert!(!r.is_sensitive());
        assert_eq!(r.pending_line(), "");
        assert!(r.consume("\r").is_empty());
    }

    #[test]
    fn test_kill_line_then_enter() {
        let mut r = LineReconstructor::new();
        r.consume("oops\x15");
        assert_eq!(r.pending_line(), "");
        assert!(r.had_printable_input());

        // empty line still commits nothing
        assert!(r.consume("\r").is_empty());
    }

    #[test]
    fn test_typed_scenario() {
        let mut r = LineReconstructor::new();
        let mut history = Vec::new();

        for key in ["c", "d", " ", "/", "t", "m", "p"] {
            history.extend(r.consume(key));
        }
        history.extend(r.consume("\r"));
        assert_eq!(history, vec!["cd /tmp".to_string()]);

        r.mark_sensitive_from_output("[sudo] password for admin: ");
        let mut more = Vec::new();
        for key in ["p", "a", "s", "s", "\r"] {
            more.extend(r.consume(key));
        }
        assert!(more.is_empty());
        assert!(!r.is_sensitive());
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut r = LineReconstructor::new();
        let lines = r.consume("uptime\rfree -m\n\r");
        assert_eq!(lines, vec!["uptime".to_string(), "free -m".to_string()]);
    }

    #[test]
    fn test_non_ascii_cursor_math() {
        let mut r = LineReconstructor::new();
        r.consume("echo привет\x7f");
        assert_eq!(r.pending_line(), "echo приве");
        assert_eq!(r.cursor(), 10);
    }

    #[test]
    fn test_sensitive_patterns() {
        let mut r = LineReconstructor::new();
        r.mark_sensitive_from_output("Введите пароль:");
        assert!(r.is_sensitive());

        let mut r = LineReconstructor::new();
        r.mark_sensitive_from_output("Enter passphrase for key:");
        assert!(r.is_sensitive());

        let mut r = LineReconstructor::new();
        r.mark_sensitive_from_output("total 12\r\n");
        assert!(!r.is_sensitive());
    }
}
