//! Headless terminal widget
//!
//! A minimal emulator for hosts without a graphical terminal: output is run
//! through a `vte` parser into a bounded line buffer that supports search,
//! link detection and text/HTML export. Colours and cursor addressing
//! beyond the current line are ignored.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use vte::{Params, Parser, Perform};

use super::capabilities::{Capabilities, Extension};
use super::widget::{
    CellMetrics, HostSurface, SearchMatch, SerializeFormat, SurfaceError, TerminalWidget,
    WidgetEvent, WidgetFactory, WidgetListener, WidgetOptions,
};
use crate::events::KeyEvent;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>]+"#).expect("URL_RE regex pattern is valid")
});

/// Line buffer driven by the vte parser
struct Screen {
    lines: VecDeque<String>,
    current: Vec<char>,
    /// Always below `cols`
    col: usize,
    cols: usize,
    scrollback: usize,
    convert_eol: bool,
}

impl Screen {
    fn new(cols: u16, scrollback: usize, convert_eol: bool) -> Self {
        Self {
            lines: VecDeque::new(),
            current: Vec::new(),
            col: 0,
            cols: usize::from(cols.max(1)),
            scrollback: scrollback.max(1),
            convert_eol,
        }
    }

    fn newline(&mut self) {
        let line: String = self.current.iter().collect();
        self.lines.push_back(line.trim_end().to_string());
        while self.lines.len() > self.scrollback {
            self.lines.pop_front();
        }
        self.current.clear();
        if !self.convert_eol {
            // Line feed alone keeps the column
            self.current.resize(self.col, ' ');
        } else {
            self.col = 0;
        }
    }

    fn move_to(&mut self, col: usize) {
        self.col = col.min(self.cols - 1);
    }

    fn set_cols(&mut self, cols: u16) {
        self.cols = usize::from(cols.max(1));
        self.current.truncate(self.cols);
        self.move_to(self.col);
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.current.clear();
        self.col = 0;
    }

    /// All lines including the one being written
    fn snapshot(&self) -> Vec<String> {
        let mut out: Vec<String> = self.lines.iter().cloned().collect();
        let current: String = self.current.iter().collect();
        let current = current.trim_end();
        if !current.is_empty() {
            out.push(current.to_string());
        }
        out
    }
}

impl Perform for Screen {
    fn print(&mut self, c: char) {
        if self.col < self.current.len() {
            self.current[self.col] = c;
        } else {
            self.current.resize(self.col, ' ');
            self.current.push(c);
        }
        // No autowrap: the last column is overwritten
        self.move_to(self.col + 1);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            b'\x08' => self.col = self.col.saturating_sub(1),
            b'\t' => self.move_to((self.col / 8 + 1) * 8),
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, _intermediates: &[u8], _ignore: bool, c: char) {
        let first = params
            .iter()
            .next()
            .and_then(|p| p.first().copied())
            .unwrap_or(0) as usize;

        match c {
            // Erase in line (to end only)
            'K' if first == 0 => self.current.truncate(self.col),
            'K' if first == 2 => self.current.clear(),
            'J' if first >= 2 => self.clear(),
            'C' => self.move_to(self.col.saturating_add(first.max(1))),
            'D' => self.col = self.col.saturating_sub(first.max(1)),
            'G' => self.move_to(first.saturating_sub(1)),
            _ => {}
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub struct HeadlessWidget {
    parser: Parser,
    screen: Screen,
    cols: u16,
    rows: u16,
    font_size: u16,
    cursor_blink: bool,
    mounted_on: Option<String>,
    loaded: BTreeSet<Extension>,
    listener: Arc<Mutex<Option<WidgetListener>>>,
    disposed: bool,
}

impl HeadlessWidget {
    fn new(options: &WidgetOptions, listener: Arc<Mutex<Option<WidgetListener>>>) -> Self {
        Self {
            parser: Parser::new(),
            screen: Screen::new(options.cols, options.scrollback, options.convert_eol),
            cols: options.cols.max(1),
            rows: options.rows.max(1),
            font_size: options.font_size,
            cursor_blink: options.cursor_blink,
            mounted_on: None,
            loaded: BTreeSet::new(),
            listener,
            disposed: false,
        }
    }

    fn emit(&self, event: WidgetEvent) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    pub fn font_size(&self) -> u16 {
        self.font_size
    }

    pub fn cursor_blink(&self) -> bool {
        self.cursor_blink
    }
}

impl TerminalWidget for HeadlessWidget {
    fn open(&mut self, host: &HostSurface) -> Result<(), SurfaceError> {
        if self.disposed {
            return Err(SurfaceError::Disposed);
        }
        self.mounted_on = Some(host.id().to_string());
        Ok(())
    }

    fn write(&mut self, data: &str) {
        if self.disposed {
            return;
        }
        self.parser.advance(&mut self.screen, data.as_bytes());
    }

    fn clear(&mut self) {
        self.screen.clear();
    }

    fn focus(&mut self) {}

    fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        if (cols, rows) == (self.cols, self.rows) {
            return;
        }
        self.cols = cols;
        self.rows = rows;
        self.screen.set_cols(cols);
        self.emit(WidgetEvent::Resize { cols, rows });
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    fn cell_metrics(&self) -> CellMetrics {
        // Rough monospace proportions
        let size = self.font_size.max(1) as f64;
        CellMetrics {
            width_px: (size * 0.6).max(1.0),
            height_px: (size * 1.2).max(1.0),
        }
    }

    fn set_font_size(&mut self, size: u16) {
        self.font_size = size;
    }

    fn set_cursor_blink(&mut self, blink: bool) {
        self.cursor_blink = blink;
    }

    fn set_convert_eol(&mut self, convert: bool) {
        self.screen.convert_eol = convert;
    }

    fn load_extension(&mut self, ext: Extension) -> Result<(), SurfaceError> {
        if !HeadlessFactory::CAPABILITIES.supports(ext) {
            return Err(SurfaceError::ExtensionFailed(
                ext,
                "not supported by the headless widget".to_string(),
            ));
        }
        self.loaded.insert(ext);
        Ok(())
    }

    fn unload_extension(&mut self, ext: Extension) {
        self.loaded.remove(&ext);
    }

    fn serialize(&self, format: SerializeFormat) -> String {
        let lines = self.screen.snapshot();
        match format {
            SerializeFormat::Text => lines.join("\n"),
            SerializeFormat::Html => {
                let body: Vec<String> = lines.iter().map(|l| escape_html(l)).collect();
                format!("<pre>{}</pre>", body.join("\n"))
            }
        }
    }

    fn find(&self, query: &str) -> Vec<SearchMatch> {
        if query.is_empty() {
            return Vec::new();
        }
        let Ok(re) = RegexBuilder::new(&regex::escape(query))
            .case_insensitive(true)
            .build()
        else {
            return Vec::new();
        };

        self.screen
            .snapshot()
            .iter()
            .enumerate()
            .flat_map(|(line, text)| {
                re.find_iter(text)
                    .map(|m| SearchMatch {
                        line,
                        column: text[..m.start()].chars().count(),
                        text: m.as_str().to_string(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn links(&self) -> Vec<String> {
        self.screen
            .snapshot()
            .iter()
            .flat_map(|line| {
                URL_RE
                    .find_iter(line)
                    .map(|m| m.as_str().to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn set_listener(&mut self, listener: Option<WidgetListener>) {
        *self.listener.lock() = listener;
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.loaded.clear();
        self.mounted_on = None;
        *self.listener.lock() = None;
        self.screen.clear();
    }
}

/// Creates [`HeadlessWidget`]s and hands out [`HeadlessInput`] handles that
/// play the role of the user's keyboard
#[derive(Default)]
pub struct HeadlessFactory {
    listener: Arc<Mutex<Option<WidgetListener>>>,
}

impl HeadlessFactory {
    pub const CAPABILITIES: Capabilities = Capabilities {
        fit: true,
        search: true,
        web_links: true,
        unicode11: true,
        ligatures: false,
        clipboard: false,
        serialize: true,
        webgl: false,
    };

    pub fn new() -> Self {
        Self::default()
    }

    /// Input handle for the widget most recently created by this factory
    pub fn input(&self) -> HeadlessInput {
        HeadlessInput {
            listener: self.listener.clone(),
        }
    }
}

impl WidgetFactory for HeadlessFactory {
    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }

    fn create(&self, options: &WidgetOptions) -> Result<Box<dyn TerminalWidget>, SurfaceError> {
        Ok(Box::new(HeadlessWidget::new(options, self.listener.clone())))
    }
}

/// Feeds keystrokes into a headless widget as if typed by the user
#[derive(Clone)]
pub struct HeadlessInput {
    listener: Arc<Mutex<Option<WidgetListener>>>,
}

impl HeadlessInput {
    /// Report `text` as one input chunk, with a key event per char
    pub fn type_text(&self, text: &str) {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            tracing::debug!("Headless input dropped: no widget listening");
            return;
        };

        for c in text.chars() {
            listener(WidgetEvent::Key(KeyEvent::plain(c.to_string())));
        }
        listener(WidgetEvent::Data(text.to_string()));
    }

    pub fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }
}
