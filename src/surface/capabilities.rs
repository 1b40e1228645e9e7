//! Optional widget extensions and the registry of which ones a host offers

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Extension {
    /// Derive cols/rows from the host size
    Fit,
    Search,
    WebLinks,
    Unicode11,
    Ligatures,
    Clipboard,
    /// Export the buffer as text or HTML
    Serialize,
    /// GPU renderer
    Webgl,
}

impl Extension {
    /// Load order. The GPU renderer goes last so a failure there cannot
    /// leave the others unloaded.
    pub const ALL: [Extension; 8] = [
        Extension::Fit,
        Extension::Search,
        Extension::WebLinks,
        Extension::Unicode11,
        Extension::Ligatures,
        Extension::Clipboard,
        Extension::Serialize,
        Extension::Webgl,
    ];
}

impl std::fmt::Display for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fit => "fit",
            Self::Search => "search",
            Self::WebLinks => "web_links",
            Self::Unicode11 => "unicode11",
            Self::Ligatures => "ligatures",
            Self::Clipboard => "clipboard",
            Self::Serialize => "serialize",
            Self::Webgl => "webgl",
        };
        f.write_str(s)
    }
}

/// Extensions the hosting environment can provide, resolved once when the
/// surface manager is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub fit: bool,
    pub search: bool,
    pub web_links: bool,
    pub unicode11: bool,
    pub ligatures: bool,
    pub clipboard: bool,
    pub serialize: bool,
    pub webgl: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            fit: true,
            search: true,
            web_links: true,
            unicode11: true,
            ligatures: true,
            clipboard: true,
            serialize: true,
            webgl: true,
        }
    }

    pub fn supports(&self, ext: Extension) -> bool {
        match ext {
            Extension::Fit => self.fit,
            Extension::Search => self.search,
            Extension::WebLinks => self.web_links,
            Extension::Unicode11 => self.unicode11,
            Extension::Ligatures => self.ligatures,
            Extension::Clipboard => self.clipboard,
            Extension::Serialize => self.serialize,
            Extension::Webgl => self.webgl,
        }
    }

    /// Supported extensions in load order
    pub fn available(&self) -> Vec<Extension> {
        Extension::ALL
            .into_iter()
            .filter(|ext| self.supports(*ext))
            .collect()
    }
}
