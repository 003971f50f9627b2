//! Clipboard access
//!
//! The native system clipboard is tried first. When it is unavailable (no
//! display server, headless session) the text is pushed through the terminal
//! instead, using the OSC 52 selection escape.

use base64::Engine;
use parking_lot::Mutex;
use std::io::Write;
use thiserror::Error;
use tracing::debug;

/// Clipboard errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClipboardError {
    /// The backend cannot be used here
    #[error("Clipboard unavailable: {0}")]
    Unavailable(String),

    /// The backend accepted the request but failed
    #[error("Clipboard write failed: {0}")]
    WriteFailed(String),
}

/// Somewhere text can be copied to
#[cfg_attr(test, mockall::automock)]
pub trait ClipboardBackend: Send + Sync {
    /// Short backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Replace the clipboard contents
    fn set_text(&self, text: &str) -> Result<(), ClipboardError>;
}

/// System clipboard via `arboard`
#[derive(Debug, Default)]
pub struct NativeClipboard;

impl ClipboardBackend for NativeClipboard {
    fn name(&self) -> &'static str {
        "native"
    }

    fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        clipboard
            .set_text(text.to_owned())
            .map_err(|e| ClipboardError::WriteFailed(e.to_string()))
    }
}

/// Terminal selection clipboard (OSC 52)
pub struct SelectionClipboard {
    out: Mutex<Box<dyn Write + Send>>,
    require_tty: bool,
}

impl SelectionClipboard {
    /// Write escapes to stdout; refuses when stdout is not a terminal
    pub fn stdout() -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::stdout())),
            require_tty: true,
        }
    }

    /// Write escapes to any sink
    pub fn with_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
            require_tty: false,
        }
    }
}

impl ClipboardBackend for SelectionClipboard {
    fn name(&self) -> &'static str {
        "selection"
    }

    fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        if self.require_tty && !atty::is(atty::Stream::Stdout) {
            return Err(ClipboardError::Unavailable("stdout is not a terminal".into()));
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        let mut out = self.out.lock();
        write!(out, "\x1b]52;c;{encoded}\x07")
            .and_then(|()| out.flush())
            .map_err(|e| ClipboardError::WriteFailed(e.to_string()))
    }
}

/// Copy with `primary`, falling back to `fallback`
///
/// Returns the name of the backend that took the text.
pub fn copy_with_fallback(
    text: &str,
    primary: &dyn ClipboardBackend,
    fallback: &dyn ClipboardBackend,
) -> Result<&'static str, ClipboardError> {
    match primary.set_text(text) {
        Ok(()) => Ok(primary.name()),
        Err(first) => {
            debug!("{} clipboard failed ({}), trying {}", primary.name(), first, fallback.name());
            fallback.set_text(text).map(|()| fallback.name()).map_err(|second| {
                ClipboardError::Unavailable(format!(
                    "{}: {}; {}: {}",
                    primary.name(),
                    first,
                    fallback.name(),
                    second
                ))
            })
        }
    }
}
