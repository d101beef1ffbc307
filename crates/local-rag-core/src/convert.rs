//! Document conversion trait and text normalization.
//!
//! A [`DocumentConverter`] turns a source file into markdown-like text.
//! Conversion is synchronous and may be CPU heavy; async callers run it on
//! a blocking worker.

use std::path::Path;

use crate::error::ConversionError;

/// Converts a source document into normalized markdown-like text.
pub trait DocumentConverter: Send + Sync {
    /// Read and convert the file at `path`.
    ///
    /// Fails with [`ConversionError`] on unsupported or corrupt input. An
    /// empty document is not an error: it converts to an empty string.
    fn convert(&self, path: &Path) -> Result<String, ConversionError>;
}

/// Normalize converted text so chunk boundaries are predictable.
///
/// - `\r\n` and lone `\r` become `\n`
/// - trailing whitespace is stripped from every line
/// - runs of blank lines collapse to a single blank line
/// - leading and trailing whitespace is trimmed
///
/// ```rust
/// use local_rag_core::convert::normalize_text;
///
/// assert_eq!(normalize_text("# Title  \r\n\r\n\r\n\r\nBody\t\n"), "# Title\n\nBody");
/// ```
pub fn normalize_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;

    for line in unified.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}
