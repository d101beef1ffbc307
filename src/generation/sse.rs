//! Line framing for streamed HTTP bodies (SSE and NDJSON).
//!
//! Network chunks split lines, and sometimes UTF-8 sequences, at arbitrary
//! byte offsets. [`LineBuffer`] keeps the bytes of the unfinished line and
//! only decodes complete lines.

/// Accumulates body bytes and yields complete lines without the trailing
/// `\n` or `\r\n`. Empty lines are dropped.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line they complete.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = decode(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// The unterminated last line, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        decode(&raw)
    }
}

fn decode(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}

/// Payload of an SSE `data:` line, or `None` for other fields
/// (`event:`, `id:`, comments).
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
