//! Line framing for streamed backend responses
//!
//! Backends stream either server-sent events (`data: {...}` lines) or
//! newline-delimited JSON. Both arrive as arbitrary byte chunks that have to
//! be reassembled into lines first.

/// How a backend frames its streamed response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `data: <payload>` lines, optionally terminated by a sentinel payload
    Sse {
        /// Payload that marks the end of the stream (e.g. `[DONE]`)
        sentinel: Option<&'static str>,
    },
    /// One JSON document per line
    Ndjson,
}

/// A unit extracted from one framed line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// JSON payload to hand to the backend parser
    Data(&'a str),
    /// End-of-stream sentinel
    Done,
    /// Blank line, comment, or SSE field other than `data`
    Skip,
}

impl Framing {
    /// Classify one line
    #[must_use]
    pub fn frame(self, line: &str) -> Frame<'_> {
        let line = line.trim_end_matches('\r');
        match self {
            Self::Sse { sentinel } => {
                let Some(data) = line.strip_prefix("data:") else {
                    return Frame::Skip;
                };
                let data = data.trim_start();
                if sentinel == Some(data) {
                    Frame::Done
                } else if data.is_empty() {
                    Frame::Skip
                } else {
                    Frame::Data(data)
                }
            }
            Self::Ndjson => {
                let line = line.trim();
                if line.is_empty() {
                    Frame::Skip
                } else {
                    Frame::Data(line)
                }
            }
        }
    }
}

/// Reassembles newline-terminated lines from arbitrary byte chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line they complete
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    /// Take the trailing unterminated line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
