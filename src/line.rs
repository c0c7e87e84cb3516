/// Byte-to-line framing for one captured stream.
///
/// Bytes are split on `\n` before any decoding happens, so a bad UTF-8
/// sequence can never shift a line boundary. Each completed line loses one
/// trailing `\r` (ptys translate `\n` to `\r\n` on output) and is decoded
/// lossily.
use std::fmt;

const DELIMITER: u8 = b'\n';

/// Which of the child's output streams a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTag::Stdout => f.write_str("stdout"),
            StreamTag::Stderr => f.write_str("stderr"),
        }
    }
}

/// One completed, decoded line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub text: String,
    pub stream: StreamTag,
    /// Position in the combined emission order. Assigned by the supervisor;
    /// zero until then.
    pub seq: u64,
}

/// Stateful line decoder. Holds the undelimited tail of everything fed so far.
#[derive(Debug)]
pub struct LineAssembler {
    stream: StreamTag,
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new(stream: StreamTag) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    /// Feed a chunk of bytes and return every line it completes, in order.
    ///
    /// An empty chunk means the stream has closed. Whatever partial line is
    /// still pending at that point is discarded rather than emitted, and the
    /// buffer is reset.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<LineEvent> {
        if bytes.is_empty() {
            if !self.pending.is_empty() {
                tracing::debug!(
                    stream = %self.stream,
                    dropped_bytes = self.pending.len(),
                    "discarding unterminated tail on stream close"
                );
                self.pending.clear();
            }
            return Vec::new();
        }

        self.pending.extend_from_slice(bytes);

        let Some(last_delim) = self.pending.iter().rposition(|&b| b == DELIMITER) else {
            return Vec::new();
        };

        let tail = self.pending.split_off(last_delim + 1);
        let complete = std::mem::replace(&mut self.pending, tail);

        complete[..last_delim]
            .split(|&b| b == DELIMITER)
            .map(|raw| self.decode(raw))
            .collect()
    }

    /// Bytes currently held back waiting for a delimiter.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    fn decode(&self, raw: &[u8]) -> LineEvent {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);
        if let std::borrow::Cow::Owned(_) = text {
            tracing::debug!(stream = %self.stream, "replaced invalid UTF-8 in line");
        }
        LineEvent {
            text: text.into_owned(),
            stream: self.stream,
            seq: 0,
        }
    }
}
