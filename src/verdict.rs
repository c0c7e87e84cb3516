use crate::line::LineEvent;

/// Default success marker: the last line of output must be exactly this.
pub const DEFAULT_SENTINEL: &str = "OK";

/// Pass/fail outcome of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

impl Verdict {
    /// Judge a run by the last line it emitted across both streams.
    ///
    /// No output at all is a failure.
    pub fn from_last_line(last: Option<&LineEvent>, sentinel: &str) -> Self {
        match last {
            Some(line) if line.text == sentinel => Verdict::Success,
            _ => Verdict::Failure,
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Verdict::Success => 0,
            Verdict::Failure => 1,
        }
    }
}
