/// Accumulates raw stdout bytes and splits them into NDJSON lines, with a
/// hard cap on how long a single line may grow.
///
/// When the cap is exceeded the pending bytes are dropped, one `Overflow`
/// event is emitted, and input is discarded until the next newline so the
/// stream re-synchronizes on the following line.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
    discarding: bool,
}

/// One outcome of feeding bytes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(String),
    Overflow { limit: usize },
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        LineBuffer {
            buf: Vec::new(),
            limit,
            discarding: false,
        }
    }

    /// Feed a chunk; returns the complete lines (and at most one overflow
    /// per oversized line) it produced, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LineEvent> {
        let mut events = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    // Tail of an oversized line; drop it and resume.
                    self.discarding = false;
                } else {
                    let line = String::from_utf8_lossy(&self.buf).into_owned();
                    self.buf.clear();
                    if !line.trim().is_empty() {
                        events.push(LineEvent::Line(line));
                    }
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            self.buf.push(byte);
            if self.buf.len() > self.limit {
                self.buf.clear();
                self.discarding = true;
                events.push(LineEvent::Overflow { limit: self.limit });
            }
        }

        events
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
