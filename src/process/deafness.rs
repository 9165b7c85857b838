/// Longest partial line kept between chunks; anything longer cannot be the sentinel
const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Scans a child's standard output for the line announcing it went deaf
///
/// Matching is exact and whole-line: the sentinel must be the complete
/// content of a line (a trailing `\r` is ignored). Chunks may split lines
/// anywhere; the unterminated tail of a chunk is carried over to the next
/// one. The detector fires at most once.
#[derive(Debug)]
pub struct SentinelDetector {
    sentinel: Vec<u8>,
    partial: Vec<u8>,
    overflowed: bool,
    triggered: bool,
}

impl SentinelDetector {
    pub fn new(sentinel: &str) -> Self {
        Self {
            sentinel: sentinel.as_bytes().to_vec(),
            partial: Vec::new(),
            overflowed: false,
            triggered: false,
        }
    }

    /// Feed a chunk of output
    ///
    /// Returns `true` only for the chunk that completes the first sentinel line.
    pub fn scan(&mut self, chunk: &[u8]) -> bool {
        if self.triggered {
            return false;
        }

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            let matched = if self.partial.is_empty() && !self.overflowed {
                self.is_sentinel(line)
            } else {
                let overflowed = self.overflowed;
                self.partial.extend_from_slice(line);
                let matched = !overflowed && self.is_sentinel(&self.partial);
                self.partial.clear();
                self.overflowed = false;
                matched
            };

            if matched {
                self.triggered = true;
                self.partial.clear();
                return true;
            }
        }

        self.keep_partial(rest);
        false
    }

    /// Signal end of stream; an unterminated final line still counts
    pub fn finish(&mut self) -> bool {
        if self.triggered || self.overflowed || self.partial.is_empty() {
            self.partial.clear();
            return false;
        }

        let partial = std::mem::take(&mut self.partial);
        if self.is_sentinel(&partial) {
            self.triggered = true;
            return true;
        }

        false
    }

    fn keep_partial(&mut self, bytes: &[u8]) {
        if self.overflowed || bytes.is_empty() {
            return;
        }

        if self.partial.len() + bytes.len() > MAX_PARTIAL_LINE {
            self.partial.clear();
            self.overflowed = true;
        } else {
            self.partial.extend_from_slice(bytes);
        }
    }

    fn is_sentinel(&self, line: &[u8]) -> bool {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        line == self.sentinel.as_slice()
    }
}
