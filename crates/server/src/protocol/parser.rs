//! Incremental RESP request framing over a growing byte buffer.
//!
//! The buffer is fed arbitrary chunks as they arrive from the socket; the
//! parser frames zero or more complete request arrays per attempt and keeps
//! the unconsumed tail for the next read. Truncation is never an error;
//! only structural violations inside an otherwise complete frame are.

use thiserror::Error;

/// A single framed request: the argument byte vectors plus the exact raw
/// bytes consumed from the wire. Propagation and offset accounting use the
/// received bytes, never a re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub args: Vec<Vec<u8>>,
    pub raw: Vec<u8>,
}

impl Request {
    /// The command verb, uppercased. Empty for a request with no arguments.
    pub fn verb(&self) -> String {
        self.args
            .first()
            .map(|a| String::from_utf8_lossy(a).to_uppercase())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("expected '{expected}' marker, found '{found}'")]
    UnexpectedMarker { expected: char, found: char },

    #[error("invalid length in frame header")]
    BadLength,

    #[error("bulk payload not terminated by CRLF")]
    MissingTerminator,
}

/// Incremental parser with rollback-on-partial semantics.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
    pos: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Attempt to frame one complete request array (`*N` followed by `N`
    /// bulk strings). On partial input the cursor rolls back and `Ok(None)`
    /// is returned; feed more bytes and retry.
    pub fn next_request(&mut self) -> Result<Option<Request>, FrameError> {
        let start = self.pos;
        match self.try_parse_request() {
            Ok(Some(args)) => {
                let raw = self.buf[start..self.pos].to_vec();
                self.compact();
                Ok(Some(Request { args, raw }))
            }
            Ok(None) => {
                self.pos = start;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Frame one simple-string line (`+...\r\n`). Used by the follower
    /// handshake to read `+PONG`, `+OK` and `+FULLRESYNC ...`.
    pub fn next_simple_line(&mut self) -> Result<Option<String>, FrameError> {
        let start = self.pos;
        match self.take_line() {
            Some(line) => {
                if line.first() != Some(&b'+') {
                    self.pos = start;
                    return Err(unexpected(b'+', &line));
                }
                let text = String::from_utf8_lossy(&line[1..]).into_owned();
                self.compact();
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    /// Frame an RDB payload: `$<len>\r\n<bytes>` with no trailing CRLF.
    pub fn next_rdb_payload(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let start = self.pos;
        let header = match self.take_line() {
            Some(h) => h,
            None => return Ok(None),
        };
        if header.first() != Some(&b'$') {
            self.pos = start;
            return Err(unexpected(b'$', &header));
        }
        let len = parse_length(&header[1..])?;
        if self.pending() < len {
            self.pos = start;
            return Ok(None);
        }
        let data = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        self.compact();
        Ok(Some(data))
    }

    fn try_parse_request(&mut self) -> Result<Option<Vec<Vec<u8>>>, FrameError> {
        let header = match self.take_line() {
            Some(h) => h,
            None => return Ok(None),
        };
        // Inline (non-array) commands are not supported.
        if header.first() != Some(&b'*') {
            return Err(unexpected(b'*', &header));
        }
        let count = parse_length(&header[1..])?;
        if count == 0 {
            return Err(FrameError::BadLength);
        }
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            match self.take_bulk()? {
                Some(arg) => args.push(arg),
                None => return Ok(None),
            }
        }
        Ok(Some(args))
    }

    fn take_bulk(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let header = match self.take_line() {
            Some(h) => h,
            None => return Ok(None),
        };
        if header.first() != Some(&b'$') {
            return Err(unexpected(b'$', &header));
        }
        let len = parse_length(&header[1..])?;
        if self.pending() < len + 2 {
            return Ok(None);
        }
        let data = self.buf[self.pos..self.pos + len].to_vec();
        if &self.buf[self.pos + len..self.pos + len + 2] != b"\r\n" {
            return Err(FrameError::MissingTerminator);
        }
        self.pos += len + 2;
        Ok(Some(data))
    }

    /// Take one CRLF-terminated line, excluding the terminator.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let hay = &self.buf[self.pos..];
        let at = hay.windows(2).position(|w| w == b"\r\n")?;
        let line = hay[..at].to_vec();
        self.pos += at + 2;
        Some(line)
    }

    /// Drop the consumed prefix, retaining the unconsumed tail.
    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

fn parse_length(digits: &[u8]) -> Result<usize, FrameError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(FrameError::BadLength)
}

fn unexpected(expected: u8, line: &[u8]) -> FrameError {
    FrameError::UnexpectedMarker {
        expected: expected as char,
        found: line.first().copied().unwrap_or(b'?') as char,
    }
}
