use ferrite_common::stream::{StreamEntry, StreamEntryId};
use thiserror::Error;

/// How an XADD names the entry it is appending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedId {
    /// `*`: current wall-clock milliseconds, auto sequence.
    Auto,
    /// `<ms>-*`: fixed milliseconds, auto sequence.
    AutoSeq(u64),
    /// `<ms>-<seq>`: fully explicit.
    Explicit(StreamEntryId),
}

impl RequestedId {
    pub fn parse(text: &str) -> Option<Self> {
        if text == "*" {
            return Some(Self::Auto);
        }
        match text.split_once('-') {
            Some((ms, "*")) => Some(Self::AutoSeq(ms.parse().ok()?)),
            _ => StreamEntryId::parse(text, 0).map(Self::Explicit),
        }
    }
}

/// XADD rejections. The Display text is the wire error verbatim.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamIdError {
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    NotGreaterThanZero,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    SmallerThanTop,
}

/// An append-only stream. Entry IDs are strictly increasing in numeric
/// `(ms, seq)` order; `0-0` is never stored.
#[derive(Debug, Default)]
pub struct Stream {
    entries: Vec<StreamEntry>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> Option<StreamEntryId> {
        self.entries.last().map(|e| e.id)
    }

    /// Arbitrate the requested ID against the stream top and append.
    pub fn append(
        &mut self,
        requested: RequestedId,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        now_ms: u64,
    ) -> Result<StreamEntryId, StreamIdError> {
        let id = self.arbitrate(requested, now_ms)?;
        self.entries.push(StreamEntry { id, fields });
        Ok(id)
    }

    fn arbitrate(
        &self,
        requested: RequestedId,
        now_ms: u64,
    ) -> Result<StreamEntryId, StreamIdError> {
        match requested {
            RequestedId::Auto => self.arbitrate(RequestedId::AutoSeq(now_ms), now_ms),
            RequestedId::AutoSeq(ms) => match self.last_id() {
                None => {
                    // 0-0 is reserved, so an empty stream starts at 0-1.
                    let seq = if ms == 0 { 1 } else { 0 };
                    Ok(StreamEntryId::new(ms, seq))
                }
                Some(last) => {
                    if ms < last.ms {
                        Err(StreamIdError::SmallerThanTop)
                    } else if ms == last.ms {
                        Ok(StreamEntryId::new(ms, last.seq + 1))
                    } else {
                        Ok(StreamEntryId::new(ms, 0))
                    }
                }
            },
            RequestedId::Explicit(id) => {
                if id == StreamEntryId::ZERO {
                    return Err(StreamIdError::NotGreaterThanZero);
                }
                if let Some(last) = self.last_id() {
                    if id <= last {
                        return Err(StreamIdError::SmallerThanTop);
                    }
                }
                Ok(id)
            }
        }
    }

    /// Entries with `start <= id <= end`, in order.
    pub fn range(&self, start: StreamEntryId, end: StreamEntryId) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|e| e.id >= start && e.id <= end)
            .cloned()
            .collect()
    }

    /// Entries with `id > after`, in order.
    pub fn entries_after(&self, after: StreamEntryId) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(name: &str, value: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![(name.as_bytes().to_vec(), value.as_bytes().to_vec())]
    }

    #[test]
    fn test_requested_id_parse() {
        assert_eq!(RequestedId::parse("*"), Some(RequestedId::Auto));
        assert_eq!(RequestedId::parse("5-*"), Some(RequestedId::AutoSeq(5)));
        assert_eq!(
            RequestedId::parse("5-3"),
            Some(RequestedId::Explicit(StreamEntryId::new(5, 3)))
        );
        assert_eq!(
            RequestedId::parse("7"),
            Some(RequestedId::Explicit(StreamEntryId::new(7, 0)))
        );
        assert_eq!(RequestedId::parse("x-*"), None);
        assert_eq!(RequestedId::parse("-"), None);
    }

    #[test]
    fn test_auto_seq_on_empty_stream() {
        let mut stream = Stream::new();
        let id = stream
            .append(RequestedId::AutoSeq(5), fields("a", "1"), 0)
            .unwrap();
        assert_eq!(id, StreamEntryId::new(5, 0));

        let mut zero = Stream::new();
        let id = zero
            .append(RequestedId::AutoSeq(0), fields("a", "1"), 0)
            .unwrap();
        assert_eq!(id, StreamEntryId::new(0, 1));
    }

    #[test]
    fn test_auto_seq_increments_within_same_ms() {
        let mut stream = Stream::new();
        stream
            .append(RequestedId::AutoSeq(5), fields("a", "1"), 0)
            .unwrap();
        let id = stream
            .append(RequestedId::AutoSeq(5), fields("b", "2"), 0)
            .unwrap();
        assert_eq!(id, StreamEntryId::new(5, 1));

        // A later ms resets the sequence.
        let id = stream
            .append(RequestedId::AutoSeq(7), fields("c", "3"), 0)
            .unwrap();
        assert_eq!(id, StreamEntryId::new(7, 0));

        // An earlier ms is a regression.
        assert_eq!(
            stream.append(RequestedId::AutoSeq(4), fields("d", "4"), 0),
            Err(StreamIdError::SmallerThanTop)
        );
    }

    #[test]
    fn test_explicit_rejections() {
        let mut stream = Stream::new();
        assert_eq!(
            stream.append(
                RequestedId::Explicit(StreamEntryId::ZERO),
                fields("a", "1"),
                0
            ),
            Err(StreamIdError::NotGreaterThanZero)
        );

        stream
            .append(RequestedId::Explicit(StreamEntryId::new(5, 5)), fields("a", "1"), 0)
            .unwrap();
        assert_eq!(
            stream.append(
                RequestedId::Explicit(StreamEntryId::new(5, 5)),
                fields("b", "2"),
                0
            ),
            Err(StreamIdError::SmallerThanTop)
        );
        assert_eq!(
            stream.append(
                RequestedId::Explicit(StreamEntryId::new(4, 9)),
                fields("b", "2"),
                0
            ),
            Err(StreamIdError::SmallerThanTop)
        );
    }

    #[test]
    fn test_full_auto_uses_clock() {
        let mut stream = Stream::new();
        let id = stream
            .append(RequestedId::Auto, fields("a", "1"), 1526919030474)
            .unwrap();
        assert_eq!(id, StreamEntryId::new(1526919030474, 0));
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut stream = Stream::new();
        stream.append(RequestedId::AutoSeq(1), fields("a", "1"), 0).unwrap();
        stream.append(RequestedId::AutoSeq(1), fields("b", "2"), 0).unwrap();
        stream.append(RequestedId::AutoSeq(2), fields("c", "3"), 0).unwrap();
        stream
            .append(RequestedId::Explicit(StreamEntryId::new(9, 9)), fields("d", "4"), 0)
            .unwrap();

        let all = stream.range(StreamEntryId::ZERO, StreamEntryId::MAX);
        for pair in all.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[test]
    fn test_range_and_after() {
        let mut stream = Stream::new();
        for ms in 1..=5 {
            stream.append(RequestedId::AutoSeq(ms), fields("n", "v"), 0).unwrap();
        }

        let mid = stream.range(StreamEntryId::new(2, 0), StreamEntryId::new(4, 0));
        assert_eq!(mid.len(), 3);
        assert_eq!(mid[0].id, StreamEntryId::new(2, 0));
        assert_eq!(mid[2].id, StreamEntryId::new(4, 0));

        let tail = stream.entries_after(StreamEntryId::new(3, 0));
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, StreamEntryId::new(4, 0));
    }
}
