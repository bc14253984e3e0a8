use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a single stream entry: a millisecond timestamp and a
/// per-millisecond sequence number. Ordering is numeric on `(ms, seq)`;
/// IDs are never compared as strings.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    /// `0-0`: never a valid entry ID, but a valid range bound and cursor.
    pub const ZERO: StreamEntryId = StreamEntryId { ms: 0, seq: 0 };

    /// The greatest representable ID, used as the open upper range bound.
    pub const MAX: StreamEntryId = StreamEntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parse `<ms>-<seq>`. A bare `<ms>` gets `default_seq` as its sequence,
    /// which lets range bounds default differently at each end.
    pub fn parse(text: &str, default_seq: u64) -> Option<Self> {
        match text.split_once('-') {
            Some((ms, seq)) => Some(Self {
                ms: ms.parse().ok()?,
                seq: seq.parse().ok()?,
            }),
            None => Some(Self {
                ms: text.parse().ok()?,
                seq: default_seq,
            }),
        }
    }
}

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// A single entry in a stream: the assigned ID plus insertion-ordered
/// field/value pairs. Field names may repeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
}
