//! The in-memory keyspace: byte-string keys mapped to typed values with
//! lazy per-key expiration. Strings may expire; streams never do.

pub mod stream;

use std::collections::HashMap;

use ferrite_common::stream::{StreamEntry, StreamEntryId};
use thiserror::Error;

pub use stream::{RequestedId, Stream, StreamIdError};

/// A stored value.
#[derive(Debug)]
pub enum Value {
    String {
        data: Vec<u8>,
        /// Absolute wall-clock expiry in milliseconds, or None for never.
        expires_at: Option<u64>,
    },
    Stream(Stream),
}

/// What TYPE reports for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Stream,
    None,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Stream => "stream",
            ValueKind::None => "none",
        }
    }
}

/// Expiry requested by a write, either absolute or relative to now.
#[derive(Clone, Copy, Debug)]
pub enum Expiry {
    AtMs(u64),
    InMs(u64),
}

impl Expiry {
    fn resolve(self, now_ms: u64) -> u64 {
        match self {
            Expiry::AtMs(at) => at,
            Expiry::InMs(after) => now_ms.saturating_add(after),
        }
    }
}

/// Operation against a key holding the wrong kind of value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
pub struct WrongTypeError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XaddError {
    #[error(transparent)]
    Id(#[from] StreamIdError),

    #[error(transparent)]
    WrongType(#[from] WrongTypeError),
}

#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<Vec<u8>, Value>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (expired-but-unobserved keys count until reaped).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upsert a string value. Replaces any existing value, stream included.
    pub fn set(&mut self, key: Vec<u8>, data: Vec<u8>, expiry: Option<Expiry>, now_ms: u64) {
        let expires_at = expiry.map(|e| e.resolve(now_ms));
        self.entries.insert(key, Value::String { data, expires_at });
    }

    /// The string value of `key`, or None if absent, expired, or a stream.
    pub fn get(&mut self, key: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        self.reap_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn kind(&mut self, key: &[u8], now_ms: u64) -> ValueKind {
        self.reap_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String { .. }) => ValueKind::String,
            Some(Value::Stream(_)) => ValueKind::Stream,
            None => ValueKind::None,
        }
    }

    /// All live keys. Expired strings observed during the sweep are reaped.
    pub fn keys(&mut self, now_ms: u64) -> Vec<Vec<u8>> {
        let before = self.entries.len();
        self.entries.retain(|_, value| !is_expired(value, now_ms));
        let reaped = before - self.entries.len();
        if reaped > 0 {
            metrics::counter!("keyspace.expired").increment(reaped as u64);
        }
        self.entries.keys().cloned().collect()
    }

    /// Append to the stream at `key`, creating it if absent.
    pub fn xadd(
        &mut self,
        key: &[u8],
        requested: RequestedId,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        now_ms: u64,
    ) -> Result<StreamEntryId, XaddError> {
        self.reap_if_expired(key, now_ms);
        let value = self
            .entries
            .entry(key.to_vec())
            .or_insert_with(|| Value::Stream(Stream::new()));
        match value {
            Value::Stream(stream) => Ok(stream.append(requested, fields, now_ms)?),
            Value::String { .. } => Err(WrongTypeError.into()),
        }
    }

    /// Entries with `start <= id <= end`. A missing key is an empty stream.
    pub fn xrange(
        &mut self,
        key: &[u8],
        start: StreamEntryId,
        end: StreamEntryId,
        now_ms: u64,
    ) -> Result<Vec<StreamEntry>, WrongTypeError> {
        self.reap_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Stream(stream)) => Ok(stream.range(start, end)),
            Some(Value::String { .. }) => Err(WrongTypeError),
            None => Ok(Vec::new()),
        }
    }

    /// For each `(key, after)` query, the entries with `id > after`.
    /// Keys with nothing new (or not holding a stream) are omitted.
    pub fn xread_after(
        &self,
        queries: &[(Vec<u8>, StreamEntryId)],
    ) -> Vec<(Vec<u8>, Vec<StreamEntry>)> {
        let mut results = Vec::new();
        for (key, after) in queries {
            if let Some(Value::Stream(stream)) = self.entries.get(key) {
                let entries = stream.entries_after(*after);
                if !entries.is_empty() {
                    results.push((key.clone(), entries));
                }
            }
        }
        results
    }

    /// Last entry ID of the stream at `key`, used for `$` substitution.
    pub fn last_stream_id(&self, key: &[u8]) -> Option<StreamEntryId> {
        match self.entries.get(key) {
            Some(Value::Stream(stream)) => stream.last_id(),
            _ => None,
        }
    }

    fn reap_if_expired(&mut self, key: &[u8], now_ms: u64) {
        if let Some(value) = self.entries.get(key) {
            if is_expired(value, now_ms) {
                self.entries.remove(key);
                metrics::counter!("keyspace.expired").increment(1);
            }
        }
    }
}

fn is_expired(value: &Value, now_ms: u64) -> bool {
    match value {
        Value::String {
            expires_at: Some(at),
            ..
        } => *at <= now_ms,
        _ => false,
    }
}
