//! Read-only parser for the subset of the RDB snapshot format needed to
//! bootstrap the keyspace: string values, expiry opcodes, aux fields, and
//! the length/string encodings. The trailing checksum is not validated.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::keyspace::{Expiry, Keyspace};

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0x00;

/// The canonical empty snapshot a leader sends to a freshly attached
/// replica during FULLRESYNC.
const EMPTY_RDB_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a7265\
6469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d\
62617365c000fff06e3bfec0ff5aa2";

/// Decode the embedded empty snapshot.
pub fn empty_rdb() -> Vec<u8> {
    decode_hex(EMPTY_RDB_HEX)
}

fn decode_hex(hex: &str) -> Vec<u8> {
    debug_assert!(hex.len() % 2 == 0);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let high = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
            let low = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
            (high << 4) | low
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum RdbError {
    #[error("not an RDB file (bad magic)")]
    BadMagic,

    #[error("truncated dump")]
    Truncated,

    #[error("unsupported value type {0:#04x}")]
    UnsupportedValueType(u8),

    #[error("unsupported string format code {0}")]
    UnsupportedFormat(u8),

    #[error("I/O error reading dump: {0}")]
    Io(#[from] std::io::Error),
}

/// What a load produced, for logging and the admin endpoint.
#[derive(Debug, Default)]
pub struct LoadStats {
    pub keys: usize,
    pub aux: HashMap<String, String>,
}

/// Load the dump at `path` into the keyspace. A missing file is an empty
/// keyspace, not an error; a malformed file is fatal.
pub fn load_file(path: &Path, keyspace: &mut Keyspace) -> Result<LoadStats, RdbError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "No RDB file, starting with an empty keyspace");
        return Ok(LoadStats::default());
    }
    let bytes = std::fs::read(path)?;
    let stats = parse(&bytes, keyspace)?;
    tracing::info!(
        path = %path.display(),
        keys = stats.keys,
        "Keyspace bootstrapped from RDB"
    );
    metrics::counter!("rdb.keys_loaded").increment(stats.keys as u64);
    Ok(stats)
}

/// Parse an in-memory dump into the keyspace.
pub fn parse(bytes: &[u8], keyspace: &mut Keyspace) -> Result<LoadStats, RdbError> {
    let mut reader = Reader { data: bytes, pos: 0 };

    if reader.take(5)? != b"REDIS" {
        return Err(RdbError::BadMagic);
    }
    // 4-byte ASCII version, e.g. "0011". Not semantically interpreted.
    let _version = reader.take(4)?;

    let mut stats = LoadStats::default();
    let mut pending_expiry: Option<u64> = None;

    loop {
        let opcode = reader.u8()?;
        match opcode {
            OP_EOF => break,
            OP_AUX => {
                let name = reader.string()?;
                let value = reader.string()?;
                stats.aux.insert(
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                );
            }
            OP_RESIZEDB => {
                // Hash-table size hints. Consumed, not enforced.
                reader.length()?;
                reader.length()?;
            }
            OP_SELECTDB => {
                let _db = reader.length()?;
            }
            OP_EXPIRETIME_MS => {
                pending_expiry = Some(reader.u64_le()?);
            }
            OP_EXPIRETIME => {
                pending_expiry = Some(u64::from(reader.u32_le()?) * 1000);
            }
            value_type => {
                let key = reader.string()?;
                let value = match value_type {
                    TYPE_STRING => reader.string()?,
                    other => return Err(RdbError::UnsupportedValueType(other)),
                };
                let expiry = pending_expiry.take().map(Expiry::AtMs);
                // Absolute expiries in the past still go in; lazy expiration
                // reaps them on first observation.
                keyspace.set(key, value, expiry, 0);
                stats.keys += 1;
            }
        }
    }

    Ok(stats)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

enum Length {
    /// A plain byte count.
    Len(usize),
    /// A "special format" code from a `11`-prefixed byte.
    Format(u8),
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RdbError> {
        if self.pos + n > self.data.len() {
            return Err(RdbError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, RdbError> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, RdbError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_le(&mut self) -> Result<u64, RdbError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Length encoding: the first byte's top two bits select the shape.
    fn length(&mut self) -> Result<Length, RdbError> {
        let first = self.u8()?;
        match first >> 6 {
            0b00 => Ok(Length::Len(usize::from(first & 0x3F))),
            0b01 => {
                let low = self.u8()?;
                Ok(Length::Len(usize::from(first & 0x3F) << 8 | usize::from(low)))
            }
            0b10 => {
                let bytes = self.take(4)?;
                Ok(Length::Len(
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
                ))
            }
            _ => Ok(Length::Format(first & 0x3F)),
        }
    }

    /// String encoding: a plain length-prefixed blob, or an integer special
    /// format rendered as its decimal text.
    fn string(&mut self) -> Result<Vec<u8>, RdbError> {
        match self.length()? {
            Length::Len(n) => Ok(self.take(n)?.to_vec()),
            Length::Format(0) => {
                let v = self.u8()? as i8;
                Ok(v.to_string().into_bytes())
            }
            Length::Format(1) => {
                let bytes = self.take(2)?;
                let v = i16::from_le_bytes([bytes[0], bytes[1]]);
                Ok(v.to_string().into_bytes())
            }
            Length::Format(2) => {
                let bytes = self.take(4)?;
                let v = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(v.to_string().into_bytes())
            }
            Length::Format(code) => Err(RdbError::UnsupportedFormat(code)),
        }
    }
}
