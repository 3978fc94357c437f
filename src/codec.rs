//! Key/value blob codec.
//!
//! Headers and server variables cross the host boundary as a flat binary
//! buffer:
//!
//! ```text
//! <8>       pair count
//! <8>       key_len
//! <key_len> key
//! <8>       val_len
//! <val_len> val
//! ...
//! ```
//!
//! All integers are little-endian `u64`. Lengths count payload bytes only;
//! no terminator is stored. The declared lengths must consume the buffer
//! exactly, so truncated blobs and trailing garbage are both rejected.
//! A zero-length buffer (an absent blob) holds no records.

use crate::error::{BridgeError, Result};

/// Width of every length prefix
pub const LENGTH_PREFIX: usize = std::mem::size_of::<u64>();

/// Smallest possible encoded record (two empty length prefixes)
const MIN_RECORD: usize = 2 * LENGTH_PREFIX;

/// Iterator over the records of a blob.
///
/// Yields borrowed views into the blob. After the first error the iterator
/// is fused and yields nothing more.
pub struct Pairs<'a> {
    blob: &'a [u8],
    cursor: usize,
    remaining: u64,
    pending: Option<BridgeError>,
    failed: bool,
}

impl<'a> Pairs<'a> {
    fn read_len(&mut self, what: &str) -> Result<usize> {
        let end = self
            .cursor
            .checked_add(LENGTH_PREFIX)
            .filter(|end| *end <= self.blob.len())
            .ok_or_else(|| {
                BridgeError::malformed(self.cursor, format!("{} length prefix truncated", what))
            })?;

        let mut raw = [0u8; LENGTH_PREFIX];
        raw.copy_from_slice(&self.blob[self.cursor..end]);
        let len = u64::from_le_bytes(raw);
        self.cursor = end;

        usize::try_from(len).map_err(|_| {
            BridgeError::malformed(self.cursor, format!("{} length {} overflows usize", what, len))
        })
    }

    fn read_bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let start = self.cursor;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.blob.len())
            .ok_or_else(|| {
                BridgeError::malformed(
                    start,
                    format!(
                        "{} of {} bytes runs past end of {}-byte blob",
                        what,
                        len,
                        self.blob.len()
                    ),
                )
            })?;

        self.cursor = end;
        Ok(&self.blob[start..end])
    }

    fn next_pair(&mut self) -> Result<(&'a [u8], &'a [u8])> {
        let key_len = self.read_len("key")?;
        let key = self.read_bytes(key_len, "key")?;
        let val_len = self.read_len("value")?;
        let val = self.read_bytes(val_len, "value")?;
        Ok((key, val))
    }
}

impl<'a> Iterator for Pairs<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if let Some(err) = self.pending.take() {
            self.failed = true;
            return Some(Err(err));
        }

        if self.remaining == 0 {
            if self.cursor != self.blob.len() {
                self.failed = true;
                return Some(Err(BridgeError::malformed(
                    self.cursor,
                    format!("{} trailing bytes after last record", self.blob.len() - self.cursor),
                )));
            }
            return None;
        }

        self.remaining -= 1;
        let pair = self.next_pair();
        if pair.is_err() {
            self.failed = true;
        }
        Some(pair)
    }
}

/// Start iterating over a blob's records.
///
/// The pair count header is checked up front: a count that cannot possibly
/// fit in the remaining bytes fails on the first `next()`. An empty buffer
/// yields no records.
pub fn pairs(blob: &[u8]) -> Pairs<'_> {
    let mut iter = Pairs {
        blob,
        cursor: 0,
        remaining: 0,
        pending: None,
        failed: false,
    };
    if blob.is_empty() {
        return iter;
    }

    match iter.read_len("pair count") {
        Ok(count) => {
            let available = (blob.len() - LENGTH_PREFIX) / MIN_RECORD;
            if count > available {
                iter.pending = Some(BridgeError::malformed(
                    0,
                    format!(
                        "pair count {} cannot fit in {}-byte blob",
                        count,
                        blob.len()
                    ),
                ));
            } else {
                iter.remaining = count as u64;
            }
        }
        Err(err) => iter.pending = Some(err),
    }

    iter
}

/// Check that a blob is well formed, returning its record count.
pub fn validate(blob: &[u8]) -> Result<usize> {
    let mut count = 0;
    for pair in pairs(blob) {
        pair?;
        count += 1;
    }
    Ok(count)
}

/// Decode a blob, calling `visit(key, value)` once per record in order.
///
/// The whole blob is validated before the first call, so a malformed blob
/// never produces partial visits. Keys and values borrow from `blob`.
pub fn decode<F>(blob: &[u8], mut visit: F) -> Result<usize>
where
    F: FnMut(&[u8], &[u8]),
{
    let count = validate(blob)?;
    for (key, val) in pairs(blob).map_while(|pair| pair.ok()) {
        visit(key, val);
    }
    Ok(count)
}

/// Incremental blob encoder
#[derive(Debug, Clone)]
pub struct BlobBuilder {
    buf: Vec<u8>,
    count: u64,
}

impl BlobBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a builder with room for `bytes` of payload
    pub fn with_capacity(bytes: usize) -> Self {
        let mut buf = Vec::with_capacity(LENGTH_PREFIX + bytes);
        buf.extend_from_slice(&0u64.to_le_bytes());
        Self { buf, count: 0 }
    }

    /// Append one record
    pub fn push(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        let key = key.as_ref();
        let value = value.as_ref();
        self.buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(value);
        self.count += 1;
        self
    }

    /// Number of records pushed so far
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Whether no records were pushed
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Patch the pair count and return the encoded blob
    pub fn finish(mut self) -> Vec<u8> {
        self.buf[..LENGTH_PREFIX].copy_from_slice(&self.count.to_le_bytes());
        self.buf
    }
}

impl Default for BlobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a sequence of pairs into a blob
pub fn encode<I, K, V>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut builder = BlobBuilder::new();
    for (key, value) in pairs {
        builder.push(key, value);
    }
    builder.finish()
}
