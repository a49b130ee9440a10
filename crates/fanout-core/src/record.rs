use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::canonical::{canonical_json_bytes, sha256_bytes};
use crate::error::{FanoutError, Result};

const COMPRESSION_LEVEL: i32 = 3;

/// A value whose identity is the SHA-256 of its canonical JSON encoding.
///
/// Implementors only opt in; every method has a default derived from the serde impls.
/// Identity is always recomputed from content and never stored on the value.
pub trait ContentAddressedRecord: Serialize + DeserializeOwned {
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(|e| FanoutError::Encode(e.to_string()))?;
        canonical_json_bytes(&value).map_err(|e| FanoutError::Encode(e.to_string()))
    }

    fn identity(&self) -> Result<String> {
        Ok(sha256_bytes(&self.canonical_bytes()?))
    }

    /// Single-line JSON, safe to store one record per line.
    fn to_transport(&self) -> Result<String> {
        String::from_utf8(self.canonical_bytes()?).map_err(|e| FanoutError::Encode(e.to_string()))
    }

    fn from_transport(text: &str) -> Result<Self> {
        serde_json::from_str(text.trim_end_matches(['\r', '\n'])).map_err(|e| FanoutError::Parse {
            input: text.to_string(),
            reason: e.to_string(),
        })
    }

    fn to_compressed(&self) -> Result<Vec<u8>> {
        Ok(zstd::encode_all(&self.canonical_bytes()?[..], COMPRESSION_LEVEL)?)
    }

    fn from_compressed(bytes: &[u8]) -> Result<Self> {
        let raw = zstd::decode_all(bytes).map_err(|e| FanoutError::Decode(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| FanoutError::Decode(e.to_string()))
    }
}

/// Tuple of upstream identities and selection parameters naming one unit of work.
/// Only ever used as an in-memory lookup key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkKey(Vec<String>);

impl WorkKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: Vec<&str> = self.0.iter().map(|p| p.get(..12).unwrap_or(p)).collect();
        write!(f, "({})", short.join(", "))
    }
}

pub trait KeyedRecord: ContentAddressedRecord {
    fn work_key(&self) -> WorkKey;
}

/// Records written together as one storage unit. The grouping carries no meaning beyond that.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet<R> {
    records: Vec<R>,
}

impl<R> RecordSet<R> {
    pub fn new(records: Vec<R>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }
}

impl<R: ContentAddressedRecord> RecordSet<R> {
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.to_transport()?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn from_jsonl(text: &str) -> Result<Self> {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(R::from_transport)
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    pub fn to_compressed(&self) -> Result<Vec<u8>> {
        Ok(zstd::encode_all(self.to_jsonl()?.as_bytes(), COMPRESSION_LEVEL)?)
    }

    pub fn from_compressed(bytes: &[u8]) -> Result<Self> {
        let raw = zstd::decode_all(bytes).map_err(|e| FanoutError::Decode(e.to_string()))?;
        let text = String::from_utf8(raw).map_err(|e| FanoutError::Decode(e.to_string()))?;
        Self::from_jsonl(&text).map_err(|e| FanoutError::Decode(e.to_string()))
    }
}

impl<R> Default for RecordSet<R> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<R> FromIterator<R> for RecordSet<R> {
    fn from_iter<T: IntoIterator<Item = R>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<R> IntoIterator for RecordSet<R> {
    type Item = R;
    type IntoIter = std::vec::IntoIter<R>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a, R> IntoIterator for &'a RecordSet<R> {
    type Item = &'a R;
    type IntoIter = std::slice::Iter<'a, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
