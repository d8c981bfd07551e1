//! Serialized cache blob generations
//!
//! Two generations are readable and writable: the current partitioned
//! format, a JSON object with one section per credential kind, and an older
//! single-entry format, a JSON array of self-contained entries. Anything
//! else decodes as an empty cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CacheContents;

pub mod legacy;
pub mod partitioned;

/// The blob generation written by a persisted accessor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedFormat {
    /// A JSON object partitioned by credential kind
    #[default]
    Partitioned,
    /// A JSON array of self-contained legacy entries
    SingleEntry,
}

/// A decoded cache blob, tagged with the generation it was read from
#[derive(Clone, Debug, PartialEq)]
pub enum CacheBlob {
    /// Nothing was stored
    Empty,
    /// A current, partitioned blob
    Partitioned(CacheContents),
    /// A legacy blob
    SingleEntry(Vec<legacy::LegacyEntry>),
    /// A blob in no known format
    Unrecognized,
}

impl CacheBlob {
    /// Detects the generation of `bytes` and decodes it
    ///
    /// Never fails: an unreadable blob is reported as
    /// [`Unrecognized`][CacheBlob::Unrecognized].
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return CacheBlob::Empty;
        }

        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(sections)) => CacheBlob::Partitioned(partitioned::decode(sections)),
            Ok(Value::Array(entries)) => CacheBlob::SingleEntry(legacy::decode(entries)),
            Ok(_) => {
                tracing::warn!("cache blob is neither an object nor an array; ignoring it");
                CacheBlob::Unrecognized
            }
            Err(error) => {
                tracing::warn!(%error, "cache blob is not valid JSON; ignoring it");
                CacheBlob::Unrecognized
            }
        }
    }

    /// The generation of this blob, if it was a known one
    pub fn format(&self) -> Option<PersistedFormat> {
        match self {
            CacheBlob::Partitioned(_) => Some(PersistedFormat::Partitioned),
            CacheBlob::SingleEntry(_) => Some(PersistedFormat::SingleEntry),
            CacheBlob::Empty | CacheBlob::Unrecognized => None,
        }
    }

    /// Converts the blob into cache contents, migrating legacy entries
    pub fn into_contents(self) -> CacheContents {
        match self {
            CacheBlob::Empty | CacheBlob::Unrecognized => CacheContents::new(),
            CacheBlob::Partitioned(contents) => contents,
            CacheBlob::SingleEntry(entries) => legacy::migrate(entries),
        }
    }
}

/// Decodes a stored blob of any known generation into cache contents
pub fn decode(bytes: &[u8]) -> CacheContents {
    CacheBlob::detect(bytes).into_contents()
}

/// Encodes cache contents in the requested generation
pub fn encode(contents: &CacheContents, format: PersistedFormat) -> Result<Vec<u8>, serde_json::Error> {
    match format {
        PersistedFormat::Partitioned => partitioned::encode(contents),
        PersistedFormat::SingleEntry => legacy::encode(contents),
    }
}
