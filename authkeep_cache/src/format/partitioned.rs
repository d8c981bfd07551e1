//! The current blob format: one JSON section per credential kind

use serde_json::{Map, Value};

use crate::{key::CredentialKind, CacheContents, CacheKey, CacheRecord};

/// Decodes the sections of a partitioned blob
///
/// Records that fail to decode are skipped so that one bad record does not
/// cost the rest of the cache.
pub fn decode(mut sections: Map<String, Value>) -> CacheContents {
    let mut contents = CacheContents::new();

    for kind in CredentialKind::ALL {
        let section = match sections.remove(kind.section()) {
            Some(Value::Object(section)) => section,
            Some(_) => {
                tracing::warn!(section = kind.section(), "cache section is not an object; skipping");
                continue;
            }
            None => continue,
        };

        for (key, value) in section {
            match CacheRecord::from_value(kind, value) {
                Ok(record) => {
                    contents.insert(CacheKey::new(key), record);
                }
                Err(error) => {
                    tracing::warn!(section = kind.section(), %key, %error, "skipping unreadable cache record");
                }
            }
        }
    }

    for unknown in sections.keys() {
        tracing::debug!(section = %unknown, "ignoring unknown cache section");
    }

    contents
}

/// Encodes contents as a partitioned blob
///
/// Every section is written, even when empty, and records are ordered by
/// key so that equal contents always produce identical bytes.
pub fn encode(contents: &CacheContents) -> Result<Vec<u8>, serde_json::Error> {
    let mut sections = Map::new();
    for kind in CredentialKind::ALL {
        let mut section = Map::new();
        for (key, record) in contents.section(kind) {
            section.insert(key.to_owned(), record.to_value()?);
        }
        sections.insert(kind.section().to_owned(), Value::Object(section));
    }
    serde_json::to_vec(&Value::Object(sections))
}
