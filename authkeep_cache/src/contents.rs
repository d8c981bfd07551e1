use std::collections::BTreeMap;

use crate::{key::CredentialKind, CacheKey, CacheKeyRef, CacheRecord, HomeAccountIdRef};

/// The complete set of records held by a cache, partitioned by kind
///
/// Sections are ordered maps so that serializing the same contents always
/// produces the same bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheContents {
    sections: BTreeMap<CredentialKind, BTreeMap<String, CacheRecord>>,
}

impl CacheContents {
    /// An empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the record of `kind` under `key`
    pub fn get(&self, kind: CredentialKind, key: &CacheKeyRef) -> Option<&CacheRecord> {
        self.sections.get(&kind)?.get(key.as_str())
    }

    /// Inserts a record, returning the one it replaced
    pub fn insert(&mut self, key: CacheKey, record: CacheRecord) -> Option<CacheRecord> {
        self.sections
            .entry(record.kind())
            .or_default()
            .insert(key.as_str().to_owned(), record)
    }

    /// Removes the record of `kind` under `key`
    pub fn remove(&mut self, kind: CredentialKind, key: &CacheKeyRef) -> Option<CacheRecord> {
        self.sections.get_mut(&kind)?.remove(key.as_str())
    }

    /// Lists the records of `kind`, optionally filtered to one account
    pub fn enumerate(
        &self,
        kind: CredentialKind,
        home_account_id: Option<&HomeAccountIdRef>,
    ) -> Vec<CacheRecord> {
        self.sections
            .get(&kind)
            .into_iter()
            .flat_map(|section| section.values())
            .filter(|record| match (home_account_id, record.home_account_id()) {
                (Some(wanted), Some(actual)) => wanted == actual,
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Iterates the keys and records of one kind
    pub fn section(&self, kind: CredentialKind) -> impl Iterator<Item = (&str, &CacheRecord)> {
        self.sections
            .get(&kind)
            .into_iter()
            .flat_map(|section| section.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Removes every record of `kind`
    pub fn clear(&mut self, kind: CredentialKind) {
        self.sections.remove(&kind);
    }

    /// The number of records of `kind`
    pub fn len(&self, kind: CredentialKind) -> usize {
        self.sections.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Whether the cache holds no records at all
    pub fn is_empty(&self) -> bool {
        self.sections.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{fixtures, Record};

    #[test]
    fn enumerate_filters_by_account() {
        let mut contents = CacheContents::new();
        let mine = fixtures::refresh_token("client-a", None);
        let mut theirs = fixtures::refresh_token("client-a", None);
        theirs.home_account_id = "other.utid".into();

        contents.insert(mine.key().unwrap(), mine.clone().into());
        contents.insert(theirs.key().unwrap(), theirs.into());

        let all = contents.enumerate(CredentialKind::RefreshToken, None);
        assert_eq!(all.len(), 2);

        let filtered = contents.enumerate(
            CredentialKind::RefreshToken,
            Some(&mine.home_account_id),
        );
        assert_eq!(filtered, vec![CacheRecord::from(mine)]);
    }

    #[test]
    fn insert_replaces_under_same_key() {
        let mut contents = CacheContents::new();
        let old = fixtures::access_token("read", 100);
        let new = fixtures::access_token("READ", 200);
        assert_eq!(old.key().unwrap(), new.key().unwrap());

        contents.insert(old.key().unwrap(), old.into());
        let replaced = contents.insert(new.key().unwrap(), new.clone().into());

        assert!(replaced.is_some());
        assert_eq!(contents.len(CredentialKind::AccessToken), 1);
        assert_eq!(
            contents.get(CredentialKind::AccessToken, &new.key().unwrap()),
            Some(&CacheRecord::from(new))
        );
    }
}
