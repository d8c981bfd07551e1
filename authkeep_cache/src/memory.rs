//! An in-memory cache accessor

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    accessor::{check_kind, AccessorError, CacheAccessor},
    key::CredentialKind,
    CacheContents, CacheKey, CacheKeyRef, CacheRecord, HomeAccountIdRef,
};

/// A process-memory cache accessor
///
/// Nothing is persisted; the cache is lost when the accessor is dropped.
#[derive(Debug, Default)]
pub struct InMemoryCacheAccessor {
    contents: RwLock<CacheContents>,
}

impl InMemoryCacheAccessor {
    /// Constructs a new, empty in-memory accessor
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs an accessor pre-populated with `contents`
    pub fn with_contents(contents: CacheContents) -> Self {
        Self {
            contents: RwLock::new(contents),
        }
    }

    /// A copy of everything currently held
    pub async fn snapshot(&self) -> CacheContents {
        self.contents.read().await.clone()
    }
}

#[async_trait]
impl CacheAccessor for InMemoryCacheAccessor {
    async fn get(
        &self,
        kind: CredentialKind,
        key: &CacheKeyRef,
    ) -> Result<Option<CacheRecord>, AccessorError> {
        Ok(self.contents.read().await.get(kind, key).cloned())
    }

    async fn set(
        &self,
        kind: CredentialKind,
        key: CacheKey,
        record: CacheRecord,
    ) -> Result<(), AccessorError> {
        check_kind(kind, &record)?;
        self.contents.write().await.insert(key, record);
        Ok(())
    }

    async fn delete(&self, kind: CredentialKind, key: &CacheKeyRef) -> Result<(), AccessorError> {
        self.contents.write().await.remove(kind, key);
        Ok(())
    }

    async fn enumerate(
        &self,
        kind: CredentialKind,
        home_account_id: Option<&HomeAccountIdRef>,
    ) -> Result<Vec<CacheRecord>, AccessorError> {
        Ok(self.contents.read().await.enumerate(kind, home_account_id))
    }

    async fn clear(&self, kind: CredentialKind) -> Result<(), AccessorError> {
        self.contents.write().await.clear(kind);
        Ok(())
    }
}
