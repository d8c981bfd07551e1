//! A cache accessor backed by durable storage

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    accessor::{check_kind, AccessorError, CacheAccessor},
    format::{self, legacy, CacheBlob, PersistedFormat},
    key::CredentialKind,
    lock::LockOptions,
    storage::StorageBackend,
    CacheContents, CacheKey, CacheKeyRef, CacheRecord, HomeAccountIdRef,
};

/// A cache accessor that keeps an in-memory view of a persisted blob
///
/// Reads and writes operate on the view. The view is replaced from storage
/// by [`reload`][CacheAccessor::reload] and written back by
/// [`persist`][CacheAccessor::persist]; the [`TokenCache`][crate::TokenCache]
/// calls these under the cross-process lock reported by
/// [`lock_options`][CacheAccessor::lock_options].
#[derive(Debug)]
pub struct PersistentCacheAccessor<S> {
    storage: S,
    view: Mutex<CacheContents>,
    lock: Option<LockOptions>,
    format: PersistedFormat,
}

impl<S: StorageBackend> PersistentCacheAccessor<S> {
    /// Constructs an accessor over `storage` with an empty view
    ///
    /// When the storage lives on the filesystem, the accessor is guarded by
    /// a lock file next to it.
    pub fn new(storage: S) -> Self {
        let lock = storage.location().map(LockOptions::for_cache_file);
        Self {
            storage,
            view: Mutex::new(CacheContents::new()),
            lock,
            format: PersistedFormat::default(),
        }
    }

    /// Constructs an accessor and loads its view from storage
    pub async fn open(storage: S) -> Result<Self, AccessorError> {
        let accessor = Self::new(storage);
        accessor.reload().await?;
        Ok(accessor)
    }

    /// Guards the storage with the given lock
    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock = Some(options);
        self
    }

    /// Sets the blob generation written on persist
    pub fn with_format(mut self, format: PersistedFormat) -> Self {
        self.format = format;
        self
    }

    /// The underlying storage
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The blob generation written on persist
    pub fn format(&self) -> PersistedFormat {
        self.format
    }

    /// A copy of the current in-memory view
    pub async fn snapshot(&self) -> CacheContents {
        self.view.lock().await.clone()
    }
}

#[async_trait]
impl<S: StorageBackend> CacheAccessor for PersistentCacheAccessor<S> {
    async fn get(
        &self,
        kind: CredentialKind,
        key: &CacheKeyRef,
    ) -> Result<Option<CacheRecord>, AccessorError> {
        Ok(self.view.lock().await.get(kind, key).cloned())
    }

    async fn set(
        &self,
        kind: CredentialKind,
        key: CacheKey,
        record: CacheRecord,
    ) -> Result<(), AccessorError> {
        check_kind(kind, &record)?;
        self.view.lock().await.insert(key, record);
        Ok(())
    }

    async fn delete(&self, kind: CredentialKind, key: &CacheKeyRef) -> Result<(), AccessorError> {
        self.view.lock().await.remove(kind, key);
        Ok(())
    }

    async fn enumerate(
        &self,
        kind: CredentialKind,
        home_account_id: Option<&HomeAccountIdRef>,
    ) -> Result<Vec<CacheRecord>, AccessorError> {
        Ok(self.view.lock().await.enumerate(kind, home_account_id))
    }

    async fn clear(&self, kind: CredentialKind) -> Result<(), AccessorError> {
        self.view.lock().await.clear(kind);
        Ok(())
    }

    fn lock_options(&self) -> Option<&LockOptions> {
        self.lock.as_ref()
    }

    #[tracing::instrument(err, skip(self))]
    async fn reload(&self) -> Result<(), AccessorError> {
        let bytes = self.storage.load().await?;
        let blob = CacheBlob::detect(&bytes);
        let mut view = self.view.lock().await;
        let contents = match blob {
            CacheBlob::SingleEntry(entries) => legacy::carry_over(legacy::migrate(entries), &view),
            blob => blob.into_contents(),
        };
        tracing::trace!(bytes = bytes.len(), "reloaded token cache");
        *view = contents;
        Ok(())
    }

    #[tracing::instrument(err, skip(self), fields(format = ?self.format))]
    async fn persist(&self) -> Result<(), AccessorError> {
        let bytes = {
            let view = self.view.lock().await;
            format::encode(&view, self.format).map_err(AccessorError::Serialize)?
        };
        self.storage.store(&bytes).await?;
        tracing::trace!(bytes = bytes.len(), "persisted token cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        records::{fixtures, Record},
        storage::{MemoryStorage, PlaintextFileStorage},
    };

    #[tokio::test]
    async fn file_storage_is_guarded_by_a_sibling_lock_file() {
        let accessor = PersistentCacheAccessor::new(PlaintextFileStorage::new("/var/cache/app.json"));
        assert_eq!(
            accessor.lock_options().unwrap().path(),
            std::path::Path::new("/var/cache/app.json.lockfile")
        );
    }

    #[tokio::test]
    async fn memory_storage_has_no_lock() {
        let accessor = PersistentCacheAccessor::new(MemoryStorage::new());
        assert!(accessor.lock_options().is_none());
    }

    #[tokio::test]
    async fn writes_reach_storage_only_when_persisted() {
        let accessor = PersistentCacheAccessor::new(MemoryStorage::new());
        let rt = fixtures::refresh_token("client-a", None);
        accessor
            .set(CredentialKind::RefreshToken, rt.key().unwrap(), rt.clone().into())
            .await
            .unwrap();
        assert!(accessor.storage().data().is_empty());

        accessor.persist().await.unwrap();

        let reopened = PersistentCacheAccessor::open(MemoryStorage::with_data(accessor.storage().data()))
            .await
            .unwrap();
        assert_eq!(
            reopened
                .get(CredentialKind::RefreshToken, &rt.key().unwrap())
                .await
                .unwrap(),
            Some(rt.into())
        );
    }

    #[tokio::test]
    async fn unreadable_storage_opens_empty() {
        let accessor = PersistentCacheAccessor::open(MemoryStorage::with_data(&b"<xml/>"[..]))
            .await
            .unwrap();
        assert!(accessor.snapshot().await.is_empty());
    }

    mod when_writing_the_legacy_format {
        use super::*;

        #[tokio::test]
        async fn blob_is_an_array() {
            let accessor =
                PersistentCacheAccessor::new(MemoryStorage::new()).with_format(PersistedFormat::SingleEntry);
            let rt = fixtures::refresh_token("client-a", None);
            accessor
                .set(CredentialKind::RefreshToken, rt.key().unwrap(), rt.into())
                .await
                .unwrap();
            accessor.persist().await.unwrap();

            let value: serde_json::Value =
                serde_json::from_slice(&accessor.storage().data()).unwrap();
            assert_eq!(value.as_array().map(Vec::len), Some(1));
        }

        #[tokio::test]
        async fn records_the_blob_cannot_hold_survive_a_reload() {
            let accessor =
                PersistentCacheAccessor::new(MemoryStorage::new()).with_format(PersistedFormat::SingleEntry);
            let rt = fixtures::refresh_token("client-a", None);
            let at = fixtures::access_token("read", 1_000);
            accessor
                .set(CredentialKind::RefreshToken, rt.key().unwrap(), rt.clone().into())
                .await
                .unwrap();
            accessor
                .set(CredentialKind::AccessToken, at.key().unwrap(), at.clone().into())
                .await
                .unwrap();
            accessor.persist().await.unwrap();

            accessor.reload().await.unwrap();

            assert_eq!(
                accessor
                    .get(CredentialKind::AccessToken, &at.key().unwrap())
                    .await
                    .unwrap(),
                Some(at.into())
            );
            assert!(accessor
                .get(CredentialKind::RefreshToken, &rt.key().unwrap())
                .await
                .unwrap()
                .is_some());
        }

        #[tokio::test]
        async fn refresh_tokens_removed_from_the_blob_are_not_resurrected() {
            let accessor =
                PersistentCacheAccessor::new(MemoryStorage::new()).with_format(PersistedFormat::SingleEntry);
            let rt = fixtures::refresh_token("client-a", None);
            accessor
                .set(CredentialKind::RefreshToken, rt.key().unwrap(), rt.clone().into())
                .await
                .unwrap();

            accessor.storage().store(b"[]").await.unwrap();
            accessor.reload().await.unwrap();

            assert!(accessor
                .get(CredentialKind::RefreshToken, &rt.key().unwrap())
                .await
                .unwrap()
                .is_none());
        }
    }
}
