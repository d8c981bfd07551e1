//! The contract between the cache engine and a record store

use std::error;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    key::CredentialKind, lock::LockOptions, storage::StorageError, CacheKey, CacheKeyRef,
    CacheRecord, HomeAccountIdRef,
};

/// An error raised by a cache accessor
#[derive(Debug, Error)]
pub enum AccessorError {
    /// A record was offered under a kind it does not belong to
    #[error("record of kind {actual} cannot be stored as {expected}")]
    KindMismatch {
        /// The kind the caller asked for
        expected: CredentialKind,
        /// The kind of the record that was offered
        actual: CredentialKind,
    },
    /// The backing storage failed
    #[error("cache storage failed")]
    Storage(#[from] StorageError),
    /// The cache could not be serialized
    #[error("unable to serialize the token cache")]
    Serialize(#[source] serde_json::Error),
    /// A backend-specific failure
    #[error("cache backend failed")]
    Backend(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

/// Read, write, enumerate and delete access to cache records
///
/// Implementations make no promise of atomicity across calls. Anything that
/// touches several records at once, such as replacing an access token and
/// its ID token after a refresh, is sequenced by
/// [`TokenCache`][crate::TokenCache].
#[async_trait]
pub trait CacheAccessor: Send + Sync {
    /// Gets the record of `kind` stored under `key`
    async fn get(
        &self,
        kind: CredentialKind,
        key: &CacheKeyRef,
    ) -> Result<Option<CacheRecord>, AccessorError>;

    /// Stores `record` under `key`, replacing any existing record
    async fn set(
        &self,
        kind: CredentialKind,
        key: CacheKey,
        record: CacheRecord,
    ) -> Result<(), AccessorError>;

    /// Deletes the record of `kind` stored under `key`, if any
    async fn delete(&self, kind: CredentialKind, key: &CacheKeyRef) -> Result<(), AccessorError>;

    /// Lists every record of `kind`, optionally only those belonging to one
    /// account
    ///
    /// Records that are not account-scoped are never filtered out.
    async fn enumerate(
        &self,
        kind: CredentialKind,
        home_account_id: Option<&HomeAccountIdRef>,
    ) -> Result<Vec<CacheRecord>, AccessorError>;

    /// Deletes every record of `kind`
    async fn clear(&self, kind: CredentialKind) -> Result<(), AccessorError>;

    /// The cross-process lock guarding this accessor's durable storage
    ///
    /// Memory-only accessors need no lock.
    fn lock_options(&self) -> Option<&LockOptions> {
        None
    }

    /// Replaces the in-memory view with the contents of durable storage
    async fn reload(&self) -> Result<(), AccessorError> {
        Ok(())
    }

    /// Writes the in-memory view to durable storage
    async fn persist(&self) -> Result<(), AccessorError> {
        Ok(())
    }
}

pub(crate) fn check_kind(expected: CredentialKind, record: &CacheRecord) -> Result<(), AccessorError> {
    let actual = record.kind();
    if actual == expected {
        Ok(())
    } else {
        Err(AccessorError::KindMismatch { expected, actual })
    }
}
