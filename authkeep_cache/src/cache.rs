//! The token cache engine
//!
//! [`TokenCache`] layers multi-record transactions over a [`CacheAccessor`].
//! Reads reload the accessor's view and query it. Writes additionally take
//! the cross-process lock first, then the intra-process gate, reload, apply
//! every record change and persist before releasing either lock, so a writer
//! always builds on the latest stored state.

use std::{collections::HashSet, fmt, sync::Arc};

use authkeep_clock::UnixTime;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    accessor::{AccessorError, CacheAccessor},
    key::{self, CredentialKind, MalformedKey},
    lock::{CrossProcessLock, LockGuard, LockTimeout},
    memory::InMemoryCacheAccessor,
    records::{
        AccessTokenRecord, AccountRecord, AppMetadataRecord, FamilyMembership, IdTokenRecord,
        Record, RefreshTokenRecord,
    },
    response::{ResponseContext, TokenResponse},
    CacheRecord, ClientIdRef, EnvironmentRef, FamilyIdRef, HomeAccountIdRef, ScopeSet,
    TenantIdRef,
};

/// An error raised by the token cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// The accessor failed
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    /// The cross-process lock could not be acquired
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
    /// A record could not be keyed
    #[error(transparent)]
    MalformedKey(#[from] MalformedKey),
    /// A token response did not say which account it was for
    #[error("token response does not identify an account")]
    UnidentifiedAccount,
}

/// The records written for one token response
#[derive(Clone, Debug)]
pub struct SavedTokens {
    /// The new access token
    pub access_token: AccessTokenRecord,
    /// The new ID token, if one was issued
    pub id_token: Option<IdTokenRecord>,
    /// The account the tokens belong to, if the response described it
    pub account: Option<AccountRecord>,
}

/// A token cache over an injected accessor
pub struct TokenCache {
    accessor: Arc<dyn CacheAccessor>,
    gate: Mutex<()>,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("lock", &self.accessor.lock_options())
            .finish_non_exhaustive()
    }
}

struct WriteScope<'a> {
    _gate: MutexGuard<'a, ()>,
    _lock: Option<LockGuard>,
}

impl TokenCache {
    /// Constructs a cache over `accessor`
    pub fn new(accessor: Arc<dyn CacheAccessor>) -> Self {
        Self {
            accessor,
            gate: Mutex::new(()),
        }
    }

    /// Constructs a cache that lives only in process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCacheAccessor::new()))
    }

    /// The underlying accessor
    pub fn accessor(&self) -> &Arc<dyn CacheAccessor> {
        &self.accessor
    }

    async fn read(&self) -> Result<MutexGuard<'_, ()>, CacheError> {
        let gate = self.gate.lock().await;
        self.accessor.reload().await?;
        Ok(gate)
    }

    async fn write(&self) -> Result<WriteScope<'_>, CacheError> {
        let lock = match self.accessor.lock_options() {
            Some(options) => Some(CrossProcessLock::acquire(options).await?),
            None => None,
        };
        let gate = self.gate.lock().await;
        self.accessor.reload().await?;
        Ok(WriteScope {
            _gate: gate,
            _lock: lock,
        })
    }

    async fn put<R: Record + Into<CacheRecord>>(&self, record: R) -> Result<(), CacheError> {
        let key = record.key()?;
        self.accessor.set(R::KIND, key, record.into()).await?;
        Ok(())
    }

    /// Finds an access token for exactly these identifiers whose scopes
    /// cover `scopes`
    ///
    /// The reserved OpenID Connect scopes are ignored. An exact scope match
    /// is preferred; otherwise the longest-lived superset wins.
    #[tracing::instrument(err, skip(self, scopes), fields(scopes = %scopes))]
    pub async fn find_access_token(
        &self,
        home_account_id: &HomeAccountIdRef,
        environment: &EnvironmentRef,
        client_id: &ClientIdRef,
        tenant_id: &TenantIdRef,
        scopes: &ScopeSet,
    ) -> Result<Option<AccessTokenRecord>, CacheError> {
        let scopes = scopes.without_reserved();
        let _gate = self.read().await?;

        let exact = key::access_token(home_account_id, environment, client_id, tenant_id, &scopes)?;
        if let Some(record) = self.accessor.get(CredentialKind::AccessToken, &exact).await? {
            return Ok(record.into_access_token());
        }

        let found = self
            .accessor
            .enumerate(CredentialKind::AccessToken, Some(home_account_id))
            .await?
            .into_iter()
            .filter_map(CacheRecord::into_access_token)
            .filter(|at| {
                *at.environment == *environment
                    && *at.client_id == *client_id
                    && *at.tenant_id == *tenant_id
                    && at.scopes.is_superset(&scopes)
            })
            .max_by_key(|at| at.expires_at);

        Ok(found)
    }

    /// Finds the refresh token a client obtained for an account
    ///
    /// Falls back to a family refresh token the same client obtained, which
    /// is stored under the family key.
    #[tracing::instrument(err, skip(self))]
    pub async fn find_refresh_token(
        &self,
        home_account_id: &HomeAccountIdRef,
        environment: &EnvironmentRef,
        client_id: &ClientIdRef,
    ) -> Result<Option<RefreshTokenRecord>, CacheError> {
        let _gate = self.read().await?;

        let key = key::refresh_token(home_account_id, environment, client_id)?;
        if let Some(record) = self.accessor.get(CredentialKind::RefreshToken, &key).await? {
            return Ok(record.into_refresh_token());
        }

        let found = self
            .accessor
            .enumerate(CredentialKind::RefreshToken, Some(home_account_id))
            .await?
            .into_iter()
            .filter_map(CacheRecord::into_refresh_token)
            .find(|rt| *rt.environment == *environment && *rt.client_id == *client_id);

        Ok(found)
    }

    /// Finds the refresh token shared by a family of clients
    #[tracing::instrument(err, skip(self))]
    pub async fn find_family_refresh_token(
        &self,
        home_account_id: &HomeAccountIdRef,
        environment: &EnvironmentRef,
        family_id: &FamilyIdRef,
    ) -> Result<Option<RefreshTokenRecord>, CacheError> {
        let _gate = self.read().await?;

        let key = key::family_refresh_token(home_account_id, environment, family_id)?;
        Ok(self
            .accessor
            .get(CredentialKind::RefreshToken, &key)
            .await?
            .and_then(CacheRecord::into_refresh_token))
    }

    /// Finds the ID token a client holds for an account in a tenant
    pub async fn find_id_token(
        &self,
        home_account_id: &HomeAccountIdRef,
        environment: &EnvironmentRef,
        client_id: &ClientIdRef,
        tenant_id: &TenantIdRef,
    ) -> Result<Option<IdTokenRecord>, CacheError> {
        let _gate = self.read().await?;

        let key = key::id_token(home_account_id, environment, client_id, tenant_id)?;
        Ok(self
            .accessor
            .get(CredentialKind::IdToken, &key)
            .await?
            .and_then(CacheRecord::into_id_token))
    }

    /// What the cache knows about a client's membership in a family
    pub async fn family_membership(
        &self,
        environment: &EnvironmentRef,
        client_id: &ClientIdRef,
        family_id: &FamilyIdRef,
    ) -> Result<FamilyMembership, CacheError> {
        let _gate = self.read().await?;

        let key = key::app_metadata(environment, client_id)?;
        let metadata = self
            .accessor
            .get(CredentialKind::AppMetadata, &key)
            .await?
            .and_then(CacheRecord::into_app_metadata);

        Ok(FamilyMembership::from_metadata(metadata.as_ref(), family_id))
    }

    /// Lists cached accounts, optionally only those of one environment
    pub async fn accounts(
        &self,
        environment: Option<&EnvironmentRef>,
    ) -> Result<Vec<AccountRecord>, CacheError> {
        let _gate = self.read().await?;

        Ok(self
            .accessor
            .enumerate(CredentialKind::Account, None)
            .await?
            .into_iter()
            .filter_map(CacheRecord::into_account)
            .filter(|a| environment.map_or(true, |env| *a.environment == *env))
            .collect())
    }

    /// Lists the distinct identities in an environment whose username
    /// matches `login_hint`, ignoring case
    ///
    /// An identity with profiles in several tenants is listed once.
    pub async fn accounts_by_login_hint(
        &self,
        environment: &EnvironmentRef,
        login_hint: &str,
    ) -> Result<Vec<AccountRecord>, CacheError> {
        let mut seen = HashSet::new();
        Ok(self
            .accounts(Some(environment))
            .await?
            .into_iter()
            .filter(|a| a.matches_login_hint(login_hint))
            .filter(|a| seen.insert(a.home_account_id.clone()))
            .collect())
    }

    /// Saves every record derived from a token response
    ///
    /// Any other access token for the same account, client and tenant whose
    /// scopes overlap the new one is removed first.
    #[tracing::instrument(
        err,
        skip(self, response, ctx),
        fields(environment = %ctx.environment, client_id = %ctx.client_id)
    )]
    pub async fn save_token_response(
        &self,
        response: TokenResponse,
        ctx: &ResponseContext<'_>,
        now: UnixTime,
    ) -> Result<SavedTokens, CacheError> {
        let records = response
            .into_records(ctx, now)
            .ok_or(CacheError::UnidentifiedAccount)?;

        let _scope = self.write().await?;

        let new_at = &records.access_token;
        let new_key = new_at.key()?;
        for stale in self
            .accessor
            .enumerate(CredentialKind::AccessToken, Some(&new_at.home_account_id))
            .await?
            .into_iter()
            .filter_map(CacheRecord::into_access_token)
            .filter(|at| {
                at.environment == new_at.environment
                    && at.client_id == new_at.client_id
                    && at.tenant_id == new_at.tenant_id
                    && at.scopes.intersects(&new_at.scopes)
            })
        {
            let key = stale.key()?;
            if key != new_key {
                tracing::trace!(scopes = %stale.scopes, "removing overlapping access token");
                self.accessor.delete(CredentialKind::AccessToken, &key).await?;
            }
        }

        self.put(records.access_token.clone()).await?;
        if let Some(id_token) = records.id_token.clone() {
            self.put(id_token).await?;
        }
        if let Some(account) = records.account.clone() {
            self.put(account).await?;
        }
        if let Some(refresh_token) = records.refresh_token {
            self.put(refresh_token).await?;
        }
        self.put::<AppMetadataRecord>(records.app_metadata).await?;

        self.accessor.persist().await?;

        tracing::info!(
            expires_at = %records.access_token.expires_at,
            scopes = %records.access_token.scopes,
            "cached new access token"
        );

        Ok(SavedTokens {
            access_token: records.access_token,
            id_token: records.id_token,
            account: records.account,
        })
    }

    /// Removes every token and profile of an account in one environment
    ///
    /// Application metadata is kept.
    #[tracing::instrument(err, skip(self))]
    pub async fn remove_account(
        &self,
        home_account_id: &HomeAccountIdRef,
        environment: &EnvironmentRef,
    ) -> Result<usize, CacheError> {
        let _scope = self.write().await?;

        let mut removed = 0;
        for kind in [
            CredentialKind::AccessToken,
            CredentialKind::RefreshToken,
            CredentialKind::IdToken,
            CredentialKind::Account,
        ] {
            for record in self.accessor.enumerate(kind, Some(home_account_id)).await? {
                if record.environment() != environment {
                    continue;
                }
                let key = record.key()?;
                self.accessor.delete(kind, &key).await?;
                removed += 1;
            }
        }

        self.accessor.persist().await?;
        Ok(removed)
    }

    /// Removes every record
    #[tracing::instrument(err, skip(self))]
    pub async fn clear(&self) -> Result<(), CacheError> {
        let _scope = self.write().await?;
        for kind in CredentialKind::ALL {
            self.accessor.clear(kind).await?;
        }
        self.accessor.persist().await?;
        Ok(())
    }
}
