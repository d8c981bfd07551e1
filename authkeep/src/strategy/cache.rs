//! Silent acquisition backed by the token cache
//!
//! A valid cached access token is returned as-is. When its refresh time
//! has come, a refresh runs in the background so that the caller never
//! waits on it. Without a valid token the strategy redeems a refresh token,
//! trying the family refresh token first when that is allowed, and writes
//! the new tokens back to the cache.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use authkeep_cache::{
    records::{AccessTokenRecord, AccountRecord, Record},
    response::ResponseContext,
    RefreshToken, ScopeSet, TenantId, TokenCache,
};
use authkeep_clock::Clock;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::SilentConfig,
    error::{AcquireError, ClientErrorKind, UiRequiredReason},
    jitter::JitterSource,
    result::AuthenticationResult,
    token_endpoint::{RefreshTokenGrant, TokenEndpoint},
};

/// A claimed background refresh key, released on drop even if the refresh
/// panics
struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlight {
    fn claim(keys: &Arc<Mutex<HashSet<String>>>, key: String) -> Option<Self> {
        let claimed = keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        claimed.then(|| Self {
            keys: keys.clone(),
            key,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// A silent request resolved to a cached account
#[derive(Clone, Debug)]
pub struct CacheSilentRequest {
    /// The account to acquire a token for
    pub account: AccountRecord,
    /// The requested scopes
    pub scopes: ScopeSet,
    /// Skip the cached access token
    pub force_refresh: bool,
    /// A claims challenge; also skips the cached access token
    pub claims: Option<String>,
    /// Correlates the network calls made for this request
    pub correlation_id: Uuid,
    /// Parameters appended to token endpoint requests
    pub extra_query_parameters: Vec<(String, String)>,
}

impl CacheSilentRequest {
    fn may_use_cached_token(&self) -> bool {
        !self.force_refresh && self.claims.is_none()
    }
}

/// Acquires tokens from the cache, refreshing them as needed
#[derive(Clone)]
pub struct CacheSilentStrategy {
    config: Arc<SilentConfig>,
    cache: Arc<TokenCache>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock + Send + Sync>,
    jitter: Arc<dyn JitterSource>,
    lifetime: CancellationToken,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl fmt::Debug for CacheSilentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSilentStrategy")
            .field("client_id", &self.config.client_id)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CacheSilentStrategy {
    /// Constructs a strategy
    ///
    /// Background refreshes are cancelled when `lifetime` is.
    pub fn new(
        config: Arc<SilentConfig>,
        cache: Arc<TokenCache>,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock + Send + Sync>,
        jitter: Arc<dyn JitterSource>,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            config,
            cache,
            endpoint,
            clock,
            jitter,
            lifetime,
            in_flight: Arc::default(),
        }
    }

    /// Acquires a token for `request`
    #[tracing::instrument(
        err,
        skip(self, request, cancel),
        fields(
            home_account_id = %request.account.home_account_id,
            scopes = %request.scopes,
            force_refresh = request.force_refresh,
        ),
    )]
    pub async fn execute(
        &self,
        request: &CacheSilentRequest,
        cancel: &CancellationToken,
    ) -> Result<AuthenticationResult, AcquireError> {
        let tenant = self.tenant_for(&request.account);
        let mut stale = None;

        if request.may_use_cached_token() {
            let now = self.clock.now();
            match self.find_access_token(request, &tenant).await? {
                Some(at) if at.is_valid_at(now) => {
                    if now >= self.jitter.jitter(at.refresh_at()) {
                        tracing::debug!(refresh_at = %at.refresh_at(), "cached token is due for refresh");
                        self.schedule_refresh(request, &at);
                    } else {
                        tracing::debug!(expires_at = %at.expires_at, "returning cached token");
                    }
                    return self.cached_result(request, at, false).await;
                }
                Some(at) => {
                    tracing::debug!(expires_at = %at.expires_at, "cached token has expired");
                    if at.is_within_extended_lifetime(now) {
                        stale = Some(at);
                    }
                }
                None => tracing::debug!("no cached token covers the requested scopes"),
            }
        } else {
            tracing::debug!(
                claims = request.claims.is_some(),
                "bypassing cached access tokens"
            );
        }

        match self.refresh(request, &tenant, cancel).await {
            Ok(result) => Ok(result),
            Err(AcquireError::Service(err)) if err.retryable => match stale {
                Some(at) => {
                    tracing::warn!(error = %err, "identity provider unavailable; returning stale token");
                    self.cached_result(request, at, true).await
                }
                None => Err(AcquireError::Service(err)),
            },
            Err(err) => Err(err),
        }
    }

    fn tenant_for(&self, account: &AccountRecord) -> TenantId {
        if self.config.authority.is_tenantless() {
            account.tenant_id.clone()
        } else {
            self.config.authority.tenant().to_owned()
        }
    }

    async fn find_access_token(
        &self,
        request: &CacheSilentRequest,
        tenant: &TenantId,
    ) -> Result<Option<AccessTokenRecord>, AcquireError> {
        Ok(self
            .cache
            .find_access_token(
                &request.account.home_account_id,
                self.config.authority.environment(),
                &self.config.client_id,
                tenant,
                &request.scopes,
            )
            .await?)
    }

    async fn cached_result(
        &self,
        request: &CacheSilentRequest,
        at: AccessTokenRecord,
        is_extended_lifetime_token: bool,
    ) -> Result<AuthenticationResult, AcquireError> {
        let id_token = self
            .cache
            .find_id_token(
                &at.home_account_id,
                &at.environment,
                &at.client_id,
                &at.tenant_id,
            )
            .await?
            .map(|id| id.secret);

        Ok(AuthenticationResult::from_cache(
            at,
            &request.account,
            id_token,
            request.correlation_id,
            is_extended_lifetime_token,
        ))
    }

    /// Starts a background refresh unless one is already running for the
    /// same token
    fn schedule_refresh(&self, request: &CacheSilentRequest, at: &AccessTokenRecord) {
        if self.lifetime.is_cancelled() {
            return;
        }
        let key = match at.key() {
            Ok(key) => key.as_str().to_owned(),
            Err(err) => {
                tracing::warn!(error = %err, "cannot key cached token; skipping refresh");
                return;
            }
        };
        let Some(in_flight) = InFlight::claim(&self.in_flight, key) else {
            tracing::trace!("refresh already in flight");
            return;
        };

        let this = self.clone();
        let cancel = self.lifetime.child_token();
        let mut request = request.clone();
        request.force_refresh = true;
        let span = tracing::info_span!(
            "background_refresh",
            correlation_id = %request.correlation_id,
        );

        tokio::spawn(
            async move {
                let tenant = this.tenant_for(&request.account);
                match this.refresh(&request, &tenant, &cancel).await {
                    Ok(result) => {
                        tracing::debug!(expires_at = %result.expires_at, "background refresh complete")
                    }
                    Err(err) => tracing::warn!(error = %err, "background refresh failed"),
                }
                drop(in_flight);
            }
            .instrument(span),
        );
    }

    async fn refresh(
        &self,
        request: &CacheSilentRequest,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> Result<AuthenticationResult, AcquireError> {
        let home = &request.account.home_account_id;
        let environment = self.config.authority.environment();
        let client_id = &self.config.client_id;
        let family_id = &self.config.family_id;

        let mut rejected_family_token: Option<RefreshToken> = None;

        if self.config.family_tokens_enabled {
            let membership = self
                .cache
                .family_membership(environment, client_id, family_id)
                .await?;
            if membership.may_attempt() {
                if let Some(frt) = self
                    .cache
                    .find_family_refresh_token(home, environment, family_id)
                    .await?
                {
                    tracing::debug!(?membership, %family_id, "redeeming family refresh token");
                    match self.redeem(request, tenant, frt.secret.clone(), cancel).await {
                        Ok(result) => return Ok(result),
                        Err(AcquireError::Service(err)) if err.is_client_mismatch() => {
                            tracing::warn!(
                                error = %err,
                                "client is not in the family; falling back to its own refresh token"
                            );
                            rejected_family_token = Some(frt.secret);
                        }
                        Err(err) => return Err(err.into_ui_required_if_interactive()),
                    }
                }
            } else {
                tracing::trace!("client is not a family member");
            }
        }

        let rt = self
            .cache
            .find_refresh_token(home, environment, client_id)
            .await?
            .filter(|rt| rejected_family_token.as_ref() != Some(&rt.secret))
            .ok_or_else(|| {
                tracing::debug!("no refresh token cached for the account");
                AcquireError::ui_required(UiRequiredReason::NoTokensFound)
            })?;

        tracing::debug!(family = rt.is_family(), "redeeming refresh token");
        self.redeem(request, tenant, rt.secret, cancel)
            .await
            .map_err(AcquireError::into_ui_required_if_interactive)
    }

    async fn redeem(
        &self,
        request: &CacheSilentRequest,
        tenant: &TenantId,
        refresh_token: RefreshToken,
        cancel: &CancellationToken,
    ) -> Result<AuthenticationResult, AcquireError> {
        let token_url = self
            .config
            .authority
            .token_endpoint(tenant)
            .map_err(|e| AcquireError::client_with_source(ClientErrorKind::InvalidConfiguration, e))?;

        let grant = RefreshTokenGrant {
            client_id: self.config.client_id.clone(),
            refresh_token,
            scopes: request.scopes.clone(),
            claims: request.claims.clone(),
            correlation_id: request.correlation_id,
            extra_query_parameters: request.extra_query_parameters.clone(),
        };

        let response = self
            .endpoint
            .exchange_refresh_token(&token_url, grant, cancel)
            .await?;

        if cancel.is_cancelled() {
            tracing::debug!("cancelled before the new tokens were cached");
            return Err(AcquireError::Cancelled);
        }

        let ctx = ResponseContext {
            environment: self.config.authority.environment(),
            client_id: &self.config.client_id,
            tenant_id: tenant,
            requested_scopes: &request.scopes,
            home_account_id: Some(&request.account.home_account_id),
            authority_type: self.config.authority.authority_type(),
        };
        let saved = self
            .cache
            .save_token_response(response, &ctx, self.clock.now())
            .await?;

        if *saved.access_token.home_account_id != *request.account.home_account_id {
            tracing::warn!(
                returned = %saved.access_token.home_account_id,
                "token response was issued to a different account"
            );
        }

        Ok(AuthenticationResult::from_saved(
            saved,
            &request.account,
            request.correlation_id,
        ))
    }
}
