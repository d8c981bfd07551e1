//! The outcome of a successful silent acquisition

use authkeep_cache::{
    records::{AccessTokenRecord, AccountRecord},
    AccessToken, IdToken, SavedTokens, ScopeSet, TenantId,
};
use authkeep_clock::UnixTime;
use uuid::Uuid;

/// Where a token came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenSource {
    /// The token cache
    Cache,
    /// A fresh exchange with the identity provider
    IdentityProvider,
    /// The platform broker
    Broker,
}

/// A token acquired without user interaction
#[derive(Clone, Debug)]
pub struct AuthenticationResult {
    /// The access token
    pub access_token: AccessToken,
    /// When the access token expires
    pub expires_at: UnixTime,
    /// Until when the token may serve as a fallback during an outage
    pub extended_expires_at: UnixTime,
    /// The scopes the token was granted for
    pub scopes: ScopeSet,
    /// The tenant the token was issued in
    pub tenant_id: Option<TenantId>,
    /// The account the token was issued to
    pub account: Option<AccountRecord>,
    /// The ID token issued alongside, if any
    pub id_token: Option<IdToken>,
    /// Where the token came from
    pub source: TokenSource,
    /// Whether the token is past its expiry and returned only because the
    /// identity provider could not be reached
    pub is_extended_lifetime_token: bool,
    /// The correlation id of the request
    pub correlation_id: Uuid,
}

impl AuthenticationResult {
    pub(crate) fn from_cache(
        at: AccessTokenRecord,
        account: &AccountRecord,
        id_token: Option<IdToken>,
        correlation_id: Uuid,
        is_extended_lifetime_token: bool,
    ) -> Self {
        Self {
            extended_expires_at: at.extended_expires_at(),
            access_token: at.secret,
            expires_at: at.expires_at,
            scopes: at.scopes,
            tenant_id: Some(at.tenant_id),
            account: Some(account.clone()),
            id_token,
            source: TokenSource::Cache,
            is_extended_lifetime_token,
            correlation_id,
        }
    }

    pub(crate) fn from_saved(
        saved: SavedTokens,
        account: &AccountRecord,
        correlation_id: Uuid,
    ) -> Self {
        let at = saved.access_token;
        Self {
            extended_expires_at: at.extended_expires_at(),
            access_token: at.secret,
            expires_at: at.expires_at,
            scopes: at.scopes,
            tenant_id: Some(at.tenant_id),
            account: saved.account.or_else(|| Some(account.clone())),
            id_token: saved.id_token.map(|id| id.secret),
            source: TokenSource::IdentityProvider,
            is_extended_lifetime_token: false,
            correlation_id,
        }
    }
}
