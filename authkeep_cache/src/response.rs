//! Turning token endpoint responses into cache records

use authkeep_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{
    claims::{ClientInfo, IdTokenClaims},
    records::{
        AccessTokenRecord, AccountRecord, AppMetadataRecord, AuthorityType, ExtraFields,
        IdTokenRecord, RefreshTokenRecord,
    },
    AccessToken, ClientIdRef, EnvironmentRef, FamilyId, HomeAccountIdRef, IdToken, RefreshToken,
    ScopeSet, TenantIdRef,
};

/// Tokens with at least this lifetime are proactively refreshed half way
/// through it when the server gives no explicit refresh hint
pub const HALF_LIFE_REFRESH_THRESHOLD: DurationSecs = DurationSecs(2 * 60 * 60);

/// A successful token endpoint response
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The access token
    pub access_token: AccessToken,
    /// The token type, usually `Bearer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// The ID token, if `openid` was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
    /// A new or rotated refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    /// The access token lifetime
    #[serde(deserialize_with = "authkeep_clock::string_secs::duration::deserialize")]
    pub expires_in: DurationSecs,
    /// The lifetime during which the token may serve as a fallback
    #[serde(
        default,
        deserialize_with = "authkeep_clock::string_secs::duration::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub ext_expires_in: Option<DurationSecs>,
    /// When the server would like the token refreshed
    #[serde(
        default,
        deserialize_with = "authkeep_clock::string_secs::duration::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_in: Option<DurationSecs>,
    /// The scopes granted, when they differ from those requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// The family the client belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foci: Option<FamilyId>,
    /// The encoded `client_info` blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
}

/// Where a response came from and what was asked for
#[derive(Clone, Copy, Debug)]
pub struct ResponseContext<'a> {
    /// The issuing environment
    pub environment: &'a EnvironmentRef,
    /// The requesting client
    pub client_id: &'a ClientIdRef,
    /// The tenant the request was made against
    pub tenant_id: &'a TenantIdRef,
    /// The scopes requested
    pub requested_scopes: &'a ScopeSet,
    /// The account the request was made for, if already known
    pub home_account_id: Option<&'a HomeAccountIdRef>,
    /// The kind of authority
    pub authority_type: AuthorityType,
}

/// The records derived from one token response
#[derive(Clone, Debug)]
pub struct ResponseRecords {
    /// The new access token
    pub access_token: AccessTokenRecord,
    /// The new or rotated refresh token
    pub refresh_token: Option<RefreshTokenRecord>,
    /// The new ID token
    pub id_token: Option<IdTokenRecord>,
    /// The account described by the ID token
    pub account: Option<AccountRecord>,
    /// The client's family membership as reported by this response
    pub app_metadata: AppMetadataRecord,
}

impl TokenResponse {
    /// Computes when the access token should be refreshed
    pub fn refresh_at(&self, now: UnixTime) -> UnixTime {
        let expires_at = now + self.expires_in;
        let refresh_at = match self.refresh_in {
            Some(refresh_in) => now + refresh_in,
            None if self.expires_in >= HALF_LIFE_REFRESH_THRESHOLD => now + self.expires_in.half(),
            None => expires_at,
        };
        refresh_at.min(expires_at)
    }

    /// Computes the last-known-good ceiling of the access token
    pub fn extended_expires_at(&self, now: UnixTime) -> UnixTime {
        let expires_at = now + self.expires_in;
        self.ext_expires_in
            .map_or(expires_at, |ext| now + ext)
            .max(expires_at)
    }

    /// Derives the records to cache from this response
    ///
    /// Returns `None` when neither the response nor the context identifies
    /// the account.
    pub fn into_records(self, ctx: &ResponseContext<'_>, now: UnixTime) -> Option<ResponseRecords> {
        let home_account_id = self
            .client_info
            .as_deref()
            .and_then(ClientInfo::decode)
            .map(|info| info.home_account_id())
            .or_else(|| ctx.home_account_id.map(ToOwned::to_owned))?;

        let claims = self.id_token.as_ref().and_then(|t| IdTokenClaims::decode(t));
        let tenant_id = claims
            .as_ref()
            .and_then(IdTokenClaims::tenant_id)
            .unwrap_or_else(|| ctx.tenant_id.to_owned());

        let granted = self
            .scope
            .as_deref()
            .map(|s| ScopeSet::parse(s).without_reserved())
            .filter(|s| !s.is_empty());
        let scopes = granted.unwrap_or_else(|| ctx.requested_scopes.without_reserved());

        let refresh_at = self.refresh_at(now);
        let expires_at = now + self.expires_in;
        let extended_expires_at = self.extended_expires_at(now);

        let family_id = self.foci.filter(|f| !f.as_str().is_empty());

        let access_token = AccessTokenRecord {
            home_account_id: home_account_id.clone(),
            environment: ctx.environment.to_owned(),
            client_id: ctx.client_id.to_owned(),
            tenant_id: tenant_id.clone(),
            scopes,
            secret: self.access_token,
            cached_at: now,
            expires_at,
            extended_expires_on: Some(extended_expires_at).filter(|&t| t != expires_at),
            refresh_on: Some(refresh_at).filter(|&t| t != expires_at),
            extra: ExtraFields::new(),
        };

        let refresh_token = self.refresh_token.map(|secret| RefreshTokenRecord {
            home_account_id: home_account_id.clone(),
            environment: ctx.environment.to_owned(),
            client_id: ctx.client_id.to_owned(),
            secret,
            family_id: family_id.clone(),
            extra: ExtraFields::new(),
        });

        let account = claims.as_ref().map(|claims| AccountRecord {
            home_account_id: home_account_id.clone(),
            environment: ctx.environment.to_owned(),
            tenant_id: tenant_id.clone(),
            local_account_id: claims.local_account_id(),
            username: claims.username(),
            authority_type: ctx.authority_type,
            extra: ExtraFields::new(),
        });

        let id_token = self.id_token.map(|secret| IdTokenRecord {
            home_account_id: home_account_id.clone(),
            environment: ctx.environment.to_owned(),
            client_id: ctx.client_id.to_owned(),
            tenant_id,
            secret,
            extra: ExtraFields::new(),
        });

        let app_metadata = AppMetadataRecord {
            client_id: ctx.client_id.to_owned(),
            environment: ctx.environment.to_owned(),
            family_id: family_id.map(|f| f.as_str().to_owned()).unwrap_or_default(),
            extra: ExtraFields::new(),
        };

        Some(ResponseRecords {
            access_token,
            refresh_token,
            id_token,
            account,
            app_metadata,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::claims::encode_segment;

    pub fn client_info(uid: &str, utid: &str) -> String {
        encode_segment(&serde_json::json!({ "uid": uid, "utid": utid }))
    }

    pub fn id_token(username: &str, tid: &str) -> IdToken {
        let payload = encode_segment(&serde_json::json!({
            "oid": "oid",
            "tid": tid,
            "preferred_username": username,
        }));
        IdToken::new(format!("e30.{}.sig", payload))
    }

    pub fn response(expires_in: u64) -> TokenResponse {
        TokenResponse {
            access_token: AccessToken::from("new-at"),
            token_type: Some("Bearer".into()),
            id_token: Some(id_token("user@example.com", "utid")),
            refresh_token: Some(RefreshToken::from("new-rt")),
            expires_in: DurationSecs(expires_in),
            ext_expires_in: None,
            refresh_in: None,
            scope: None,
            foci: None,
            client_info: Some(client_info("uid", "utid")),
        }
    }
}
