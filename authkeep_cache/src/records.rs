//! Cache record types
//!
//! Records are immutable values once written. Refreshing a token replaces
//! the whole record under its key; nothing is edited in place.

use authkeep_clock::{string_secs, UnixTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    key::{self, CredentialKind, MalformedKey},
    AccessToken, CacheKey, ClientId, Environment, EnvironmentRef, FamilyId, FamilyIdRef,
    HomeAccountId, HomeAccountIdRef, IdToken, LocalAccountId, RefreshToken, ScopeSet, TenantId,
    Username,
};

/// Fields that a record did not recognize, kept so that they survive a
/// round-trip through this cache
pub type ExtraFields = Map<String, Value>;

/// A type that can be stored in the cache under a deterministic key
pub trait Record: Sized {
    /// The kind of record
    const KIND: CredentialKind;

    /// Builds this record's cache key
    fn key(&self) -> Result<CacheKey, MalformedKey>;
}

/// An access token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and not yet due for a proactive refresh
    Fresh,
    /// The token is valid, but should be refreshed
    RefreshDue,
    /// The token is no longer valid
    Expired,
}

/// A cached access token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    /// The account the token was issued to
    pub home_account_id: HomeAccountId,
    /// The issuing environment
    pub environment: Environment,
    /// The client the token was issued to
    pub client_id: ClientId,
    /// The tenant the token is valid in
    #[serde(rename = "realm")]
    pub tenant_id: TenantId,
    /// The scopes granted
    #[serde(rename = "target")]
    pub scopes: ScopeSet,
    /// The token itself
    pub secret: AccessToken,
    /// When the record was written
    #[serde(with = "string_secs")]
    pub cached_at: UnixTime,
    /// When the token stops being valid
    #[serde(rename = "expires_on", with = "string_secs")]
    pub expires_at: UnixTime,
    /// Last-known-good ceiling, when different from `expires_at`
    #[serde(
        default,
        with = "string_secs::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub extended_expires_on: Option<UnixTime>,
    /// Proactive refresh threshold, when different from `expires_at`
    #[serde(
        default,
        with = "string_secs::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_on: Option<UnixTime>,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl AccessTokenRecord {
    /// The proactive refresh threshold, never later than expiry
    pub fn refresh_at(&self) -> UnixTime {
        self.refresh_on
            .unwrap_or(self.expires_at)
            .min(self.expires_at)
    }

    /// The last-known-good ceiling, never earlier than expiry
    pub fn extended_expires_at(&self) -> UnixTime {
        self.extended_expires_on
            .unwrap_or(self.expires_at)
            .max(self.expires_at)
    }

    /// Gets the token's lifetime status as of the provided time
    pub fn status_at(&self, now: UnixTime) -> TokenStatus {
        if now >= self.expires_at {
            TokenStatus::Expired
        } else if now >= self.refresh_at() {
            TokenStatus::RefreshDue
        } else {
            TokenStatus::Fresh
        }
    }

    /// Whether the token is still valid at `now`
    pub fn is_valid_at(&self, now: UnixTime) -> bool {
        now < self.expires_at
    }

    /// Whether the token may still be handed out as a last-known-good
    /// fallback at `now`
    pub fn is_within_extended_lifetime(&self, now: UnixTime) -> bool {
        now < self.extended_expires_at()
    }
}

impl Record for AccessTokenRecord {
    const KIND: CredentialKind = CredentialKind::AccessToken;

    fn key(&self) -> Result<CacheKey, MalformedKey> {
        key::access_token(
            &self.home_account_id,
            &self.environment,
            &self.client_id,
            &self.tenant_id,
            &self.scopes,
        )
    }
}

/// A cached refresh token
///
/// When `family_id` is set, the record is a family refresh token and is
/// keyed by the family rather than by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    /// The account the token was issued to
    pub home_account_id: HomeAccountId,
    /// The issuing environment
    pub environment: Environment,
    /// The client that obtained the token
    pub client_id: ClientId,
    /// The token itself
    pub secret: RefreshToken,
    /// The family this token is shared with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<FamilyId>,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl RefreshTokenRecord {
    /// Whether this is a family refresh token
    pub fn is_family(&self) -> bool {
        self.family_id
            .as_ref()
            .map_or(false, |f| !f.as_str().is_empty())
    }
}

impl Record for RefreshTokenRecord {
    const KIND: CredentialKind = CredentialKind::RefreshToken;

    fn key(&self) -> Result<CacheKey, MalformedKey> {
        match &self.family_id {
            Some(family) if !family.as_str().is_empty() => {
                key::family_refresh_token(&self.home_account_id, &self.environment, family)
            }
            _ => key::refresh_token(&self.home_account_id, &self.environment, &self.client_id),
        }
    }
}

/// A cached ID token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdTokenRecord {
    /// The account the token describes
    pub home_account_id: HomeAccountId,
    /// The issuing environment
    pub environment: Environment,
    /// The client the token was issued to
    pub client_id: ClientId,
    /// The tenant that issued the token
    #[serde(rename = "realm")]
    pub tenant_id: TenantId,
    /// The raw token
    pub secret: IdToken,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Record for IdTokenRecord {
    const KIND: CredentialKind = CredentialKind::IdToken;

    fn key(&self) -> Result<CacheKey, MalformedKey> {
        key::id_token(
            &self.home_account_id,
            &self.environment,
            &self.client_id,
            &self.tenant_id,
        )
    }
}

/// The kind of authority an account was signed in through
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorityType {
    /// A multi-tenant cloud identity provider
    #[default]
    #[serde(rename = "MSSTS")]
    Aad,
    /// An on-premises federation service; never eligible for brokering
    #[serde(rename = "ADFS")]
    Adfs,
    /// A consumer-facing business-to-customer authority
    #[serde(rename = "B2C")]
    B2c,
    /// Any other OpenID Connect authority
    #[serde(rename = "Generic")]
    Generic,
}

/// A signed-in identity within one tenant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// The stable identity across tenants
    pub home_account_id: HomeAccountId,
    /// The issuing environment
    pub environment: Environment,
    /// The tenant of this profile
    #[serde(rename = "realm")]
    pub tenant_id: TenantId,
    /// The identity's id within the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_account_id: Option<LocalAccountId>,
    /// A displayable username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<Username>,
    /// The authority type
    #[serde(default)]
    pub authority_type: AuthorityType,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl AccountRecord {
    /// Whether the account's username matches `login_hint`, ignoring case
    pub fn matches_login_hint(&self, login_hint: &str) -> bool {
        self.username
            .as_ref()
            .map_or(false, |u| u.as_str().eq_ignore_ascii_case(login_hint.trim()))
    }
}

impl Record for AccountRecord {
    const KIND: CredentialKind = CredentialKind::Account;

    fn key(&self) -> Result<CacheKey, MalformedKey> {
        key::account(&self.home_account_id, &self.environment, &self.tenant_id)
    }
}

/// Per-application metadata, most importantly family membership
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppMetadataRecord {
    /// The application
    pub client_id: ClientId,
    /// The environment the metadata applies to
    pub environment: Environment,
    /// The family the app belongs to; empty means confirmed not a member
    #[serde(default)]
    pub family_id: String,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Record for AppMetadataRecord {
    const KIND: CredentialKind = CredentialKind::AppMetadata;

    fn key(&self) -> Result<CacheKey, MalformedKey> {
        key::app_metadata(&self.environment, &self.client_id)
    }
}

/// What the cache knows about an app's membership in a family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FamilyMembership {
    /// No metadata has been recorded yet
    Unknown,
    /// The app is a confirmed member of the family
    Member,
    /// The app is confirmed to not be a member
    NotMember,
}

impl FamilyMembership {
    /// Derives membership in `family` from the app's metadata record
    pub fn from_metadata(metadata: Option<&AppMetadataRecord>, family: &FamilyIdRef) -> Self {
        match metadata {
            None => FamilyMembership::Unknown,
            Some(m) if m.family_id.is_empty() => FamilyMembership::NotMember,
            Some(m) if m.family_id == family.as_str() => FamilyMembership::Member,
            Some(_) => FamilyMembership::NotMember,
        }
    }

    /// Whether a family refresh may be attempted
    pub fn may_attempt(self) -> bool {
        !matches!(self, FamilyMembership::NotMember)
    }
}

/// Any record the cache can hold
#[derive(Clone, Debug, PartialEq)]
pub enum CacheRecord {
    /// An access token
    AccessToken(AccessTokenRecord),
    /// A refresh token
    RefreshToken(RefreshTokenRecord),
    /// An ID token
    IdToken(IdTokenRecord),
    /// An account
    Account(AccountRecord),
    /// Application metadata
    AppMetadata(AppMetadataRecord),
}

impl CacheRecord {
    /// The kind of record
    pub fn kind(&self) -> CredentialKind {
        match self {
            CacheRecord::AccessToken(_) => CredentialKind::AccessToken,
            CacheRecord::RefreshToken(_) => CredentialKind::RefreshToken,
            CacheRecord::IdToken(_) => CredentialKind::IdToken,
            CacheRecord::Account(_) => CredentialKind::Account,
            CacheRecord::AppMetadata(_) => CredentialKind::AppMetadata,
        }
    }

    /// Builds the record's cache key
    pub fn key(&self) -> Result<CacheKey, MalformedKey> {
        match self {
            CacheRecord::AccessToken(r) => r.key(),
            CacheRecord::RefreshToken(r) => r.key(),
            CacheRecord::IdToken(r) => r.key(),
            CacheRecord::Account(r) => r.key(),
            CacheRecord::AppMetadata(r) => r.key(),
        }
    }

    /// The account this record belongs to, if it is account-scoped
    pub fn home_account_id(&self) -> Option<&HomeAccountIdRef> {
        match self {
            CacheRecord::AccessToken(r) => Some(&r.home_account_id),
            CacheRecord::RefreshToken(r) => Some(&r.home_account_id),
            CacheRecord::IdToken(r) => Some(&r.home_account_id),
            CacheRecord::Account(r) => Some(&r.home_account_id),
            CacheRecord::AppMetadata(_) => None,
        }
    }

    /// The environment the record was issued in
    pub fn environment(&self) -> &EnvironmentRef {
        match self {
            CacheRecord::AccessToken(r) => &r.environment,
            CacheRecord::RefreshToken(r) => &r.environment,
            CacheRecord::IdToken(r) => &r.environment,
            CacheRecord::Account(r) => &r.environment,
            CacheRecord::AppMetadata(r) => &r.environment,
        }
    }

    /// Serializes the record to its JSON form
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            CacheRecord::AccessToken(r) => {
                with_credential_type(serde_json::to_value(r)?, "AccessToken")
            }
            CacheRecord::RefreshToken(r) => {
                with_credential_type(serde_json::to_value(r)?, "RefreshToken")
            }
            CacheRecord::IdToken(r) => with_credential_type(serde_json::to_value(r)?, "IdToken"),
            CacheRecord::Account(r) => serde_json::to_value(r),
            CacheRecord::AppMetadata(r) => serde_json::to_value(r),
        }
    }

    /// Deserializes a record of the given kind from its JSON form
    pub fn from_value(kind: CredentialKind, mut value: Value) -> Result<Self, serde_json::Error> {
        if let Value::Object(map) = &mut value {
            map.remove("credential_type");
        }

        Ok(match kind {
            CredentialKind::AccessToken => CacheRecord::AccessToken(serde_json::from_value(value)?),
            CredentialKind::RefreshToken => {
                CacheRecord::RefreshToken(serde_json::from_value(value)?)
            }
            CredentialKind::IdToken => CacheRecord::IdToken(serde_json::from_value(value)?),
            CredentialKind::Account => CacheRecord::Account(serde_json::from_value(value)?),
            CredentialKind::AppMetadata => CacheRecord::AppMetadata(serde_json::from_value(value)?),
        })
    }
}

fn with_credential_type(mut value: Value, credential_type: &str) -> Result<Value, serde_json::Error> {
    if let Value::Object(map) = &mut value {
        map.insert("credential_type".into(), Value::from(credential_type));
    }
    Ok(value)
}

macro_rules! record_conversions {
    ($($variant:ident($ty:ty) => $as:ident, $into:ident;)*) => {
        $(
            impl From<$ty> for CacheRecord {
                fn from(r: $ty) -> Self {
                    CacheRecord::$variant(r)
                }
            }
        )*

        impl CacheRecord {
            $(
                #[doc = concat!("Borrows the record if it is a `", stringify!($ty), "`")]
                pub fn $as(&self) -> Option<&$ty> {
                    match self {
                        CacheRecord::$variant(r) => Some(r),
                        _ => None,
                    }
                }

                #[doc = concat!("Unwraps the record if it is a `", stringify!($ty), "`")]
                pub fn $into(self) -> Option<$ty> {
                    match self {
                        CacheRecord::$variant(r) => Some(r),
                        _ => None,
                    }
                }
            )*
        }
    };
}

record_conversions! {
    AccessToken(AccessTokenRecord) => as_access_token, into_access_token;
    RefreshToken(RefreshTokenRecord) => as_refresh_token, into_refresh_token;
    IdToken(IdTokenRecord) => as_id_token, into_id_token;
    Account(AccountRecord) => as_account, into_account;
    AppMetadata(AppMetadataRecord) => as_app_metadata, into_app_metadata;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const HOME: &str = "uid.utid";
    pub const ENV: &str = "login.example.com";
    pub const CLIENT: &str = "client-a";
    pub const TENANT: &str = "utid";

    pub fn access_token(scopes: &str, expires_at: u64) -> AccessTokenRecord {
        AccessTokenRecord {
            home_account_id: HOME.into(),
            environment: ENV.into(),
            client_id: CLIENT.into(),
            tenant_id: TENANT.into(),
            scopes: ScopeSet::parse(scopes),
            secret: AccessToken::from(format!("at-{}-{}", scopes, expires_at)),
            cached_at: UnixTime(0),
            expires_at: UnixTime(expires_at),
            extended_expires_on: None,
            refresh_on: None,
            extra: ExtraFields::new(),
        }
    }

    pub fn refresh_token(client: &str, family: Option<&str>) -> RefreshTokenRecord {
        RefreshTokenRecord {
            home_account_id: HOME.into(),
            environment: ENV.into(),
            client_id: client.into(),
            secret: RefreshToken::from(format!("rt-{}", client)),
            family_id: family.map(FamilyId::from),
            extra: ExtraFields::new(),
        }
    }

    pub fn account(username: &str) -> AccountRecord {
        AccountRecord {
            home_account_id: HOME.into(),
            environment: ENV.into(),
            tenant_id: TENANT.into(),
            local_account_id: Some("oid".into()),
            username: Some(username.into()),
            authority_type: AuthorityType::Aad,
            extra: ExtraFields::new(),
        }
    }
}
