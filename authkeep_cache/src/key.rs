//! Deterministic composite cache keys
//!
//! Every key is built from record fields in a fixed order, joined by
//! [`DELIMITER`] and lower-cased. Two logically equal lookups therefore
//! always produce byte-identical keys, whatever order the requested scopes
//! were given in.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    CacheKey, ClientIdRef, EnvironmentRef, FamilyIdRef, HomeAccountIdRef, ScopeSet, TenantIdRef,
};

/// The reserved delimiter between key segments
pub const DELIMITER: char = '-';

/// The kind of record a key addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CredentialKind {
    /// An access token
    AccessToken,
    /// A refresh token, including family refresh tokens
    RefreshToken,
    /// An ID token
    IdToken,
    /// An account
    Account,
    /// Application metadata, including family membership
    AppMetadata,
}

impl CredentialKind {
    /// All record kinds, in serialization order
    pub const ALL: [CredentialKind; 5] = [
        CredentialKind::AccessToken,
        CredentialKind::RefreshToken,
        CredentialKind::IdToken,
        CredentialKind::Account,
        CredentialKind::AppMetadata,
    ];

    /// The section name used by the partitioned blob format
    pub const fn section(self) -> &'static str {
        match self {
            CredentialKind::AccessToken => "AccessToken",
            CredentialKind::RefreshToken => "RefreshToken",
            CredentialKind::IdToken => "IdToken",
            CredentialKind::Account => "Account",
            CredentialKind::AppMetadata => "AppMetadata",
        }
    }

    const fn segment(self) -> &'static str {
        match self {
            CredentialKind::AccessToken => "accesstoken",
            CredentialKind::RefreshToken => "refreshtoken",
            CredentialKind::IdToken => "idtoken",
            CredentialKind::Account => "account",
            CredentialKind::AppMetadata => "appmetadata",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

/// A required key field was missing or empty
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("cannot build {kind} cache key: `{field}` is empty")]
pub struct MalformedKey {
    kind: CredentialKind,
    field: &'static str,
}

impl MalformedKey {
    /// The kind of key that was being built
    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// The name of the offending field
    pub fn field(&self) -> &'static str {
        self.field
    }
}

struct KeyBuilder {
    kind: CredentialKind,
    buf: String,
}

impl KeyBuilder {
    fn new(kind: CredentialKind) -> Self {
        Self {
            kind,
            buf: String::with_capacity(128),
        }
    }

    fn required(mut self, field: &'static str, value: &str) -> Result<Self, MalformedKey> {
        let value = value.trim();
        if value.is_empty() {
            return Err(MalformedKey {
                kind: self.kind,
                field,
            });
        }
        self.push(value);
        Ok(self)
    }

    fn literal(mut self, value: &str) -> Self {
        self.push(value);
        self
    }

    fn push(&mut self, value: &str) {
        if !self.buf.is_empty() {
            self.buf.push(DELIMITER);
        }
        self.buf.push_str(value);
    }

    /// Appends the trailing delimiters for segments that are empty by design
    fn empty(mut self) -> Self {
        self.buf.push(DELIMITER);
        self
    }

    fn finish(self) -> CacheKey {
        CacheKey::new(self.buf.to_lowercase())
    }
}

/// Builds the key of an access token
pub fn access_token(
    home_account_id: &HomeAccountIdRef,
    environment: &EnvironmentRef,
    client_id: &ClientIdRef,
    tenant_id: &TenantIdRef,
    scopes: &ScopeSet,
) -> Result<CacheKey, MalformedKey> {
    let kind = CredentialKind::AccessToken;
    Ok(KeyBuilder::new(kind)
        .required("home_account_id", home_account_id.as_str())?
        .required("environment", environment.as_str())?
        .literal(kind.segment())
        .required("client_id", client_id.as_str())?
        .required("tenant_id", tenant_id.as_str())?
        .required("scopes", &scopes.joined())?
        .finish())
}

/// Builds the key of an application's own refresh token
pub fn refresh_token(
    home_account_id: &HomeAccountIdRef,
    environment: &EnvironmentRef,
    client_id: &ClientIdRef,
) -> Result<CacheKey, MalformedKey> {
    let kind = CredentialKind::RefreshToken;
    Ok(KeyBuilder::new(kind)
        .required("home_account_id", home_account_id.as_str())?
        .required("environment", environment.as_str())?
        .literal(kind.segment())
        .required("client_id", client_id.as_str())?
        .empty()
        .empty()
        .finish())
}

/// Builds the key of a family refresh token
///
/// The family identifier takes the place of the client ID, which is what
/// lets every member of the family find the same record.
pub fn family_refresh_token(
    home_account_id: &HomeAccountIdRef,
    environment: &EnvironmentRef,
    family_id: &FamilyIdRef,
) -> Result<CacheKey, MalformedKey> {
    let kind = CredentialKind::RefreshToken;
    Ok(KeyBuilder::new(kind)
        .required("home_account_id", home_account_id.as_str())?
        .required("environment", environment.as_str())?
        .literal(kind.segment())
        .required("family_id", family_id.as_str())?
        .empty()
        .empty()
        .finish())
}

/// Builds the key of an ID token
pub fn id_token(
    home_account_id: &HomeAccountIdRef,
    environment: &EnvironmentRef,
    client_id: &ClientIdRef,
    tenant_id: &TenantIdRef,
) -> Result<CacheKey, MalformedKey> {
    let kind = CredentialKind::IdToken;
    Ok(KeyBuilder::new(kind)
        .required("home_account_id", home_account_id.as_str())?
        .required("environment", environment.as_str())?
        .literal(kind.segment())
        .required("client_id", client_id.as_str())?
        .required("tenant_id", tenant_id.as_str())?
        .empty()
        .finish())
}

/// Builds the key of an account
pub fn account(
    home_account_id: &HomeAccountIdRef,
    environment: &EnvironmentRef,
    tenant_id: &TenantIdRef,
) -> Result<CacheKey, MalformedKey> {
    Ok(KeyBuilder::new(CredentialKind::Account)
        .required("home_account_id", home_account_id.as_str())?
        .required("environment", environment.as_str())?
        .required("tenant_id", tenant_id.as_str())?
        .finish())
}

/// Builds the key of an application's metadata
pub fn app_metadata(
    environment: &EnvironmentRef,
    client_id: &ClientIdRef,
) -> Result<CacheKey, MalformedKey> {
    let kind = CredentialKind::AppMetadata;
    Ok(KeyBuilder::new(kind)
        .literal(kind.segment())
        .required("environment", environment.as_str())?
        .required("client_id", client_id.as_str())?
        .finish())
}
