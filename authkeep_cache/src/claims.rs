//! Unverified decoding of identity blobs returned alongside tokens
//!
//! The cache only needs a handful of identifiers out of these blobs to build
//! its keys. Signatures are not checked here; the tokens were received
//! directly from the authority over TLS.

use aliri_base64::Base64Url;
use serde::Deserialize;

use crate::{HomeAccountId, IdTokenRef, LocalAccountId, TenantId, Username};

/// The `client_info` blob, which identifies the home account
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    /// Object id in the home tenant
    pub uid: String,
    /// Home tenant id
    pub utid: String,
}

impl ClientInfo {
    /// Decodes a base64url-encoded `client_info` JSON blob
    pub fn decode(encoded: &str) -> Option<Self> {
        let raw = Base64Url::from_encoded(encoded.trim_end_matches('=')).ok()?;
        match serde_json::from_slice::<ClientInfo>(raw.as_slice()) {
            Ok(info) if !info.uid.is_empty() && !info.utid.is_empty() => Some(info),
            Ok(_) => None,
            Err(error) => {
                tracing::debug!(%error, "client_info is not valid JSON");
                None
            }
        }
    }

    /// The home account id, `{uid}.{utid}`
    pub fn home_account_id(&self) -> HomeAccountId {
        HomeAccountId::new(format!("{}.{}", self.uid, self.utid))
    }
}

/// The subset of ID token claims that the cache records
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct IdTokenClaims {
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Object id of the identity within the issuing tenant
    #[serde(default)]
    pub oid: Option<String>,
    /// Issuing tenant
    #[serde(default)]
    pub tid: Option<String>,
    /// The preferred, displayable username
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Used by on-premises authorities in place of `preferred_username`
    #[serde(default)]
    pub upn: Option<String>,
    /// Email address
    #[serde(default)]
    pub email: Option<String>,
}

impl IdTokenClaims {
    /// Decodes the payload of a compact-serialized ID token
    pub fn decode(id_token: &IdTokenRef) -> Option<Self> {
        let payload = id_token.as_str().split('.').nth(1)?;
        let raw = Base64Url::from_encoded(payload).ok()?;
        match serde_json::from_slice(raw.as_slice()) {
            Ok(claims) => Some(claims),
            Err(error) => {
                tracing::debug!(%error, "ID token payload is not valid JSON");
                None
            }
        }
    }

    /// The best available username
    pub fn username(&self) -> Option<Username> {
        self.preferred_username
            .as_deref()
            .or(self.upn.as_deref())
            .or(self.email.as_deref())
            .map(Username::from)
    }

    /// The identity's id within the tenant
    pub fn local_account_id(&self) -> Option<LocalAccountId> {
        self.oid
            .as_deref()
            .or(self.sub.as_deref())
            .map(LocalAccountId::from)
    }

    /// The issuing tenant
    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tid.as_deref().map(TenantId::from)
    }
}

#[cfg(test)]
pub(crate) fn encode_segment(json: &serde_json::Value) -> String {
    Base64Url::from_raw(serde_json::to_vec(json).unwrap()).to_string()
}
