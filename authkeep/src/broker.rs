//! The contract with a platform authentication broker
//!
//! Brokers speak in flat string maps. [`BrokerRequest`] builds the request
//! map and [`BrokerTokens::from_payload`] interprets the response, mapping
//! broker status codes onto [`AcquireError`].

use std::{collections::BTreeMap, error};

use aliri_braid::braid;
use async_trait::async_trait;
use authkeep_cache::{
    records::AuthorityType, AccessToken, ClientIdRef, HomeAccountId, HomeAccountIdRef, IdToken,
    ScopeSet, TenantId, Username, UsernameRef,
};
use authkeep_clock::{DurationSecs, UnixTime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AcquireError, ClientErrorKind, ServiceError, UiRequiredReason};

/// A flat string map exchanged with the broker
pub type BrokerPayload = BTreeMap<String, String>;

/// Keys used in broker payloads
pub mod keys {
    /// The authority URL
    pub const AUTHORITY: &str = "authority";
    /// Space-separated scopes
    pub const SCOPES: &str = "scopes";
    /// The requesting client
    pub const CLIENT_ID: &str = "client_id";
    /// The request's correlation id, echoed in responses
    pub const CORRELATION_ID: &str = "correlation_id";
    /// The application's redirect URI
    pub const REDIRECT_URI: &str = "redirect_uri";
    /// Extra query parameters, form-encoded
    pub const EXTRA_QUERY_PARAMETERS: &str = "extra_query_parameters";
    /// The username of the target account
    pub const USERNAME: &str = "username";
    /// The prompt behavior; always `none` for silent requests
    pub const PROMPT: &str = "prompt";
    /// A claims challenge
    pub const CLAIMS: &str = "claims";
    /// The issued access token
    pub const ACCESS_TOKEN: &str = "access_token";
    /// Expiry of the access token in Unix seconds
    pub const EXPIRES_ON: &str = "expires_on";
    /// Lifetime of the access token in seconds
    pub const EXPIRES_IN: &str = "expires_in";
    /// Extended expiry of the access token in Unix seconds
    pub const EXTENDED_EXPIRES_ON: &str = "extended_expires_on";
    /// The issued ID token
    pub const ID_TOKEN: &str = "id_token";
    /// The tenant the token was issued in
    pub const TENANT_ID: &str = "tenant_id";
    /// The home account id of the signed-in account
    pub const HOME_ACCOUNT_ID: &str = "home_account_id";
    /// The broker's status code on failure
    pub const ERROR: &str = "error";
    /// A description of the failure
    pub const ERROR_DESCRIPTION: &str = "error_description";
}

/// The broker's own handle for an account
#[braid(serde)]
pub struct BrokerAccountId;

/// Whom the broker should acquire a token for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerTarget {
    /// The account signed in to the operating system
    OperatingSystemAccount,
    /// A specific account known to the broker
    Account(BrokerAccountId),
}

/// The broker could not be reached
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Communication with the broker failed
    #[error("broker communication failed")]
    Communication(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The caller cancelled the call
    #[error("broker call was cancelled")]
    Cancelled,
}

impl From<BrokerError> for AcquireError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Cancelled => AcquireError::Cancelled,
            BrokerError::Communication(source) => AcquireError::Service(
                ServiceError::new("broker_unavailable", false).with_description(source.to_string()),
            ),
        }
    }
}

/// A platform authentication broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Whether the broker is present and can serve this kind of authority
    fn is_broker_installed_and_invokable(&self, authority_type: AuthorityType) -> bool;

    /// Resolves the broker's handle for an account
    async fn find_account(
        &self,
        home_account_id: &HomeAccountIdRef,
        cancel: &CancellationToken,
    ) -> Result<Option<BrokerAccountId>, BrokerError>;

    /// Acquires a token without prompting
    ///
    /// `None` means the broker cannot satisfy the request silently.
    async fn acquire_token_silently(
        &self,
        payload: BrokerPayload,
        target: BrokerTarget,
        cancel: &CancellationToken,
    ) -> Result<Option<BrokerPayload>, BrokerError>;
}

/// A silent request as sent to the broker
#[derive(Clone, Debug)]
pub struct BrokerRequest<'a> {
    /// The authority URL
    pub authority: String,
    /// The requested scopes
    pub scopes: &'a ScopeSet,
    /// The requesting client
    pub client_id: &'a ClientIdRef,
    /// The request's correlation id
    pub correlation_id: Uuid,
    /// The application's redirect URI
    pub redirect_uri: Option<&'a str>,
    /// Extra query parameters
    pub extra_query_parameters: &'a [(String, String)],
    /// The username of the target account
    pub username: Option<&'a UsernameRef>,
    /// A claims challenge
    pub claims: Option<&'a str>,
}

impl BrokerRequest<'_> {
    /// Builds the request payload
    pub fn to_payload(&self) -> BrokerPayload {
        let mut payload = BrokerPayload::new();
        payload.insert(keys::AUTHORITY.into(), self.authority.clone());
        payload.insert(keys::SCOPES.into(), self.scopes.with_reserved().joined());
        payload.insert(keys::CLIENT_ID.into(), self.client_id.as_str().into());
        payload.insert(keys::CORRELATION_ID.into(), self.correlation_id.to_string());
        payload.insert(keys::PROMPT.into(), "none".into());
        if let Some(redirect_uri) = self.redirect_uri {
            payload.insert(keys::REDIRECT_URI.into(), redirect_uri.into());
        }
        if !self.extra_query_parameters.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.extra_query_parameters.iter())
                .finish();
            payload.insert(keys::EXTRA_QUERY_PARAMETERS.into(), encoded);
        }
        if let Some(username) = self.username {
            payload.insert(keys::USERNAME.into(), username.as_str().into());
        }
        if let Some(claims) = self.claims {
            payload.insert(keys::CLAIMS.into(), claims.into());
        }
        payload
    }
}

/// Tokens issued by the broker
#[derive(Clone, Debug)]
pub struct BrokerTokens {
    /// The access token
    pub access_token: AccessToken,
    /// When the access token expires
    pub expires_at: UnixTime,
    /// Until when the token may serve as a fallback
    pub extended_expires_at: UnixTime,
    /// The granted scopes
    pub scopes: ScopeSet,
    /// The tenant the token was issued in
    pub tenant_id: Option<TenantId>,
    /// The ID token, if any
    pub id_token: Option<IdToken>,
    /// The signed-in account
    pub home_account_id: Option<HomeAccountId>,
    /// The signed-in account's username
    pub username: Option<Username>,
}

impl BrokerTokens {
    /// Interprets a broker response
    ///
    /// A response carrying an access token is a success. Otherwise its
    /// status code decides the error. A response for a different correlation
    /// id is rejected.
    pub fn from_payload(
        mut payload: BrokerPayload,
        correlation_id: Uuid,
        requested: &ScopeSet,
        now: UnixTime,
    ) -> Result<Self, AcquireError> {
        if let Some(echoed) = payload.get(keys::CORRELATION_ID) {
            if echoed.parse::<Uuid>().ok() != Some(correlation_id) {
                tracing::warn!(%echoed, "broker response has a foreign correlation id");
                return Err(AcquireError::client(ClientErrorKind::StateMismatch));
            }
        }

        let access_token = match payload.remove(keys::ACCESS_TOKEN).filter(|t| !t.is_empty()) {
            Some(token) => AccessToken::new(token),
            None => return Err(status_error(&payload)),
        };

        let secs = |key: &str| payload.get(key).and_then(|v| v.trim().parse::<u64>().ok());
        let expires_at = match (secs(keys::EXPIRES_ON), secs(keys::EXPIRES_IN)) {
            (Some(on), _) => UnixTime(on),
            (None, Some(lifetime)) => now + DurationSecs(lifetime),
            (None, None) => {
                return Err(AcquireError::client_with_source(
                    ClientErrorKind::InvalidResponse,
                    "broker response has no expiry",
                ))
            }
        };
        let extended_expires_at = secs(keys::EXTENDED_EXPIRES_ON)
            .map(UnixTime)
            .map_or(expires_at, |ext| ext.max(expires_at));

        let scopes = payload
            .get(keys::SCOPES)
            .map(|s| ScopeSet::parse(s).without_reserved())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| requested.without_reserved());

        Ok(Self {
            access_token,
            expires_at,
            extended_expires_at,
            scopes,
            tenant_id: payload.remove(keys::TENANT_ID).map(TenantId::new),
            id_token: payload.remove(keys::ID_TOKEN).map(IdToken::new),
            home_account_id: payload.remove(keys::HOME_ACCOUNT_ID).map(HomeAccountId::new),
            username: payload.remove(keys::USERNAME).map(Username::new),
        })
    }
}

fn status_error(payload: &BrokerPayload) -> AcquireError {
    let code = payload
        .get(keys::ERROR)
        .map(String::as_str)
        .unwrap_or("unknown_broker_error");
    let description = payload.get(keys::ERROR_DESCRIPTION).cloned();
    let mut err = ServiceError::new(code, false);
    if let Some(description) = description {
        err = err.with_description(description);
    }

    tracing::debug!(code, "broker declined the request");

    match code {
        "user_interaction_required" | "interaction_required" => AcquireError::UiRequired {
            reason: UiRequiredReason::PromptNeverFailed,
            source: Some(err),
        },
        "account_unusable" | "account_not_found" => AcquireError::UiRequired {
            reason: UiRequiredReason::AccountUnusable,
            source: Some(err),
        },
        "no_network" | "network_temporarily_unavailable" | "server_temporarily_unavailable" => {
            err.retryable = true;
            AcquireError::Service(err)
        }
        _ => AcquireError::Service(err),
    }
}
