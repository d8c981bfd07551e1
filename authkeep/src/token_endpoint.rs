//! Exchanging refresh tokens at an OAuth2 token endpoint

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use authkeep_cache::{response::TokenResponse, ClientId, RefreshToken, ScopeSet};
use authkeep_clock::{Clock, System};
use http::{HeaderValue, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    error::{AcquireError, ClientErrorKind, ServiceError},
    network::{HttpRequest, NetworkClient},
    retry::{send_with_retry, RetryPolicy},
};

/// Header carrying the request's correlation id
pub const CLIENT_REQUEST_ID: &str = "client-request-id";

/// Header asking the server to echo the correlation id
pub const RETURN_CLIENT_REQUEST_ID: &str = "return-client-request-id";

/// Query and form parameters this library sets itself
pub const RESERVED_PARAMETERS: [&str; 7] = [
    "grant_type",
    "client_id",
    "refresh_token",
    "scope",
    "claims",
    "client_info",
    "redirect_uri",
];

/// A `refresh_token` grant
#[derive(Clone, Debug)]
pub struct RefreshTokenGrant {
    /// The client redeeming the token
    pub client_id: ClientId,
    /// The refresh token to redeem
    pub refresh_token: RefreshToken,
    /// The scopes requested, without the reserved OpenID Connect scopes
    pub scopes: ScopeSet,
    /// A claims challenge to satisfy
    pub claims: Option<String>,
    /// Correlates this exchange with the caller's request
    pub correlation_id: Uuid,
    /// Parameters appended to the token endpoint's query
    pub extra_query_parameters: Vec<(String, String)>,
}

impl RefreshTokenGrant {
    fn form_body(&self) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "refresh_token")
            .append_pair("client_id", self.client_id.as_str())
            .append_pair("refresh_token", self.refresh_token.as_str())
            .append_pair("scope", &self.scopes.with_reserved().joined())
            .append_pair("client_info", "1");
        if let Some(claims) = &self.claims {
            form.append_pair("claims", claims);
        }
        form.finish()
    }
}

/// Redeems grants at a token endpoint
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges a refresh token for new tokens
    async fn exchange_refresh_token(
        &self,
        token_url: &Url,
        grant: RefreshTokenGrant,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, AcquireError>;
}

/// An error body from an OAuth2 token endpoint
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    suberror: Option<String>,
}

/// A token endpoint reached over HTTP
pub struct OAuth2TokenEndpoint {
    network: Arc<dyn NetworkClient>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for OAuth2TokenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2TokenEndpoint")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl OAuth2TokenEndpoint {
    /// Constructs a token endpoint client
    pub fn new(network: Arc<dyn NetworkClient>, retry: RetryPolicy) -> Self {
        Self {
            network,
            retry,
            clock: Arc::new(System),
        }
    }

    /// Uses `clock` to interpret `Retry-After` dates
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl TokenEndpoint for OAuth2TokenEndpoint {
    #[tracing::instrument(
        err,
        skip(self, token_url, grant, cancel),
        fields(
            client_id = %grant.client_id,
            correlation_id = %grant.correlation_id,
        ),
    )]
    async fn exchange_refresh_token(
        &self,
        token_url: &Url,
        grant: RefreshTokenGrant,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, AcquireError> {
        let mut url = token_url.clone();
        if !grant.extra_query_parameters.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(grant.extra_query_parameters.iter());
        }

        let mut request = HttpRequest::post_form(url, grant.form_body());
        let correlation_id = HeaderValue::from_str(&grant.correlation_id.to_string())
            .map_err(|e| AcquireError::client_with_source(ClientErrorKind::InvalidRequest, e))?;
        request.headers.insert(CLIENT_REQUEST_ID, correlation_id);
        request
            .headers
            .insert(RETURN_CLIENT_REQUEST_ID, HeaderValue::from_static("true"));

        let response =
            send_with_retry(&*self.network, request, &self.retry, &*self.clock, cancel).await?;

        if response.status.is_success() {
            let tokens: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
                AcquireError::client_with_source(ClientErrorKind::InvalidResponse, e)
            })?;
            tracing::debug!("token endpoint issued new tokens");
            return Ok(tokens);
        }

        Err(classify_error(response.status, &response.body).into())
    }
}

fn classify_error(status: StatusCode, body: &[u8]) -> ServiceError {
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;

    let err = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(body) => {
            let retryable = retryable || body.error == "temporarily_unavailable";
            let mut err = ServiceError::new(body.error, retryable);
            if let Some(description) = body.error_description {
                err = err.with_description(description);
            }
            if let Some(sub_error) = body.suberror {
                err = err.with_sub_error(sub_error);
            }
            err
        }
        Err(_) => ServiceError::new("http_error", retryable)
            .with_description(format!("token endpoint returned {}", status)),
    };

    tracing::warn!(
        status = status.as_u16(),
        code = %err.code,
        sub_error = err.sub_error.as_deref(),
        "token endpoint rejected the grant"
    );
    err.with_status(status.as_u16())
}
