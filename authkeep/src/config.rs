//! Configuration of the silent acquisition pipeline

use authkeep_cache::{
    records::AuthorityType, ClientId, Environment, EnvironmentRef, FamilyId, TenantId, TenantIdRef,
};
use authkeep_clock::DurationSecs;
use serde::Deserialize;
use url::Url;

use crate::retry::RetryPolicy;

/// Tenants that stand for "whichever tenant the account belongs to"
const TENANTLESS: [&str; 3] = ["common", "organizations", "consumers"];

/// An identity provider authority
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Authority {
    environment: Environment,
    tenant: TenantId,
    #[serde(default)]
    authority_type: AuthorityType,
    #[serde(default)]
    token_endpoint: Option<Url>,
}

impl Authority {
    /// An authority for a tenant in an environment
    pub fn new(environment: impl Into<Environment>, tenant: impl Into<TenantId>) -> Self {
        Self {
            environment: environment.into(),
            tenant: tenant.into(),
            authority_type: AuthorityType::default(),
            token_endpoint: None,
        }
    }

    /// Parses an authority URL of the form `https://{host}/{tenant}`
    ///
    /// URLs whose first path segment is `adfs` are federation services.
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_ascii_lowercase();
        let tenant = url
            .path_segments()
            .and_then(|mut s| s.next())
            .filter(|s| !s.is_empty())?;
        let authority = Self::new(host, tenant.to_owned());
        Some(if tenant.eq_ignore_ascii_case("adfs") {
            authority.with_authority_type(AuthorityType::Adfs)
        } else {
            authority
        })
    }

    /// Sets the authority type
    pub fn with_authority_type(mut self, authority_type: AuthorityType) -> Self {
        self.authority_type = authority_type;
        self
    }

    /// Overrides the token endpoint
    pub fn with_token_endpoint(mut self, token_endpoint: Url) -> Self {
        self.token_endpoint = Some(token_endpoint);
        self
    }

    /// The issuing host
    pub fn environment(&self) -> &EnvironmentRef {
        &self.environment
    }

    /// The configured tenant
    pub fn tenant(&self) -> &TenantIdRef {
        &self.tenant
    }

    /// The authority type
    pub fn authority_type(&self) -> AuthorityType {
        self.authority_type
    }

    /// Whether the tenant is a placeholder resolved per account
    pub fn is_tenantless(&self) -> bool {
        TENANTLESS
            .iter()
            .any(|t| t.eq_ignore_ascii_case(self.tenant.as_str()))
    }

    /// The authority URL for a tenant
    pub fn url_for(&self, tenant: &TenantIdRef) -> String {
        format!("https://{}/{}", self.environment, tenant)
    }

    /// The token endpoint to use for a tenant
    pub fn token_endpoint(&self, tenant: &TenantIdRef) -> Result<Url, url::ParseError> {
        if let Some(url) = &self.token_endpoint {
            return Ok(url.clone());
        }
        match self.authority_type {
            AuthorityType::Adfs => format!("https://{}/adfs/oauth2/token", self.environment),
            _ => format!("https://{}/{}/oauth2/v2.0/token", self.environment, tenant),
        }
        .parse()
    }
}

/// Configuration for a [`SilentClient`][crate::SilentClient]
#[derive(Clone, Debug, Deserialize)]
pub struct SilentConfig {
    /// The application's client ID
    pub client_id: ClientId,
    /// The authority tokens are acquired from
    pub authority: Authority,
    /// The application's redirect URI, passed to the broker
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Whether family refresh tokens may be used
    #[serde(default = "default_true")]
    pub family_tokens_enabled: bool,
    /// The family this application may belong to
    #[serde(default = "default_family_id")]
    pub family_id: FamilyId,
    /// Whether a configured broker should be used
    #[serde(default)]
    pub broker_enabled: bool,
    /// How far ahead of the refresh time a proactive refresh may start
    #[serde(default = "default_jitter_window")]
    pub jitter_window: DurationSecs,
    /// The retry policy for token endpoint calls
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool {
    true
}

fn default_family_id() -> FamilyId {
    FamilyId::from("1")
}

fn default_jitter_window() -> DurationSecs {
    DurationSecs(300)
}

impl SilentConfig {
    /// A configuration with defaults for everything but the client and
    /// authority
    pub fn new(client_id: impl Into<ClientId>, authority: Authority) -> Self {
        Self {
            client_id: client_id.into(),
            authority,
            redirect_uri: None,
            family_tokens_enabled: true,
            family_id: default_family_id(),
            broker_enabled: false,
            jitter_window: default_jitter_window(),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the redirect URI
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    /// Enables or disables family refresh tokens
    pub fn with_family_tokens(mut self, enabled: bool) -> Self {
        self.family_tokens_enabled = enabled;
        self
    }

    /// Sets the family ID
    pub fn with_family_id(mut self, family_id: impl Into<FamilyId>) -> Self {
        self.family_id = family_id.into();
        self
    }

    /// Enables or disables the broker
    pub fn with_broker(mut self, enabled: bool) -> Self {
        self.broker_enabled = enabled;
        self
    }

    /// Sets the jitter window
    pub fn with_jitter_window(mut self, window: DurationSecs) -> Self {
        self.jitter_window = window;
        self
    }

    /// Sets the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
