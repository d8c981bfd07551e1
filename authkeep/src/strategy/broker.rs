//! Silent acquisition delegated to a platform broker
//!
//! Broker results are returned as-is and never written to the application's
//! cache. A broker that cannot satisfy a request silently ends the attempt;
//! there is no fall-through to the cache.

use std::{fmt, sync::Arc};

use authkeep_cache::{
    records::{AccountRecord, AuthorityType},
    ScopeSet,
};
use authkeep_clock::Clock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    broker::{Broker, BrokerRequest, BrokerTarget, BrokerTokens},
    config::SilentConfig,
    error::{AcquireError, UiRequiredReason},
    result::{AuthenticationResult, TokenSource},
};

/// A silent request as handed to the broker
#[derive(Clone, Debug)]
pub struct BrokerSilentRequest {
    /// The account to act for; `None` means the operating system account
    pub account: Option<AccountRecord>,
    /// The requested scopes
    pub scopes: ScopeSet,
    /// A claims challenge
    pub claims: Option<String>,
    /// The request's correlation id
    pub correlation_id: Uuid,
    /// Extra query parameters
    pub extra_query_parameters: Vec<(String, String)>,
}

/// Acquires tokens through a broker
#[derive(Clone)]
pub struct BrokerSilentStrategy {
    config: Arc<SilentConfig>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for BrokerSilentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSilentStrategy")
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

impl BrokerSilentStrategy {
    /// Constructs a strategy
    pub fn new(
        config: Arc<SilentConfig>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            config,
            broker,
            clock,
        }
    }

    /// Whether the broker is enabled and able to serve the configured
    /// authority
    ///
    /// Federation services are never brokered.
    pub fn is_usable(&self) -> bool {
        let authority_type = self.config.authority.authority_type();
        self.config.broker_enabled
            && authority_type != AuthorityType::Adfs
            && self.broker.is_broker_installed_and_invokable(authority_type)
    }

    /// Acquires a token for `request`
    #[tracing::instrument(
        err,
        skip(self, request, cancel),
        fields(
            home_account_id = request.account.as_ref().map(|a| a.home_account_id.as_str()),
            scopes = %request.scopes,
        ),
    )]
    pub async fn execute(
        &self,
        request: &BrokerSilentRequest,
        cancel: &CancellationToken,
    ) -> Result<AuthenticationResult, AcquireError> {
        let target = match &request.account {
            None => BrokerTarget::OperatingSystemAccount,
            Some(account) => match self
                .broker
                .find_account(&account.home_account_id, cancel)
                .await?
            {
                Some(id) => BrokerTarget::Account(id),
                None => {
                    tracing::debug!("broker does not know the account");
                    return Err(AcquireError::ui_required(UiRequiredReason::NoAccountForId));
                }
            },
        };

        let authority = self.config.authority.url_for(match &request.account {
            Some(account) if self.config.authority.is_tenantless() => &*account.tenant_id,
            _ => self.config.authority.tenant(),
        });
        let payload = BrokerRequest {
            authority,
            scopes: &request.scopes,
            client_id: &self.config.client_id,
            correlation_id: request.correlation_id,
            redirect_uri: self.config.redirect_uri.as_deref(),
            extra_query_parameters: &request.extra_query_parameters,
            username: request.account.as_ref().and_then(|a| a.username.as_deref()),
            claims: request.claims.as_deref(),
        }
        .to_payload();

        let response = self
            .broker
            .acquire_token_silently(payload, target, cancel)
            .await?
            .ok_or_else(|| {
                tracing::debug!("broker cannot satisfy the request silently");
                AcquireError::ui_required(UiRequiredReason::BrokerCannotSatisfy)
            })?;

        let tokens = BrokerTokens::from_payload(
            response,
            request.correlation_id,
            &request.scopes,
            self.clock.now(),
        )?;
        tracing::debug!(expires_at = %tokens.expires_at, "broker issued a token");

        let account = self.account_for(&tokens, request.account.as_ref());
        Ok(AuthenticationResult {
            access_token: tokens.access_token,
            expires_at: tokens.expires_at,
            extended_expires_at: tokens.extended_expires_at,
            scopes: tokens.scopes,
            tenant_id: tokens.tenant_id,
            account,
            id_token: tokens.id_token,
            source: TokenSource::Broker,
            is_extended_lifetime_token: false,
            correlation_id: request.correlation_id,
        })
    }

    fn account_for(
        &self,
        tokens: &BrokerTokens,
        requested: Option<&AccountRecord>,
    ) -> Option<AccountRecord> {
        let home_account_id = match &tokens.home_account_id {
            Some(home) => home.clone(),
            None => return requested.cloned(),
        };
        Some(AccountRecord {
            home_account_id,
            environment: self.config.authority.environment().to_owned(),
            tenant_id: tokens
                .tenant_id
                .clone()
                .unwrap_or_else(|| self.config.authority.tenant().to_owned()),
            local_account_id: None,
            username: tokens
                .username
                .clone()
                .or_else(|| requested.and_then(|a| a.username.clone())),
            authority_type: self.config.authority.authority_type(),
            extra: Default::default(),
        })
    }
}
