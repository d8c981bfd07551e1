//! The entry point for silent token acquisition
//!
//! [`SilentClient`] resolves the account a request is for, then hands the
//! request to exactly one strategy: the broker when one is configured and
//! usable, the token cache otherwise.

use std::{collections::HashSet, fmt, sync::Arc};

use authkeep_cache::{records::AccountRecord, ScopeSet, TokenCache};
use authkeep_clock::{Clock, System};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    broker::Broker,
    config::SilentConfig,
    error::{AcquireError, ClientErrorKind, UiRequiredReason},
    jitter::JitterSource,
    network::NetworkClient,
    result::AuthenticationResult,
    strategy::{BrokerSilentRequest, BrokerSilentStrategy, CacheSilentRequest, CacheSilentStrategy},
    token_endpoint::{OAuth2TokenEndpoint, TokenEndpoint, RESERVED_PARAMETERS},
};

/// The account a silent request is made for
#[derive(Clone, Debug)]
pub enum SilentAccount {
    /// An account from the token cache
    Cached(AccountRecord),
    /// The account signed in to the operating system; only a broker can
    /// act for it
    OperatingSystem,
}

/// A request for a token without user interaction
#[derive(Clone, Debug)]
pub struct SilentRequest {
    scopes: ScopeSet,
    account: Option<SilentAccount>,
    login_hint: Option<String>,
    force_refresh: bool,
    claims: Option<String>,
    correlation_id: Option<Uuid>,
    extra_query_parameters: Vec<(String, String)>,
}

impl SilentRequest {
    /// A request for `scopes`
    pub fn new(scopes: ScopeSet) -> Self {
        Self {
            scopes,
            account: None,
            login_hint: None,
            force_refresh: false,
            claims: None,
            correlation_id: None,
            extra_query_parameters: Vec::new(),
        }
    }

    /// Acts for `account`
    pub fn with_account(mut self, account: SilentAccount) -> Self {
        self.account = Some(account);
        self
    }

    /// Acts for the single cached account whose username is `login_hint`
    pub fn with_login_hint(mut self, login_hint: impl Into<String>) -> Self {
        self.login_hint = Some(login_hint.into());
        self
    }

    /// Ignores cached access tokens
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Requests a token satisfying a claims challenge
    pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
        self.claims = Some(claims.into());
        self
    }

    /// Uses a caller-supplied correlation id
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Adds a query parameter to identity provider requests
    pub fn with_extra_query_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.extra_query_parameters.push((name.into(), value.into()));
        self
    }

    fn validate(&self) -> Result<(), AcquireError> {
        if self.scopes.without_reserved().is_empty() {
            return Err(AcquireError::client_with_source(
                ClientErrorKind::InvalidRequest,
                "at least one resource scope is required",
            ));
        }

        let mut seen = HashSet::new();
        for (name, _) in &self.extra_query_parameters {
            let lower = name.to_ascii_lowercase();
            if RESERVED_PARAMETERS.contains(&lower.as_str()) || !seen.insert(lower) {
                return Err(AcquireError::client_with_source(
                    ClientErrorKind::DuplicateQueryParameter,
                    format!("query parameter `{}` given more than once", name),
                ));
            }
        }
        Ok(())
    }
}

enum ResolvedAccount {
    Cached(AccountRecord),
    OperatingSystem,
}

/// Acquires tokens silently for one client application
pub struct SilentClient {
    config: Arc<SilentConfig>,
    cache: Arc<TokenCache>,
    endpoint: Arc<dyn TokenEndpoint>,
    broker: Option<Arc<dyn Broker>>,
    clock: Arc<dyn Clock + Send + Sync>,
    jitter: Arc<dyn JitterSource>,
    lifetime: CancellationToken,
    cache_strategy: CacheSilentStrategy,
    broker_strategy: Option<BrokerSilentStrategy>,
}

impl fmt::Debug for SilentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SilentClient")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("broker", &self.broker.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "rand")]
fn default_jitter(config: &SilentConfig) -> Arc<dyn JitterSource> {
    Arc::new(crate::jitter::RandomEarlyJitter::new(config.jitter_window))
}

#[cfg(not(feature = "rand"))]
fn default_jitter(_config: &SilentConfig) -> Arc<dyn JitterSource> {
    Arc::new(crate::jitter::NullJitter)
}

impl SilentClient {
    /// Constructs a client over a cache and token endpoint
    pub fn new(
        config: SilentConfig,
        cache: Arc<TokenCache>,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        let config = Arc::new(config);
        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(System);
        let jitter = default_jitter(&config);
        let lifetime = CancellationToken::new();
        let cache_strategy = CacheSilentStrategy::new(
            config.clone(),
            cache.clone(),
            endpoint.clone(),
            clock.clone(),
            jitter.clone(),
            lifetime.clone(),
        );
        Self {
            config,
            cache,
            endpoint,
            broker: None,
            clock,
            jitter,
            lifetime,
            cache_strategy,
            broker_strategy: None,
        }
    }

    /// Constructs a client that redeems refresh tokens over `network`
    ///
    /// Token endpoint calls follow the configuration's retry policy.
    pub fn from_network(
        config: SilentConfig,
        cache: Arc<TokenCache>,
        network: Arc<dyn NetworkClient>,
    ) -> Self {
        let endpoint = OAuth2TokenEndpoint::new(network, config.retry.clone());
        Self::new(config, cache, Arc::new(endpoint))
    }

    /// Uses a platform broker when the configuration enables it
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self.rebuild()
    }

    /// Uses `clock` for all time reads
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self.rebuild()
    }

    /// Uses `jitter` to spread proactive refreshes
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self.rebuild()
    }

    fn rebuild(mut self) -> Self {
        self.cache_strategy = CacheSilentStrategy::new(
            self.config.clone(),
            self.cache.clone(),
            self.endpoint.clone(),
            self.clock.clone(),
            self.jitter.clone(),
            self.lifetime.clone(),
        );
        self.broker_strategy = self.broker.clone().map(|broker| {
            BrokerSilentStrategy::new(self.config.clone(), broker, self.clock.clone())
        });
        self
    }

    /// The client's configuration
    pub fn config(&self) -> &SilentConfig {
        &self.config
    }

    /// The client's token cache
    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    /// Acquires a token without user interaction
    pub async fn acquire_token_silent(
        &self,
        request: SilentRequest,
        cancel: &CancellationToken,
    ) -> Result<AuthenticationResult, AcquireError> {
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);
        let span = tracing::info_span!(
            "acquire_token_silent",
            %correlation_id,
            client_id = %self.config.client_id,
        );
        self.acquire(request, correlation_id, cancel)
            .instrument(span)
            .await
    }

    async fn acquire(
        &self,
        request: SilentRequest,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<AuthenticationResult, AcquireError> {
        request.validate()?;
        let account = self.resolve_account(&request).await?;

        if let Some(broker) = self.broker_strategy.as_ref().filter(|b| b.is_usable()) {
            tracing::debug!("acquiring through the broker");
            let broker_request = BrokerSilentRequest {
                account: match account {
                    ResolvedAccount::Cached(account) => Some(account),
                    ResolvedAccount::OperatingSystem => None,
                },
                scopes: request.scopes,
                claims: request.claims,
                correlation_id,
                extra_query_parameters: request.extra_query_parameters,
            };
            return broker.execute(&broker_request, cancel).await;
        }

        let account = match account {
            ResolvedAccount::Cached(account) => account,
            ResolvedAccount::OperatingSystem => {
                tracing::debug!("the operating system account needs a broker");
                return Err(AcquireError::ui_required(UiRequiredReason::UserNull));
            }
        };
        let cache_request = CacheSilentRequest {
            account,
            scopes: request.scopes,
            force_refresh: request.force_refresh,
            claims: request.claims,
            correlation_id,
            extra_query_parameters: request.extra_query_parameters,
        };
        self.cache_strategy.execute(&cache_request, cancel).await
    }

    async fn resolve_account(&self, request: &SilentRequest) -> Result<ResolvedAccount, AcquireError> {
        match (&request.account, &request.login_hint) {
            (Some(SilentAccount::Cached(account)), _) => Ok(ResolvedAccount::Cached(account.clone())),
            (Some(SilentAccount::OperatingSystem), _) => Ok(ResolvedAccount::OperatingSystem),
            (None, Some(login_hint)) => {
                let mut matches = self
                    .cache
                    .accounts_by_login_hint(self.config.authority.environment(), login_hint)
                    .await?;
                match matches.len() {
                    0 => Err(AcquireError::ui_required(
                        UiRequiredReason::NoAccountForLoginHint,
                    )),
                    1 => Ok(ResolvedAccount::Cached(matches.remove(0))),
                    n => {
                        tracing::debug!(matches = n, "login hint is ambiguous");
                        Err(AcquireError::ui_required(
                            UiRequiredReason::MultipleAccountsForLoginHint,
                        ))
                    }
                }
            }
            (None, None) => Err(AcquireError::ui_required(UiRequiredReason::UserNull)),
        }
    }

    /// Lists the cached accounts in the configured environment
    pub async fn accounts(&self) -> Result<Vec<AccountRecord>, AcquireError> {
        Ok(self
            .cache
            .accounts(Some(self.config.authority.environment()))
            .await?)
    }

    /// Signs an account out, deleting its tokens and profiles from the cache
    #[tracing::instrument(skip(self, account), fields(home_account_id = %account.home_account_id))]
    pub async fn remove_account(&self, account: &AccountRecord) -> Result<(), AcquireError> {
        let removed = self
            .cache
            .remove_account(&account.home_account_id, self.config.authority.environment())
            .await?;
        tracing::info!(removed, "account removed");
        Ok(())
    }

    /// Cancels background refreshes; later refreshes are not started
    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Authority,
        jitter::NullJitter,
        result::TokenSource,
        testing::{self, FakeBroker, RecordingEndpoint, Step},
    };
    use authkeep_cache::records::AuthorityType;
    use authkeep_clock::{ManualClock, UnixTime};

    const NOW: u64 = 10_000;

    struct Harness {
        cache: Arc<TokenCache>,
        endpoint: Arc<RecordingEndpoint>,
        client: SilentClient,
    }

    fn config() -> SilentConfig {
        SilentConfig::new(testing::CLIENT, Authority::new(testing::ENV, "common"))
    }

    fn harness(config: SilentConfig, steps: Vec<Step>) -> Harness {
        let cache = Arc::new(TokenCache::in_memory());
        let endpoint = Arc::new(RecordingEndpoint::new(steps));
        let client = SilentClient::new(config, cache.clone(), endpoint.clone())
            .with_clock(Arc::new(ManualClock::new(UnixTime(NOW))))
            .with_jitter(Arc::new(NullJitter));
        Harness {
            cache,
            endpoint,
            client,
        }
    }

    fn read() -> SilentRequest {
        SilentRequest::new(ScopeSet::parse("read"))
    }

    async fn acquire(h: &Harness, request: SilentRequest) -> Result<AuthenticationResult, AcquireError> {
        h.client
            .acquire_token_silent(request, &CancellationToken::new())
            .await
    }

    fn ui_reason(result: Result<AuthenticationResult, AcquireError>) -> UiRequiredReason {
        match result {
            Err(AcquireError::UiRequired { reason, .. }) => reason,
            other => panic!("expected UI required, got {:?}", other),
        }
    }

    mod when_resolving_the_account {
        use super::*;

        #[tokio::test]
        async fn login_hint_matching_one_account_refreshes_it() {
            let h = harness(config(), vec![Step::respond("new-at", 3_600)]);
            testing::seed(&h.cache, testing::account("User@Example.com")).await;
            testing::seed(&h.cache, testing::refresh_token("rt", None)).await;

            let result = acquire(&h, read().with_login_hint("user@example.com"))
                .await
                .unwrap();

            assert_eq!(result.access_token.as_str(), "new-at");
            assert_eq!(result.expires_at, UnixTime(NOW + 3_600));
            assert_eq!(result.source, TokenSource::IdentityProvider);
            assert_eq!(h.endpoint.grants()[0].refresh_token.as_str(), "rt");

            let cached = acquire(&h, read().with_login_hint("user@example.com"))
                .await
                .unwrap();
            assert_eq!(cached.source, TokenSource::Cache);
            assert_eq!(h.endpoint.calls(), 1);
        }

        #[tokio::test]
        async fn no_account_and_no_hint_is_user_null() {
            let h = harness(config(), vec![]);
            assert_eq!(ui_reason(acquire(&h, read()).await), UiRequiredReason::UserNull);
        }

        #[tokio::test]
        async fn unmatched_login_hint() {
            let h = harness(config(), vec![]);
            testing::seed(&h.cache, testing::account("someone@example.com")).await;
            assert_eq!(
                ui_reason(acquire(&h, read().with_login_hint("user@example.com")).await),
                UiRequiredReason::NoAccountForLoginHint
            );
        }

        #[tokio::test]
        async fn ambiguous_login_hint() {
            let h = harness(config(), vec![]);
            let mut other = testing::account("user@example.com");
            other.home_account_id = "other.utid".into();
            testing::seed(&h.cache, testing::account("user@example.com")).await;
            testing::seed(&h.cache, other).await;

            assert_eq!(
                ui_reason(acquire(&h, read().with_login_hint("user@example.com")).await),
                UiRequiredReason::MultipleAccountsForLoginHint
            );
        }

        #[tokio::test]
        async fn one_identity_in_several_tenants_is_not_ambiguous() {
            let h = harness(config(), vec![]);
            let mut guest = testing::account("user@example.com");
            guest.tenant_id = "other-tenant".into();
            testing::seed(&h.cache, testing::account("user@example.com")).await;
            testing::seed(&h.cache, guest).await;
            testing::seed(&h.cache, testing::refresh_token("rt", None)).await;

            assert!(acquire(&h, read().with_login_hint("user@example.com"))
                .await
                .is_ok());
        }

        #[tokio::test]
        async fn operating_system_account_needs_a_broker() {
            let h = harness(config(), vec![]);
            assert_eq!(
                ui_reason(
                    acquire(&h, read().with_account(SilentAccount::OperatingSystem)).await
                ),
                UiRequiredReason::UserNull
            );
        }
    }

    mod when_validating {
        use super::*;

        fn client_kind(result: Result<AuthenticationResult, AcquireError>) -> ClientErrorKind {
            match result {
                Err(AcquireError::Client { kind, .. }) => kind,
                other => panic!("expected a client error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn reserved_scopes_alone_are_rejected() {
            let h = harness(config(), vec![]);
            let request = SilentRequest::new(ScopeSet::parse("openid profile"))
                .with_account(SilentAccount::Cached(testing::account("user@example.com")));
            assert_eq!(
                client_kind(acquire(&h, request).await),
                ClientErrorKind::InvalidRequest
            );
        }

        #[tokio::test]
        async fn duplicate_query_parameters_are_rejected() {
            let h = harness(config(), vec![]);
            let request = read()
                .with_account(SilentAccount::Cached(testing::account("user@example.com")))
                .with_extra_query_parameter("dc", "a")
                .with_extra_query_parameter("DC", "b");
            assert_eq!(
                client_kind(acquire(&h, request).await),
                ClientErrorKind::DuplicateQueryParameter
            );
        }

        #[tokio::test]
        async fn reserved_query_parameters_are_rejected() {
            let h = harness(config(), vec![]);
            let request = read()
                .with_account(SilentAccount::Cached(testing::account("user@example.com")))
                .with_extra_query_parameter("client_id", "someone-else");
            assert_eq!(
                client_kind(acquire(&h, request).await),
                ClientErrorKind::DuplicateQueryParameter
            );
            assert_eq!(h.endpoint.calls(), 0);
        }
    }

    mod when_a_broker_is_configured {
        use super::*;

        fn brokered(config: SilentConfig, broker: Arc<FakeBroker>) -> Harness {
            let mut h = harness(config.with_broker(true), vec![]);
            h.client = h.client.with_broker(broker);
            h
        }

        #[tokio::test]
        async fn only_the_broker_is_used() {
            let broker = Arc::new(FakeBroker::issuing("brokered"));
            let h = brokered(config(), broker.clone());
            testing::seed(&h.cache, testing::refresh_token("rt", None)).await;

            let result = acquire(&h, read().with_account(SilentAccount::OperatingSystem))
                .await
                .unwrap();

            assert_eq!(result.access_token.as_str(), "brokered");
            assert_eq!(result.source, TokenSource::Broker);
            assert_eq!(h.endpoint.calls(), 0);
            assert!(h
                .cache
                .find_access_token(
                    &testing::home(),
                    &testing::env(),
                    &testing::client(),
                    &testing::tenant(),
                    &ScopeSet::parse("read"),
                )
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test]
        async fn a_broker_miss_is_terminal() {
            let broker = Arc::new(FakeBroker::declining());
            let h = brokered(config(), broker);
            testing::seed(&h.cache, testing::refresh_token("rt", None)).await;

            assert_eq!(
                ui_reason(
                    acquire(
                        &h,
                        read().with_account(SilentAccount::Cached(testing::account(
                            "user@example.com"
                        )))
                    )
                    .await
                ),
                UiRequiredReason::NoAccountForId
            );

            assert_eq!(
                ui_reason(acquire(&h, read().with_account(SilentAccount::OperatingSystem)).await),
                UiRequiredReason::BrokerCannotSatisfy
            );
            assert_eq!(h.endpoint.calls(), 0);
        }

        #[tokio::test]
        async fn federation_services_use_the_cache() {
            let broker = Arc::new(FakeBroker::issuing("brokered"));
            let adfs = SilentConfig::new(
                testing::CLIENT,
                Authority::new(testing::ENV, testing::TENANT)
                    .with_authority_type(AuthorityType::Adfs),
            );
            let h = brokered(adfs, broker.clone());
            testing::seed(&h.cache, testing::refresh_token("rt", None)).await;

            let result = acquire(
                &h,
                read().with_account(SilentAccount::Cached(testing::account("user@example.com"))),
            )
            .await
            .unwrap();

            assert_eq!(result.source, TokenSource::IdentityProvider);
            assert_eq!(broker.calls(), 0);
        }
    }

    #[tokio::test]
    async fn correlation_id_flows_to_the_token_endpoint() {
        let h = harness(config(), vec![]);
        testing::seed(&h.cache, testing::refresh_token("rt", None)).await;
        let id = Uuid::new_v4();

        let result = acquire(
            &h,
            read()
                .with_account(SilentAccount::Cached(testing::account("user@example.com")))
                .with_correlation_id(id),
        )
        .await
        .unwrap();

        assert_eq!(result.correlation_id, id);
        assert_eq!(h.endpoint.grants()[0].correlation_id, id);
    }

    #[tokio::test]
    async fn removed_accounts_need_interaction() {
        let h = harness(config(), vec![]);
        let account = testing::account("user@example.com");
        testing::seed(&h.cache, account.clone()).await;
        testing::seed(&h.cache, testing::refresh_token("rt", None)).await;

        h.client.remove_account(&account).await.unwrap();

        assert!(h.client.accounts().await.unwrap().is_empty());
        assert_eq!(
            ui_reason(acquire(&h, read().with_account(SilentAccount::Cached(account))).await),
            UiRequiredReason::NoTokensFound
        );
    }

    #[tokio::test]
    async fn configured_retry_policy_reaches_the_token_endpoint() {
        use crate::retry::{
            test_support::{response, ScriptedNetwork},
            RetryPolicy,
        };

        let network = Arc::new(ScriptedNetwork::new([Some(response(503, ""))]));
        let cache = Arc::new(TokenCache::in_memory());
        testing::seed(&cache, testing::account("user@example.com")).await;
        testing::seed(&cache, testing::refresh_token("rt", None)).await;

        let client = SilentClient::from_network(
            config().with_retry(RetryPolicy::no_retry()),
            cache,
            network.clone(),
        )
        .with_clock(Arc::new(ManualClock::new(UnixTime(NOW))))
        .with_jitter(Arc::new(NullJitter));

        let err = client
            .acquire_token_silent(
                read().with_login_hint("user@example.com"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.service_error().unwrap().status, Some(503));
        assert!(err.is_retryable());
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn clients_sharing_a_cache_file_share_tokens() {
        use authkeep_cache::{storage::PlaintextFileStorage, PersistentCacheAccessor};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let open = |endpoint: Arc<RecordingEndpoint>| {
            let path = path.clone();
            async move {
                let accessor = PersistentCacheAccessor::open(PlaintextFileStorage::new(path))
                    .await
                    .unwrap();
                let cache = Arc::new(TokenCache::new(Arc::new(accessor)));
                (
                    cache.clone(),
                    SilentClient::new(config(), cache, endpoint)
                        .with_clock(Arc::new(ManualClock::new(UnixTime(NOW))))
                        .with_jitter(Arc::new(NullJitter)),
                )
            }
        };

        let first_endpoint = Arc::new(RecordingEndpoint::new(vec![Step::respond("shared", 3_600)]));
        let (first_cache, first) = open(first_endpoint.clone()).await;
        testing::seed(&first_cache, testing::account("user@example.com")).await;
        testing::seed(&first_cache, testing::refresh_token("rt", None)).await;
        first_cache.accessor().persist().await.unwrap();

        let result = first
            .acquire_token_silent(
                read().with_login_hint("user@example.com"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.source, TokenSource::IdentityProvider);

        let second_endpoint = Arc::new(RecordingEndpoint::default());
        let (_, second) = open(second_endpoint.clone()).await;
        let result = second
            .acquire_token_silent(
                read().with_login_hint("user@example.com"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.access_token.as_str(), "shared");
        assert_eq!(result.source, TokenSource::Cache);
        assert_eq!(first_endpoint.calls(), 1);
        assert_eq!(second_endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_background_refreshes() {
        let h = harness(config(), vec![]);
        let mut at = testing::access_token("read", "cached", NOW + 1_000);
        at.refresh_on = Some(UnixTime(NOW - 1));
        testing::seed(&h.cache, at).await;
        testing::seed(&h.cache, testing::refresh_token("rt", None)).await;

        h.client.shutdown();
        let result = acquire(
            &h,
            read().with_account(SilentAccount::Cached(testing::account("user@example.com"))),
        )
        .await
        .unwrap();

        assert_eq!(result.access_token.as_str(), "cached");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(h.endpoint.calls(), 0);
    }
}
