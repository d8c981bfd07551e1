//! Fakes and fixtures shared by the unit tests

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use authkeep_cache::{
    records::{
        AccessTokenRecord, AccountRecord, AppMetadataRecord, AuthorityType, Record,
        RefreshTokenRecord,
    },
    response::TokenResponse,
    AccessToken, CacheRecord, ClientId, Environment, FamilyId, HomeAccountId, HomeAccountIdRef,
    RefreshToken, ScopeSet, TenantId, TokenCache,
};
use authkeep_clock::UnixTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    broker::{keys, Broker, BrokerAccountId, BrokerError, BrokerPayload, BrokerTarget},
    error::{AcquireError, ServiceError},
    token_endpoint::{RefreshTokenGrant, TokenEndpoint},
};

pub const HOME: &str = "uid.utid";
pub const ENV: &str = "login.example.com";
pub const CLIENT: &str = "client-a";
pub const TENANT: &str = "utid";

pub fn home() -> HomeAccountId {
    HOME.into()
}

pub fn env() -> Environment {
    ENV.into()
}

pub fn client() -> ClientId {
    CLIENT.into()
}

pub fn tenant() -> TenantId {
    TENANT.into()
}

pub fn account(username: &str) -> AccountRecord {
    AccountRecord {
        home_account_id: home(),
        environment: env(),
        tenant_id: tenant(),
        local_account_id: Some("oid".into()),
        username: Some(username.into()),
        authority_type: AuthorityType::Aad,
        extra: Default::default(),
    }
}

pub fn access_token(scopes: &str, secret: &str, expires_at: u64) -> AccessTokenRecord {
    AccessTokenRecord {
        home_account_id: home(),
        environment: env(),
        client_id: client(),
        tenant_id: tenant(),
        scopes: ScopeSet::parse(scopes),
        secret: AccessToken::from(secret),
        cached_at: UnixTime(0),
        expires_at: UnixTime(expires_at),
        extended_expires_on: None,
        refresh_on: None,
        extra: Default::default(),
    }
}

pub fn refresh_token(secret: &str, family: Option<&str>) -> RefreshTokenRecord {
    RefreshTokenRecord {
        home_account_id: home(),
        environment: env(),
        client_id: client(),
        secret: RefreshToken::from(secret),
        family_id: family.map(FamilyId::from),
        extra: Default::default(),
    }
}

pub fn app_metadata(family: &str) -> AppMetadataRecord {
    AppMetadataRecord {
        client_id: client(),
        environment: env(),
        family_id: family.into(),
        extra: Default::default(),
    }
}

pub async fn seed<R: Record + Into<CacheRecord>>(cache: &TokenCache, record: R) {
    let key = record.key().unwrap();
    cache
        .accessor()
        .set(R::KIND, key, record.into())
        .await
        .unwrap();
}

pub fn token_response(access_token: &str, expires_in: u64) -> TokenResponse {
    serde_json::from_value(serde_json::json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "refresh_token": "rotated-rt",
    }))
    .unwrap()
}

pub fn outage() -> ServiceError {
    ServiceError::new("service_not_available", true).with_status(503)
}

/// What the recording endpoint does for one exchange
#[derive(Debug)]
pub enum Step {
    Respond(TokenResponse),
    Fail(ServiceError),
    /// Responds, but only after the caller's token has been cancelled
    CancelAndRespond(TokenResponse),
    /// Responds once the gate is notified
    Gated(Arc<Notify>, TokenResponse),
    /// Panics mid-exchange
    Panic,
}

impl Step {
    pub fn respond(access_token: &str, expires_in: u64) -> Self {
        Step::Respond(token_response(access_token, expires_in))
    }

    pub fn fail(err: ServiceError) -> Self {
        Step::Fail(err)
    }
}

/// A token endpoint that follows a script and records every grant
#[derive(Debug, Default)]
pub struct RecordingEndpoint {
    script: Mutex<VecDeque<Step>>,
    grants: Mutex<Vec<RefreshTokenGrant>>,
    calls: AtomicUsize,
}

impl RecordingEndpoint {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn grants(&self) -> Vec<RefreshTokenGrant> {
        self.grants.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..400 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} token endpoint calls, saw {}", n, self.calls());
    }
}

#[async_trait]
impl TokenEndpoint for RecordingEndpoint {
    async fn exchange_refresh_token(
        &self,
        _token_url: &Url,
        grant: RefreshTokenGrant,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, AcquireError> {
        self.grants.lock().unwrap().push(grant);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(token_response("issued", 3_600)),
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(err)) => Err(err.into()),
            Some(Step::CancelAndRespond(response)) => {
                cancel.cancel();
                Ok(response)
            }
            Some(Step::Gated(gate, response)) => {
                gate.notified().await;
                Ok(response)
            }
            Some(Step::Panic) => panic!("token endpoint blew up"),
        }
    }
}

/// A broker with a fixed answer
#[derive(Debug, Default)]
pub struct FakeBroker {
    installed: bool,
    accounts: HashMap<String, BrokerAccountId>,
    response: Option<BrokerPayload>,
    targets: Mutex<Vec<BrokerTarget>>,
    payloads: Mutex<Vec<BrokerPayload>>,
}

impl FakeBroker {
    pub fn issuing(access_token: &str) -> Self {
        let mut response = BrokerPayload::new();
        response.insert(keys::ACCESS_TOKEN.into(), access_token.into());
        response.insert(keys::EXPIRES_IN.into(), "3600".into());
        response.insert(keys::HOME_ACCOUNT_ID.into(), HOME.into());
        Self {
            installed: true,
            response: Some(response),
            ..Self::default()
        }
    }

    pub fn declining() -> Self {
        Self {
            installed: true,
            ..Self::default()
        }
    }

    pub fn not_installed() -> Self {
        Self::default()
    }

    pub fn knowing(mut self, home_account_id: &str, handle: &str) -> Self {
        self.accounts
            .insert(home_account_id.into(), BrokerAccountId::from(handle));
        self
    }

    pub fn targets(&self) -> Vec<BrokerTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<BrokerPayload> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    fn is_broker_installed_and_invokable(&self, _authority_type: AuthorityType) -> bool {
        self.installed
    }

    async fn find_account(
        &self,
        home_account_id: &HomeAccountIdRef,
        _cancel: &CancellationToken,
    ) -> Result<Option<BrokerAccountId>, BrokerError> {
        Ok(self.accounts.get(home_account_id.as_str()).cloned())
    }

    async fn acquire_token_silently(
        &self,
        payload: BrokerPayload,
        target: BrokerTarget,
        _cancel: &CancellationToken,
    ) -> Result<Option<BrokerPayload>, BrokerError> {
        let correlation_id = payload.get(keys::CORRELATION_ID).cloned();
        self.targets.lock().unwrap().push(target);
        self.payloads.lock().unwrap().push(payload);
        Ok(self.response.clone().map(|mut response| {
            if let Some(id) = correlation_id {
                response.insert(keys::CORRELATION_ID.into(), id);
            }
            response
        }))
    }
}
