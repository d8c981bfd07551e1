//! Silent acquisition and refresh of OAuth2 tokens for client applications
//!
//! A [`SilentClient`] answers "give me a token for these scopes" without ever
//! prompting the user. It returns a cached access token when one is still
//! valid, quietly refreshes tokens that are close to expiry in the
//! background, redeems refresh tokens (including refresh tokens shared by a
//! family of applications) when the cached token has run out, and can
//! delegate the whole exchange to a platform broker.
//!
//! When the identity provider is briefly unreachable, an expired token that
//! is still within its extended lifetime is returned instead of an error.
//!
//! ```no_run
//! use std::sync::Arc;
//! use authkeep::{
//!     Authority, ReqwestNetworkClient, RetryPolicy, SilentAccount, SilentClient, SilentConfig,
//!     SilentRequest,
//! };
//! use authkeep_cache::{storage::PlaintextFileStorage, PersistentCacheAccessor, ScopeSet, TokenCache};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let accessor =
//!     PersistentCacheAccessor::open(PlaintextFileStorage::new(".tokens.json")).await?;
//! let cache = Arc::new(TokenCache::new(Arc::new(accessor)));
//! let config = SilentConfig::new("my-client-id", Authority::new("login.example.com", "common"))
//!     .with_retry(RetryPolicy::token_endpoint().with_max_retries(2));
//!
//! let client = SilentClient::from_network(config, cache, Arc::new(ReqwestNetworkClient::default()));
//!
//! let account = client.accounts().await?.remove(0);
//! let result = client
//!     .acquire_token_silent(
//!         SilentRequest::new(ScopeSet::parse("https://graph.example.com/.default"))
//!             .with_account(SilentAccount::Cached(account)),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("token expires at {}", result.expires_at);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod broker;
pub mod config;
pub mod error;
pub mod jitter;
pub mod network;
mod orchestrator;
mod result;
pub mod retry;
pub mod strategy;
#[cfg(test)]
mod testing;
pub mod token_endpoint;

pub use config::{Authority, SilentConfig};
pub use error::{AcquireError, ClientErrorKind, ServiceError, UiRequiredCategory, UiRequiredReason};
#[cfg(feature = "reqwest")]
pub use network::ReqwestNetworkClient;
pub use orchestrator::{SilentAccount, SilentClient, SilentRequest};
pub use result::{AuthenticationResult, TokenSource};
pub use retry::{RetryDecision, RetryPolicy};
pub use token_endpoint::{OAuth2TokenEndpoint, TokenEndpoint};
