//! A persistent token cache that is safe to share between processes
//!
//! The cache holds access, refresh and ID tokens along with the accounts
//! they were issued to. Every record lives under a deterministic
//! [composite key][key], so equal lookups always address the same record
//! regardless of how the request was phrased.
//!
//! Records are held by a [`CacheAccessor`]. This crate provides one that
//! lives purely in memory and one that mirrors a blob kept by a
//! [`StorageBackend`][storage::StorageBackend]. The [`TokenCache`] engine sits
//! on top and performs the multi-record updates that follow a token
//! exchange, serialized across processes by a [lock file][lock].
//!
//! ```no_run
//! use std::sync::Arc;
//! use authkeep_cache::{
//!     storage::PlaintextFileStorage, PersistentCacheAccessor, TokenCache,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let accessor = PersistentCacheAccessor::open(
//!     PlaintextFileStorage::new("/home/me/.cache/app/tokens.json"),
//! )
//! .await?;
//! let cache = TokenCache::new(Arc::new(accessor));
//!
//! for account in cache.accounts(None).await? {
//!     println!("{:?}", account.username);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Persisted blobs written by older releases, in the single-entry format,
//! are migrated on load. Unrecognized blobs are treated as empty.

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

pub mod accessor;
mod braids;
mod cache;
pub mod claims;
mod contents;
pub mod format;
pub mod key;
pub mod lock;
mod memory;
mod persistent;
pub mod records;
pub mod response;
mod scopes;
pub mod storage;

pub use accessor::{AccessorError, CacheAccessor};
pub use braids::*;
pub use cache::{CacheError, SavedTokens, TokenCache};
pub use contents::CacheContents;
pub use memory::InMemoryCacheAccessor;
pub use persistent::PersistentCacheAccessor;
pub use records::{CacheRecord, TokenStatus};
pub use scopes::{ScopeSet, RESERVED_SCOPES};
