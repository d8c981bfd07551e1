//! Strategies for acquiring a token without user interaction

mod broker;
mod cache;

pub use broker::{BrokerSilentRequest, BrokerSilentStrategy};
pub use cache::{CacheSilentRequest, CacheSilentStrategy};
