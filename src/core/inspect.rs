//! Membership predicates over the live filter state
//!
//! Every predicate is a fresh gateway query; nothing is cached between calls.
//!
//! # Known approximation
//!
//! [`LiveStateInspector::rule_present`] and
//! [`LiveStateInspector::element_present`] do a literal substring match
//! against the whole textual listing returned by nft. They do not parse rule
//! expressions or element lists. A listing that contains the needle as part of
//! a longer token counts as a match: `80` is reported present when only `8080`
//! is in the set, and a rule `tcp dport @tcp_services accept comment "x"`
//! satisfies the needle `tcp dport @tcp_services accept`. This granularity is
//! relied upon and must not be tightened without changing callers.

use crate::core::gateway::FilterGateway;
use crate::core::nft::NftRunner;
use crate::core::objects::INPUT_CHAIN;
use crate::core::service::Protocol;

/// Substring check used for both rules and elements
pub fn listing_contains(listing: &str, needle: &str) -> bool {
    listing.contains(needle)
}

pub struct LiveStateInspector<'a, R> {
    gateway: &'a FilterGateway<R>,
}

impl<'a, R: NftRunner + Sync> LiveStateInspector<'a, R> {
    pub fn new(gateway: &'a FilterGateway<R>) -> Self {
        Self { gateway }
    }

    pub async fn table_exists(&self) -> bool {
        self.gateway.list_table().await.is_some()
    }

    pub async fn chain_exists(&self, name: &str) -> bool {
        self.gateway.list_chain(name).await.is_some()
    }

    pub async fn set_exists(&self, name: &str) -> bool {
        self.gateway.list_set(name).await.is_some()
    }

    /// Whether `needle` occurs anywhere in the listing of `chain`
    pub async fn rule_present(&self, chain: &str, needle: &str) -> bool {
        self.gateway
            .list_chain(chain)
            .await
            .is_some_and(|listing| listing_contains(&listing, needle))
    }

    /// Whether `port` occurs anywhere in the listing of `set`
    pub async fn element_present(&self, set: &str, port: u16) -> bool {
        self.gateway
            .list_set(set)
            .await
            .is_some_and(|listing| listing_contains(&listing, &port.to_string()))
    }

    /// Whether an explicit `<proto> dport <port> accept` rule is in the input chain
    pub async fn port_rule_present(&self, protocol: Protocol, port: u16) -> bool {
        let needle = format!("{protocol} dport {port} accept");
        self.rule_present(INPUT_CHAIN, &needle).await
    }
}
