//! Core reconciliation functionality
//!
//! - [`error`]: Error taxonomy shared by every component
//! - [`service`]: Desired policy model and policy file loading
//! - [`nft`]: Typed `nft` command builder and the runner seam
//! - [`retry`]: Retry policies for mutating commands
//! - [`objects`]: The baseline table, chains, sets and their batch definitions
//! - [`gateway`]: Query and mutate operations over the filter state
//! - [`inspect`]: Membership predicates built on gateway queries
//! - [`reconcile`]: Idempotent baseline and per-service reconciliation
//! - [`artifact`]: Deterministic rule artifact rendering and publishing

pub mod artifact;
pub mod error;
pub mod gateway;
pub mod inspect;
pub mod nft;
pub mod objects;
pub mod reconcile;
pub mod retry;
pub mod service;

#[cfg(test)]
pub mod test_helpers;
