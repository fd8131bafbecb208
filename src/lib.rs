//! nftsync - declarative nftables port reconciliation
//!
//! Keeps a host's `inet filter` table converged to a list of allowed
//! `(port, protocol)` services, and renders the same policy as a standalone
//! `nft -f` artifact.
//!
//! # Architecture
//!
//! - [`core`] - Reconciliation engine, nft gateway, artifact generator
//! - [`lock`] - Single-instance guard with stale-owner detection
//! - [`notify`] - Change notification sinks
//! - [`audit`] - JSON-lines audit trail of every mutation
//! - [`config`] - Configuration persistence
//! - [`elevation`] - `nft` program resolution and privilege wrapper
//! - [`utils`] - XDG directories

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod lock;
pub mod notify;
pub mod utils;

pub use core::error::{Error, Result};
pub use core::service::{DesiredPolicy, Protocol, Service};
