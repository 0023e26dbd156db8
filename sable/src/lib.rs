//!
//! Deterministic transaction execution core for an Antelope-style,
//! account-based chain.
//!
//! The pipeline, from the outside in:
//!
//! - [`Controller`] holds the chain state ([`db::Database`]), the deployed
//!   contract runtimes and the block being built, and is the entry point
//!   for pushing transactions.
//! - [`transaction_context::TransactionContext`] owns one transaction for
//!   its whole lifecycle: budget derivation, deadline enforcement, action
//!   dispatch and final billing.
//! - [`apply_context::ApplyContext`] runs one action on one receiver and
//!   is the API surface contract code programs against: notifications,
//!   inline actions, deferred transactions, the table store and RAM
//!   billing.
//! - [`authorization::AuthorizationManager`] decides whether the declared
//!   authorities of a transaction are relevant and satisfied by the
//!   provided keys, permissions and delay.
//!
//! The base value types live in [`types`] and the on-chain structures
//! (actions, authorities, transactions, traces) in [`chain`]; both are
//! re-exported at the crate root.

pub mod apply_context;
pub mod authorization;
pub mod chain;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod resource_limits;
pub mod runtime;
pub mod subjective_billing;
pub mod transaction_context;
pub mod types;

pub use types::*;
pub use chain::*;

pub use apply_context::ApplyContext;
pub use controller::{Clock, Controller};
pub use db::Database;
pub use error::{ChainError, Result};
pub use runtime::{ContractRuntime, RuntimeHandle};
pub use transaction_context::{TransactionContext, TrxType};
