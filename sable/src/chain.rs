//! On-chain value types: actions, authorities, transactions and traces.

pub mod action;
pub mod authority;
pub mod native;
pub mod trace;
pub mod transaction;

pub use action::{Action, PermissionLevel};
pub use authority::{Authority, KeyWeight, PermissionLevelWeight, WaitWeight, Weight};
pub use native::{
    CancelDelay, DeleteAuth, LinkAuth, NativeAction, NewAccount, UnlinkAuth, UpdateAuth,
};
pub use trace::{
    AccountAuthSequence, AccountDelta, ActionReceipt, ActionTrace,
    TransactionStatus, TransactionTrace,
};
pub use transaction::Transaction;
