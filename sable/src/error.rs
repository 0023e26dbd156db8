//! The error type shared by the whole execution pipeline.
//!
//! Every variant maps to a stable numeric `error_code` recorded in
//! transaction traces, following the classic Antelope numbering
//! (30400xx transaction, 30500xx action, 30600xx database, 30800xx
//! resources, 30900xx authorization).

use snafu::Snafu;

use crate::{
    AccountName, Microseconds, Name, PermissionLevel, PermissionName, TimePoint, TransactionId,
};

pub type Result<T, E = ChainError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChainError {
    // -------------------------------------------------------------------------
    //     transaction-level errors (30400xx)
    // -------------------------------------------------------------------------

    #[snafu(display("transaction error: {msg}"))]
    Transaction { msg: String },

    #[snafu(display("max inline action depth per transaction reached ({max})"))]
    InlineActionDepthExceeded { max: u16 },

    #[snafu(display("transaction {id} expired at {expiration}"))]
    ExpiredTransaction { id: TransactionId, expiration: TimePoint },

    #[snafu(display("duplicate transaction {id}"))]
    DuplicateTransaction { id: TransactionId },

    #[snafu(display("duplicate deferred transaction from {sender} with sender id {sender_id}"))]
    DuplicateDeferredTransaction { sender: AccountName, sender_id: u128 },

    #[snafu(display("transaction interrupted by an external signal, {elapsed} elapsed"))]
    TransactionInterrupted { elapsed: Microseconds },

    // -------------------------------------------------------------------------
    //     action-level errors (30500xx)
    // -------------------------------------------------------------------------

    #[snafu(display("action validation failed: {msg}"))]
    ActionValidate { msg: String },

    #[snafu(display("account {account} already exists"))]
    AccountExists { account: AccountName },

    #[snafu(display("cannot decode data of action {account}::{name}: {source}"))]
    ActionData { account: AccountName, name: Name, source: serde_json::Error },

    #[snafu(display("no handler for action {account}::{name}"))]
    ActionNotFound { account: AccountName, name: Name },

    #[snafu(display("inline action too big: {size} bytes, max is {max}"))]
    InlineActionTooBig { size: usize, max: u32 },

    // -------------------------------------------------------------------------
    //     database errors (30600xx)
    // -------------------------------------------------------------------------

    #[snafu(display("database error: {msg}"))]
    Database { msg: String },

    #[snafu(display("permission {level} does not exist"))]
    PermissionNotFound { level: PermissionLevel },

    #[snafu(display("account {account} does not exist"))]
    AccountNotFound { account: AccountName },

    #[snafu(display("invalid payer for table row: {payer}"))]
    InvalidTablePayer { payer: AccountName },

    // -------------------------------------------------------------------------
    //     resource errors (30800xx)
    // -------------------------------------------------------------------------

    #[snafu(display("account {account} has insufficient RAM: needs {needed} bytes, has {available}"))]
    RamUsageExceeded { account: AccountName, needed: u64, available: u64 },

    #[snafu(display("transaction net usage is too high: {billed} > {limit}"))]
    TxNetUsageExceeded { billed: u64, limit: u64 },

    #[snafu(display("not enough space left in block: {billed} > {limit}"))]
    BlockNetUsageExceeded { billed: u64, limit: u64 },

    #[snafu(display("transaction was executing for too long: {billed}us > {limit}us"))]
    TxCpuUsageExceeded { billed: i64, limit: i64 },

    #[snafu(display("not enough time left in block to complete executing transaction: {billed}us > {limit}us"))]
    BlockCpuUsageExceeded { billed: i64, limit: i64 },

    #[snafu(display("transaction deadline exceeded, {elapsed} elapsed"))]
    DeadlineExceeded { elapsed: Microseconds },

    #[snafu(display("greylisted account net usage is too high: {billed} > {limit}"))]
    GreylistNetUsageExceeded { billed: u64, limit: u64 },

    #[snafu(display("greylisted account cpu usage is too high: {billed}us > {limit}us"))]
    GreylistCpuUsageExceeded { billed: i64, limit: i64 },

    #[snafu(display("transaction reached the deadline set due to leeway on account cpu limits, {elapsed} elapsed"))]
    LeewayDeadlineExceeded { elapsed: Microseconds },

    #[snafu(display("cannot bill RAM to {payer} from within a notification context"))]
    UnauthorizedRamBilling { payer: AccountName },

    // -------------------------------------------------------------------------
    //     authorization errors (30900xx)
    // -------------------------------------------------------------------------

    #[snafu(display("authorization error: {msg}"))]
    Authorization { msg: String },

    #[snafu(display("signatures provided for keys that are not relevant to this transaction: {keys}"))]
    IrrelevantSignature { keys: String },

    #[snafu(display("the declared authority {level} cannot be satisfied"))]
    UnsatisfiedAuthorization { level: PermissionLevel },

    #[snafu(display("missing required authority of {account}{}",
            permission.as_ref().map(|p| format!("/{p}")).unwrap_or_default()))]
    MissingAuth { account: AccountName, permission: Option<PermissionName> },

    #[snafu(display("action declares irrelevant authority {level}"))]
    IrrelevantAuth { level: PermissionLevel },

    #[snafu(display("invalid use of permission: {msg}"))]
    InvalidPermission { msg: String },

    #[snafu(display("cannot link to a minimum permission for this action: {msg}"))]
    UnlinkableAction { msg: String },

    #[snafu(display("recursion depth limit of {max} reached while evaluating authority"))]
    AuthorityDepthExceeded { max: u16 },

    #[snafu(display("key type {key_type} is not activated on this chain"))]
    UnactivatedKeyType { key_type: String },
}

impl ChainError {
    /// The stable numeric code recorded in traces.
    pub fn error_code(&self) -> u64 {
        use ChainError::*;
        match self {
            Transaction { .. }                   => 3040000,
            ExpiredTransaction { .. }            => 3040002,
            DuplicateTransaction { .. }          => 3040005,
            DuplicateDeferredTransaction { .. }  => 3040006,
            InlineActionDepthExceeded { .. }     => 3040010,
            TransactionInterrupted { .. }        => 3040011,

            ActionValidate { .. }                => 3050000,
            AccountExists { .. }                 => 3050001,
            ActionData { .. }                    => 3050002,
            ActionNotFound { .. }                => 3050005,
            InlineActionTooBig { .. }            => 3050008,

            Database { .. }                      => 3060000,
            PermissionNotFound { .. }            => 3060001,
            AccountNotFound { .. }               => 3060002,
            InvalidTablePayer { .. }             => 3060003,

            RamUsageExceeded { .. }              => 3080001,
            TxNetUsageExceeded { .. }            => 3080002,
            BlockNetUsageExceeded { .. }         => 3080003,
            TxCpuUsageExceeded { .. }            => 3080004,
            BlockCpuUsageExceeded { .. }         => 3080005,
            DeadlineExceeded { .. }              => 3080006,
            GreylistNetUsageExceeded { .. }      => 3080007,
            GreylistCpuUsageExceeded { .. }      => 3080008,
            LeewayDeadlineExceeded { .. }        => 3080009,
            UnauthorizedRamBilling { .. }        => 3080010,

            Authorization { .. }                 => 3090000,
            IrrelevantSignature { .. }           => 3090002,
            UnsatisfiedAuthorization { .. }      => 3090003,
            MissingAuth { .. }                   => 3090004,
            IrrelevantAuth { .. }                => 3090005,
            InvalidPermission { .. }             => 3090007,
            UnlinkableAction { .. }              => 3090008,
            AuthorityDepthExceeded { .. }        => 3090009,
            UnactivatedKeyType { .. }            => 3090010,
        }
    }

    /// Whether the failure consumed the whole budget (deadline and usage
    /// ceilings) rather than being a logic error. Exhaustion failures are
    /// still billed, logic failures can be retried subjectively.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self.error_code(), 3080002..=3080009)
    }
}
