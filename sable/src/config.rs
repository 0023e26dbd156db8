//! Chain-wide constants and consensus-configurable limits.

use serde::{Deserialize, Serialize};

use crate::{Microseconds, Name};

pub const SYSTEM_ACCOUNT: Name = Name::constant("sysio");
pub const ANY_PERMISSION: Name = Name::constant("sysio.any");
pub const CODE_PERMISSION: Name = Name::constant("sysio.code");
pub const PAYER_PERMISSION: Name = Name::constant("sysio.payer");
pub const OWNER_PERMISSION: Name = Name::constant("owner");
pub const ACTIVE_PERMISSION: Name = Name::constant("active");

pub const NEWACCOUNT_ACTION: Name = Name::constant("newaccount");
pub const UPDATEAUTH_ACTION: Name = Name::constant("updateauth");
pub const DELETEAUTH_ACTION: Name = Name::constant("deleteauth");
pub const LINKAUTH_ACTION: Name = Name::constant("linkauth");
pub const UNLINKAUTH_ACTION: Name = Name::constant("unlinkauth");
pub const CANCELDELAY_ACTION: Name = Name::constant("canceldelay");

/// Fixed per-row storage overhead billed on top of the payload, covering
/// the indexing structures a row lives in.
pub const BILLABLE_SIZE_KV_OBJECT: u64 = 32 + 8 + 4 + 64;   // 112
pub const BILLABLE_SIZE_TABLE_OBJECT: u64 = 44 + 4 + 64;    // 112
pub const BILLABLE_SIZE_PERMISSION_LINK: u64 = 49 + 2 * 64; // 177
pub const BILLABLE_SIZE_PERMISSION_BASE: u64 = 68 + 4 * 64; // 324
pub const BILLABLE_SIZE_GENERATED_TRANSACTION: u64 = 96 + 4 * 64; // 352

/// Flat RAM charge per account, covering the account and metadata rows.
pub const OVERHEAD_PER_ACCOUNT_RAM_BYTES: u64 = 2 * 1024;

/// NET billed for remembering a transaction id for dedup purposes.
pub const TRANSACTION_ID_NET_USAGE: u32 = 32;

pub const DEFAULT_MAX_INLINE_ACTION_DEPTH: u16 = 4;
pub const DEFAULT_MAX_AUTH_DEPTH: u16 = 6;

pub const SUBJECTIVE_CPU_LEEWAY_US: i64 = 3000;

/// Consensus behavior switches a chain activates over its lifetime.
/// Activation is one-way on a real chain; here they are plain booleans
/// queried at the points where behavior forked.
#[derive(Eq, PartialEq, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ProtocolFeatures {
    /// Activated: the ban on linking permission-management actions to a
    /// minimum permission only applies to actions on the system account.
    /// Before activation it applied to same-named actions on any contract.
    pub fix_linkauth_restriction: bool,
    /// Activated: contracts can no longer schedule deferred transactions.
    pub disable_deferred_trxs: bool,
    /// Key types with an activation index below this count are accepted
    /// in authorities; activating a new curve raises it.
    pub num_supported_key_types: u8,
}

impl Default for ProtocolFeatures {
    fn default() -> Self {
        Self {
            fix_linkauth_restriction: true,
            disable_deferred_trxs: false,
            num_supported_key_types: 2,
        }
    }
}

/// The consensus-level limits every transaction is validated against.
///
/// Defaults mirror the values mainnet-family chains launch with.
#[derive(Eq, PartialEq, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub max_block_net_usage: u64,
    pub max_transaction_net_usage: u32,
    pub base_per_transaction_net_usage: u32,
    pub net_usage_leeway: u32,

    pub max_block_cpu_usage: u32,
    pub max_transaction_cpu_usage: u32,
    pub min_transaction_cpu_usage: u32,

    pub max_transaction_lifetime: u32,
    pub deferred_trx_expiration_window: u32,
    pub max_transaction_delay: u32,
    pub max_inline_action_size: u32,
    pub max_inline_action_depth: u16,
    pub max_authority_depth: u16,

    pub features: ProtocolFeatures,
}

impl Default for ChainConfig {
    fn default() -> Self {
        const MAX_BLOCK_NET_USAGE: u64 = 1024 * 1024;
        const MAX_BLOCK_CPU_USAGE: u32 = 200_000;
        Self {
            max_block_net_usage: MAX_BLOCK_NET_USAGE,
            max_transaction_net_usage: MAX_BLOCK_NET_USAGE as u32 / 2,
            base_per_transaction_net_usage: 12,
            net_usage_leeway: 500,

            max_block_cpu_usage: MAX_BLOCK_CPU_USAGE,
            max_transaction_cpu_usage: 3 * MAX_BLOCK_CPU_USAGE / 4,
            min_transaction_cpu_usage: 100,

            max_transaction_lifetime: 60 * 60,
            deferred_trx_expiration_window: 10 * 60,
            max_transaction_delay: 45 * 24 * 3600,
            max_inline_action_size: 512 * 1024,
            max_inline_action_depth: DEFAULT_MAX_INLINE_ACTION_DEPTH,
            max_authority_depth: DEFAULT_MAX_AUTH_DEPTH,

            features: ProtocolFeatures::default(),
        }
    }
}

impl ChainConfig {
    pub fn max_transaction_delay_duration(&self) -> Microseconds {
        Microseconds::seconds(self.max_transaction_delay as i64)
    }
}

/// Node-local (subjective) tuning knobs, not part of consensus.
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub struct NodeConfig {
    /// wall-clock cap a producing or validating node is willing to spend
    /// on a single transaction
    pub max_transaction_time: Microseconds,
    /// extra wall-clock slack granted before failing a transaction that
    /// has not yet reached its objective limit
    pub subjective_cpu_leeway: Option<Microseconds>,
    /// disable deadline enforcement entirely (tests, debugging)
    pub enforce_deadlines: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_transaction_time: Microseconds::milliseconds(30),
            subjective_cpu_leeway: Some(Microseconds::new(SUBJECTIVE_CPU_LEEWAY_US)),
            enforce_deadlines: true,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = ChainConfig::default();
        assert!(cfg.max_transaction_net_usage as u64 <= cfg.max_block_net_usage);
        assert!(cfg.max_transaction_cpu_usage <= cfg.max_block_cpu_usage);
        assert!(cfg.min_transaction_cpu_usage <= cfg.max_transaction_cpu_usage);
        assert_eq!(cfg.max_transaction_delay_duration(), Microseconds::days(45));
    }
}
