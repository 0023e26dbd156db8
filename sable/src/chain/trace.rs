use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    AccountName, Action, Digest, Microseconds, TimePoint, TransactionId,
};

#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountAuthSequence {
    pub account: AccountName,
    pub sequence: u64,
}

/// Issued for every executed action, binding it into the chain's global
/// ordering through the various sequence numbers.
#[derive(Eq, Hash, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub receiver: AccountName,
    pub act_digest: Digest,
    pub global_sequence: u64,
    pub recv_sequence: u64,
    pub auth_sequence: Vec<AccountAuthSequence>,
    pub code_sequence: u32,
    pub abi_sequence: u32,
}

#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountDelta {
    pub account: AccountName,
    pub delta: i64,
}

/// One entry per dispatched action, in dispatch order. Ordinals are
/// 1-based indices into the owning transaction's trace list.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionTrace {
    pub action_ordinal: u32,
    pub creator_action_ordinal: u32,
    pub closest_unnotified_ancestor_action_ordinal: u32,
    pub receipt: Option<ActionReceipt>,
    pub receiver: AccountName,
    pub act: Action,
    pub context_free: bool,
    pub elapsed: Microseconds,
    pub console: String,
    pub trx_id: TransactionId,
    pub block_time: TimePoint,
    pub account_ram_deltas: BTreeSet<AccountDelta>,
    pub except: Option<String>,
    pub error_code: Option<u64>,
}

#[derive(Eq, PartialEq, Debug, Copy, Clone, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    /// succeeded, no error handler executed
    #[default]
    Executed,
    /// objectively failed, error handler executed
    SoftFail,
    /// objectively failed, error handler also failed or was not allowed
    HardFail,
    /// scheduled for future execution
    Delayed,
    /// expired before execution, only cpu/net for storage are billed
    Expired,
}

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub id: TransactionId,
    pub status: TransactionStatus,
    pub cpu_usage_us: u32,
    pub net_usage: u64,
    pub elapsed: Microseconds,
    pub scheduled: bool,
    pub action_traces: Vec<ActionTrace>,
    pub account_ram_delta: Option<AccountDelta>,
    pub except: Option<String>,
    pub error_code: Option<u64>,
}

impl TransactionTrace {
    /// Total RAM delta billed to `account` across all action traces.
    pub fn ram_delta_for(&self, account: AccountName) -> i64 {
        self.action_traces.iter()
            .flat_map(|at| at.account_ram_deltas.iter())
            .filter(|d| d.account == account)
            .map(|d| d.delta)
            .sum()
    }
}


#[cfg(test)]
mod tests {
    use crate::Name;
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&TransactionStatus::SoftFail).unwrap(), r#""soft_fail""#);
        assert_eq!(TransactionStatus::HardFail.to_string(), "hard_fail");
    }

    #[test]
    fn ram_delta_aggregation() {
        let mut trace = TransactionTrace::default();
        let mut at = ActionTrace::default();
        at.account_ram_deltas.insert(AccountDelta { account: Name::constant("alice"), delta: 120 });
        at.account_ram_deltas.insert(AccountDelta { account: Name::constant("bob"), delta: -40 });
        trace.action_traces.push(at);

        let mut at = ActionTrace::default();
        at.account_ram_deltas.insert(AccountDelta { account: Name::constant("alice"), delta: -20 });
        trace.action_traces.push(at);

        assert_eq!(trace.ram_delta_for(Name::constant("alice")), 100);
        assert_eq!(trace.ram_delta_for(Name::constant("bob")), -40);
        assert_eq!(trace.ram_delta_for(Name::constant("carol")), 0);
    }
}
