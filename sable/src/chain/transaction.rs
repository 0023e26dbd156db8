use serde::{Deserialize, Serialize};

use crate::{AccountName, Action, Microseconds, TimePointSec, TransactionId};

/// A signed unit of work: an ordered list of actions executed atomically,
/// plus the header fields bounding when and how it may run.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub expiration: TimePointSec,
    /// caller-imposed NET ceiling, in 8-byte words (0 means no cap)
    pub max_net_usage_words: u32,
    /// caller-imposed CPU ceiling in milliseconds (0 means no cap)
    pub max_cpu_usage_ms: u8,
    /// seconds the transaction must wait before it may execute
    pub delay_sec: u32,
    pub actions: Vec<Action>,
}

impl Transaction {
    /// Canonical id: the digest of the serialized transaction.
    pub fn id(&self) -> TransactionId {
        TransactionId::hash(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn delay(&self) -> Microseconds {
        Microseconds::seconds(self.delay_sec as i64)
    }

    /// The first authorizer of the first action, by convention the account
    /// billed for subjective (node-local) resource tracking.
    pub fn first_authorizer(&self) -> Option<AccountName> {
        self.actions.first()
            .and_then(|a| a.authorization.first())
            .map(|p| p.actor)
    }
}
