//! Node-local tracking of CPU spent on failed transactions.
//!
//! Failed transactions are not billed on chain, so a node protects itself
//! by remembering what each first authorizer recently cost it and counting
//! that against the account's budget on its next attempts. This state is
//! outside the database on purpose: it must survive transaction undo and
//! never affect consensus.

use std::collections::HashMap;

use tracing::debug;

use crate::{AccountName, Microseconds, TimePoint};

/// How long a failure keeps counting against an account.
const EXPIRATION_WINDOW: Microseconds = Microseconds::seconds(120);

#[derive(Debug, Default)]
pub struct SubjectiveBilling {
    failures: HashMap<AccountName, Vec<(TimePoint, i64)>>,
}

impl SubjectiveBilling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record CPU burned by a failed transaction of `account`.
    pub fn bill_failure(&mut self, account: AccountName, cpu: Microseconds, now: TimePoint) {
        if cpu.count() <= 0 {
            return;
        }
        debug!(%account, %cpu, "recording subjective billing for failed transaction");
        self.failures.entry(account).or_default().push((now, cpu.count()));
    }

    /// Pending subjective bill for `account`, expired entries pruned.
    pub fn get_bill(&mut self, account: AccountName, now: TimePoint) -> Microseconds {
        let Some(entries) = self.failures.get_mut(&account) else {
            return Microseconds::new(0);
        };
        entries.retain(|(at, _)| now - *at < EXPIRATION_WINDOW);
        if entries.is_empty() {
            self.failures.remove(&account);
            return Microseconds::new(0);
        }
        Microseconds::new(entries.iter().map(|(_, cpu)| cpu).sum())
    }

    /// A successful on-chain billing clears the grudge.
    pub fn clear(&mut self, account: AccountName) {
        self.failures.remove(&account);
    }
}
