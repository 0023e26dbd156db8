//! Objective per-account resource accounting: RAM, NET and CPU.
//!
//! The accounting state lives inside [`ChainState`] so a failed
//! transaction's undo also reverts its usage updates.

use snafu::ensure;
use tracing::trace;

use crate::{
    AccountName,
    db::Database,
    error::{DatabaseSnafu, RamUsageExceededSnafu, Result},
};

impl Database {
    // --- RAM -----------------------------------------------------------------

    /// Apply a signed RAM delta. Going below zero is a bug in the caller's
    /// accounting, not a user error.
    pub fn add_ram_usage(&mut self, account: AccountName, delta: i64) -> Result<()> {
        let usage = self.usage_mut(account);
        let updated = usage.ram_usage + delta;
        ensure!(updated >= 0, DatabaseSnafu {
            msg: format!("RAM usage delta would underflow for account {account}"),
        });
        usage.ram_usage = updated;
        trace!(%account, delta, total = updated, "ram usage updated");
        Ok(())
    }

    /// Check usage against quota; called at the end of the transaction for
    /// every account whose usage grew.
    pub fn verify_account_ram_usage(&self, account: AccountName) -> Result<()> {
        let usage = self.usage(account);
        if usage.ram_limit >= 0 {
            ensure!(usage.ram_usage <= usage.ram_limit, RamUsageExceededSnafu {
                account,
                needed: usage.ram_usage as u64,
                available: usage.ram_limit as u64,
            });
        }
        Ok(())
    }

    pub fn set_account_limits(&mut self, account: AccountName,
                              ram: i64, net: i64, cpu: i64) {
        let usage = self.usage_mut(account);
        usage.ram_limit = ram;
        usage.net_limit = net;
        usage.cpu_limit = cpu;
    }

    // --- NET / CPU -----------------------------------------------------------

    /// Remaining NET for the account, `None` when unlimited.
    pub fn account_net_limit(&self, account: AccountName) -> Option<u64> {
        let usage = self.usage(account);
        if usage.net_limit < 0 {
            return None;
        }
        Some((usage.net_limit as u64).saturating_sub(usage.net_used))
    }

    /// Remaining CPU (in us) for the account, `None` when unlimited.
    pub fn account_cpu_limit(&self, account: AccountName) -> Option<u64> {
        let usage = self.usage(account);
        if usage.cpu_limit < 0 {
            return None;
        }
        Some((usage.cpu_limit as u64).saturating_sub(usage.cpu_used))
    }

    /// Record the final NET and CPU billing of a transaction against every
    /// billed account and the pending block totals. Limits were already
    /// validated, so exceeding one here is an internal inconsistency.
    pub fn add_transaction_usage(&mut self, accounts: &[AccountName],
                                 cpu_usage_us: u64, net_usage: u64) -> Result<()> {
        for &account in accounts {
            let usage = self.usage_mut(account);
            usage.net_used += net_usage;
            usage.cpu_used += cpu_usage_us;
            ensure!(usage.net_limit < 0 || usage.net_used <= usage.net_limit as u64,
                    DatabaseSnafu { msg: format!("net usage of {account} exceeds its limit after validation") });
            ensure!(usage.cpu_limit < 0 || usage.cpu_used <= usage.cpu_limit as u64,
                    DatabaseSnafu { msg: format!("cpu usage of {account} exceeds its limit after validation") });
        }

        let global = &mut self.state_mut().global;
        global.pending_block_net_usage += net_usage;
        global.pending_block_cpu_usage += cpu_usage_us;
        Ok(())
    }
}
