//! In-memory chain state with snapshot-based undo sessions.
//!
//! All state a transaction can touch lives in [`ChainState`], resource
//! accounting included, so that undoing a session also reverts sequence
//! numbers and RAM usage. Undo sessions nest: the transaction opens one,
//! and each action opens another inside it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    AccountName, ActionName, Authority, Bytes, Name, PermissionLevel, PermissionName,
    ScopeName, TableName, TimePoint, Transaction, TransactionId,
    config,
    error::{
        AccountNotFoundSnafu, DatabaseSnafu, DuplicateTransactionSnafu,
        PermissionNotFoundSnafu, Result,
    },
};
use snafu::{ensure, OptionExt};

pub type PermissionId = u64;
pub type TableId = u64;


// -----------------------------------------------------------------------------
//     State objects
// -----------------------------------------------------------------------------

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: AccountName,
    pub creation_date: TimePoint,
}

/// Mutable bookkeeping attached to an account; the sequence numbers feed
/// action receipts.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountMetadata {
    pub name: AccountName,
    pub privileged: bool,
    pub recv_sequence: u64,
    pub auth_sequence: u64,
    pub code_sequence: u32,
    pub abi_sequence: u32,
    pub has_contract: bool,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PermissionObject {
    pub id: PermissionId,
    pub parent: Option<PermissionId>,
    pub owner: AccountName,
    pub name: PermissionName,
    pub last_updated: TimePoint,
    pub auth: Authority,
}

impl PermissionObject {
    pub fn level(&self) -> PermissionLevel {
        PermissionLevel::new(self.owner, self.name)
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub code: AccountName,
    pub scope: ScopeName,
    pub table: TableName,
    pub payer: AccountName,
    pub count: u32,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TableRow {
    pub table_id: TableId,
    pub primary_key: u64,
    pub payer: AccountName,
    pub value: Bytes,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedTransaction {
    pub sender: AccountName,
    pub sender_id: u128,
    pub trx_id: TransactionId,
    pub payer: AccountName,
    pub published: TimePoint,
    pub delay_until: TimePoint,
    pub expiration: TimePoint,
    pub trx: Transaction,
}

impl GeneratedTransaction {
    /// RAM billed for storing this record: the fixed row overhead plus
    /// the serialized transaction payload.
    pub fn billable_size(&self) -> u64 {
        let payload = serde_json::to_vec(&self.trx).unwrap_or_default();
        config::BILLABLE_SIZE_GENERATED_TRANSACTION + payload.len() as u64
    }
}

/// Per-account resource accounting. Limits of -1 mean unlimited.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct AccountUsage {
    pub ram_usage: i64,
    pub ram_limit: i64,
    pub net_used: u64,
    pub net_limit: i64,
    pub cpu_used: u64,
    pub cpu_limit: i64,
}

impl Default for AccountUsage {
    fn default() -> Self {
        Self { ram_usage: 0, ram_limit: -1, net_used: 0, net_limit: -1, cpu_used: 0, cpu_limit: -1 }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalState {
    pub global_action_sequence: u64,
    pub next_permission_id: PermissionId,
    pub next_table_id: TableId,
    /// cumulative usage of the block being built
    pub pending_block_net_usage: u64,
    pub pending_block_cpu_usage: u64,
}

/// The complete chain state. Cloning it is what makes an undo snapshot.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainState {
    pub accounts: BTreeMap<AccountName, Account>,
    pub account_metadata: BTreeMap<AccountName, AccountMetadata>,
    pub permissions: BTreeMap<PermissionId, PermissionObject>,
    pub permissions_by_owner: BTreeMap<(AccountName, PermissionName), PermissionId>,
    pub links: BTreeMap<(AccountName, AccountName, ActionName), PermissionName>,
    pub tables: BTreeMap<(AccountName, ScopeName, TableName), TableId>,
    pub tables_by_id: BTreeMap<TableId, Table>,
    pub rows: BTreeMap<(TableId, u64), TableRow>,
    pub generated_transactions: BTreeMap<(AccountName, u128), GeneratedTransaction>,
    pub transaction_dedup: BTreeMap<TransactionId, TimePoint>,
    pub usage: BTreeMap<AccountName, AccountUsage>,
    pub global: GlobalState,
}


// -----------------------------------------------------------------------------
//     Database
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Database {
    state: ChainState,
    undo_stack: Vec<ChainState>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ChainState { &self.state }
    pub fn state_mut(&mut self) -> &mut ChainState { &mut self.state }

    // --- undo sessions -------------------------------------------------------

    pub fn start_undo_session(&mut self) {
        trace!(depth = self.undo_stack.len() + 1, "starting undo session");
        self.undo_stack.push(self.state.clone());
    }

    /// Discard all changes made since the innermost session started.
    pub fn undo(&mut self) -> Result<()> {
        let snapshot = self.undo_stack.pop()
            .context(DatabaseSnafu { msg: "undo called with no active session" })?;
        self.state = snapshot;
        Ok(())
    }

    /// Merge the innermost session into its parent.
    pub fn squash(&mut self) -> Result<()> {
        ensure!(!self.undo_stack.is_empty(),
                DatabaseSnafu { msg: "squash called with no active session" });
        self.undo_stack.pop();
        Ok(())
    }

    /// Make everything since the outermost session permanent.
    pub fn commit(&mut self) {
        self.undo_stack.clear();
    }

    pub fn session_depth(&self) -> usize {
        self.undo_stack.len()
    }

    // --- accounts ------------------------------------------------------------

    pub fn create_account(&mut self, name: AccountName, now: TimePoint) -> Result<()> {
        ensure!(!self.state.accounts.contains_key(&name),
                DatabaseSnafu { msg: format!("account {name} already exists") });
        self.state.accounts.insert(name, Account { name, creation_date: now });
        self.state.account_metadata.insert(name, AccountMetadata { name, ..Default::default() });
        Ok(())
    }

    pub fn find_account(&self, name: AccountName) -> Option<&Account> {
        self.state.accounts.get(&name)
    }

    pub fn get_account(&self, name: AccountName) -> Result<&Account> {
        self.state.accounts.get(&name).context(AccountNotFoundSnafu { account: name })
    }

    pub fn get_metadata(&self, name: AccountName) -> Result<&AccountMetadata> {
        self.state.account_metadata.get(&name).context(AccountNotFoundSnafu { account: name })
    }

    pub fn get_metadata_mut(&mut self, name: AccountName) -> Result<&mut AccountMetadata> {
        self.state.account_metadata.get_mut(&name).context(AccountNotFoundSnafu { account: name })
    }

    pub fn is_privileged(&self, name: AccountName) -> bool {
        self.state.account_metadata.get(&name).map(|m| m.privileged).unwrap_or(false)
    }

    pub fn set_privileged(&mut self, name: AccountName, privileged: bool) -> Result<()> {
        self.get_metadata_mut(name)?.privileged = privileged;
        Ok(())
    }

    pub fn set_contract(&mut self, name: AccountName, has_contract: bool) -> Result<()> {
        let meta = self.get_metadata_mut(name)?;
        meta.has_contract = has_contract;
        meta.code_sequence += 1;
        Ok(())
    }

    // --- permissions ---------------------------------------------------------

    pub fn create_permission(&mut self, owner: AccountName, name: PermissionName,
                             parent: Option<PermissionId>, auth: Authority,
                             now: TimePoint) -> Result<PermissionId> {
        ensure!(!self.state.permissions_by_owner.contains_key(&(owner, name)),
                DatabaseSnafu { msg: format!("permission {owner}@{name} already exists") });

        let id = self.state.global.next_permission_id;
        self.state.global.next_permission_id += 1;
        self.state.permissions.insert(id, PermissionObject {
            id, parent, owner, name, last_updated: now, auth,
        });
        self.state.permissions_by_owner.insert((owner, name), id);
        Ok(id)
    }

    pub fn find_permission(&self, level: &PermissionLevel) -> Option<&PermissionObject> {
        let id = self.state.permissions_by_owner.get(&(level.actor, level.permission))?;
        self.state.permissions.get(id)
    }

    pub fn get_permission(&self, level: &PermissionLevel) -> Result<&PermissionObject> {
        self.find_permission(level).context(PermissionNotFoundSnafu { level: *level })
    }

    pub fn permission_by_id(&self, id: PermissionId) -> Result<&PermissionObject> {
        self.state.permissions.get(&id)
            .context(DatabaseSnafu { msg: format!("no permission with id {id}") })
    }

    pub fn modify_permission(&mut self, id: PermissionId, auth: Authority,
                             now: TimePoint) -> Result<()> {
        let p = self.state.permissions.get_mut(&id)
            .context(DatabaseSnafu { msg: format!("no permission with id {id}") })?;
        p.auth = auth;
        p.last_updated = now;
        Ok(())
    }

    pub fn remove_permission(&mut self, id: PermissionId) -> Result<()> {
        let p = self.state.permissions.remove(&id)
            .context(DatabaseSnafu { msg: format!("no permission with id {id}") })?;
        self.state.permissions_by_owner.remove(&(p.owner, p.name));
        Ok(())
    }

    pub fn permission_has_children(&self, id: PermissionId) -> bool {
        self.state.permissions.values().any(|p| p.parent == Some(id))
    }

    pub fn permission_is_linked(&self, account: AccountName, permission: PermissionName) -> bool {
        self.state.links.iter()
            .any(|((acct, _, _), required)| *acct == account && *required == permission)
    }

    /// Whether the `declared` permission is the `min` permission itself or
    /// one of its ancestors. Only permissions of the same owner compare.
    pub fn permission_satisfies(&self, declared: &PermissionObject, min: &PermissionObject) -> bool {
        if declared.owner != min.owner {
            return false;
        }
        let mut current = Some(min.id);
        while let Some(id) = current {
            if id == declared.id {
                return true;
            }
            current = self.state.permissions.get(&id).and_then(|p| p.parent);
        }
        false
    }

    // --- permission links ----------------------------------------------------

    /// Returns whether an existing link was replaced.
    pub fn set_link(&mut self, account: AccountName, code: AccountName,
                    action: ActionName, requirement: PermissionName) -> bool {
        self.state.links.insert((account, code, action), requirement).is_some()
    }

    pub fn remove_link(&mut self, account: AccountName, code: AccountName,
                       action: ActionName) -> bool {
        self.state.links.remove(&(account, code, action)).is_some()
    }

    /// The exact link for `(account, code, action)`, without the wildcard
    /// fallback of [`lookup_linked_permission`](Self::lookup_linked_permission).
    pub fn find_link(&self, account: AccountName, code: AccountName,
                     action: ActionName) -> Option<PermissionName> {
        self.state.links.get(&(account, code, action)).copied()
    }

    /// Exact link for the action, falling back to the wildcard link for
    /// the whole contract (stored under the empty action name).
    pub fn lookup_linked_permission(&self, account: AccountName, code: AccountName,
                                    action: ActionName) -> Option<PermissionName> {
        self.state.links.get(&(account, code, action))
            .or_else(|| self.state.links.get(&(account, code, Name::default())))
            .copied()
    }

    // --- contract tables -----------------------------------------------------

    pub fn find_table(&self, code: AccountName, scope: ScopeName,
                      table: TableName) -> Option<&Table> {
        let id = self.state.tables.get(&(code, scope, table))?;
        self.state.tables_by_id.get(id)
    }

    pub fn find_or_create_table(&mut self, code: AccountName, scope: ScopeName,
                                table: TableName, payer: AccountName) -> (TableId, bool) {
        if let Some(id) = self.state.tables.get(&(code, scope, table)) {
            return (*id, false);
        }
        let id = self.state.global.next_table_id;
        self.state.global.next_table_id += 1;
        self.state.tables.insert((code, scope, table), id);
        self.state.tables_by_id.insert(id, Table { id, code, scope, table, payer, count: 0 });
        (id, true)
    }

    pub fn table_by_id(&self, id: TableId) -> Result<&Table> {
        self.state.tables_by_id.get(&id)
            .context(DatabaseSnafu { msg: format!("no table with id {id}") })
    }

    fn remove_table(&mut self, id: TableId) {
        if let Some(t) = self.state.tables_by_id.remove(&id) {
            self.state.tables.remove(&(t.code, t.scope, t.table));
        }
    }

    pub fn find_row(&self, table_id: TableId, primary_key: u64) -> Option<&TableRow> {
        self.state.rows.get(&(table_id, primary_key))
    }

    pub fn insert_row(&mut self, table_id: TableId, primary_key: u64,
                      payer: AccountName, value: Bytes) -> Result<()> {
        ensure!(!self.state.rows.contains_key(&(table_id, primary_key)),
                DatabaseSnafu { msg: format!("primary key {primary_key} already exists in table {table_id}") });
        self.state.rows.insert((table_id, primary_key),
                               TableRow { table_id, primary_key, payer, value });
        if let Some(t) = self.state.tables_by_id.get_mut(&table_id) {
            t.count += 1;
        }
        Ok(())
    }

    pub fn update_row(&mut self, table_id: TableId, primary_key: u64,
                      payer: AccountName, value: Bytes) -> Result<()> {
        let row = self.state.rows.get_mut(&(table_id, primary_key))
            .context(DatabaseSnafu { msg: format!("no row with key {primary_key} in table {table_id}") })?;
        row.payer = payer;
        row.value = value;
        Ok(())
    }

    /// Remove a row; drops the table itself once its last row is gone.
    /// Returns whether the table was dropped.
    pub fn remove_row(&mut self, table_id: TableId, primary_key: u64) -> Result<bool> {
        self.state.rows.remove(&(table_id, primary_key))
            .context(DatabaseSnafu { msg: format!("no row with key {primary_key} in table {table_id}") })?;
        let count = {
            let t = self.state.tables_by_id.get_mut(&table_id)
                .context(DatabaseSnafu { msg: format!("no table with id {table_id}") })?;
            t.count -= 1;
            t.count
        };
        if count == 0 {
            self.remove_table(table_id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Smallest primary key in the table that is >= `key`.
    pub fn lowerbound_row(&self, table_id: TableId, key: u64) -> Option<&TableRow> {
        self.state.rows.range((table_id, key)..=(table_id, u64::MAX))
            .map(|(_, row)| row)
            .next()
    }

    /// Smallest primary key in the table that is > `key`.
    pub fn upperbound_row(&self, table_id: TableId, key: u64) -> Option<&TableRow> {
        if key == u64::MAX {
            return None;
        }
        self.lowerbound_row(table_id, key + 1)
    }

    /// Largest primary key in the table that is < `key`.
    pub fn previous_row(&self, table_id: TableId, key: u64) -> Option<&TableRow> {
        self.state.rows.range((table_id, 0)..(table_id, key))
            .map(|(_, row)| row)
            .next_back()
    }

    /// Largest primary key in the table.
    pub fn last_row(&self, table_id: TableId) -> Option<&TableRow> {
        self.state.rows.range((table_id, 0)..=(table_id, u64::MAX))
            .map(|(_, row)| row)
            .next_back()
    }

    // --- generated (deferred) transactions -----------------------------------

    pub fn find_generated_transaction(&self, sender: AccountName,
                                      sender_id: u128) -> Option<&GeneratedTransaction> {
        self.state.generated_transactions.get(&(sender, sender_id))
    }

    pub fn find_generated_by_trx_id(&self, sender: AccountName,
                                    trx_id: TransactionId) -> Option<&GeneratedTransaction> {
        self.state.generated_transactions.values()
            .find(|gt| gt.sender == sender && gt.trx_id == trx_id)
    }

    pub fn store_generated_transaction(&mut self, gt: GeneratedTransaction) {
        self.state.generated_transactions.insert((gt.sender, gt.sender_id), gt);
    }

    pub fn remove_generated_transaction(&mut self, sender: AccountName,
                                        sender_id: u128) -> Option<GeneratedTransaction> {
        self.state.generated_transactions.remove(&(sender, sender_id))
    }

    // --- transaction dedup ---------------------------------------------------

    pub fn record_transaction(&mut self, id: TransactionId,
                              expiration: TimePoint) -> Result<()> {
        ensure!(!self.state.transaction_dedup.contains_key(&id),
                DuplicateTransactionSnafu { id });
        self.state.transaction_dedup.insert(id, expiration);
        Ok(())
    }

    pub fn expire_transactions(&mut self, now: TimePoint) {
        self.state.transaction_dedup.retain(|_, exp| *exp > now);
    }

    // --- sequence numbers ----------------------------------------------------

    pub fn next_global_sequence(&mut self) -> u64 {
        self.state.global.global_action_sequence += 1;
        self.state.global.global_action_sequence
    }

    pub fn next_recv_sequence(&mut self, receiver: AccountName) -> Result<u64> {
        let meta = self.get_metadata_mut(receiver)?;
        meta.recv_sequence += 1;
        Ok(meta.recv_sequence)
    }

    pub fn next_auth_sequence(&mut self, account: AccountName) -> Result<u64> {
        let meta = self.get_metadata_mut(account)?;
        meta.auth_sequence += 1;
        Ok(meta.auth_sequence)
    }

    // --- resource usage ------------------------------------------------------

    pub fn initialize_account_usage(&mut self, account: AccountName) {
        self.state.usage.entry(account).or_default();
    }

    pub fn usage(&self, account: AccountName) -> AccountUsage {
        self.state.usage.get(&account).cloned().unwrap_or_default()
    }

    pub fn usage_mut(&mut self, account: AccountName) -> &mut AccountUsage {
        self.state.usage.entry(account).or_default()
    }
}

// =============================================================================
//
//     Unittests
//
// =============================================================================
