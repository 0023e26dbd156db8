//! Per-action execution context.
//!
//! One `ApplyContext` is created for every dispatched action. It runs the
//! receiver's handler, then replays the same action to every notified
//! account, and queues the inline actions and deferred transactions the
//! handlers generated. It is also the only door through which contract
//! code touches chain state: authorization queries, the table API, RAM
//! billing and console output all go through here.

use std::collections::BTreeMap;

use snafu::ensure;
use tracing::{debug, trace};

use crate::{
    AccountName, Action, Bytes, PermissionLevel, PermissionName, ScopeName, TableName,
    TimePoint, TransactionId,
    authorization::AuthorizationManager,
    chain::native::NativeAction,
    config::{self, ChainConfig},
    controller::Controller,
    db::{Database, GeneratedTransaction, TableId},
    error::{
        AccountNotFoundSnafu, ActionNotFoundSnafu, ActionValidateSnafu, DatabaseSnafu,
        DuplicateDeferredTransactionSnafu, InlineActionDepthExceededSnafu,
        InlineActionTooBigSnafu, InvalidTablePayerSnafu, MissingAuthSnafu, Result,
        TransactionSnafu, UnauthorizedRamBillingSnafu, UnsatisfiedAuthorizationSnafu,
    },
    chain::trace::{AccountAuthSequence, AccountDelta, ActionReceipt},
    transaction_context::TransactionContext,
};

/// Interval at which long RAM-delta validation loops yield to the
/// transaction deadline check.
const RAM_DELTA_CHECKTIME_INTERVAL: usize = 10;

pub struct ApplyContext<'a, 'b> {
    control: &'a mut Controller,
    trx: &'b mut TransactionContext,

    /// the account currently processing the action
    pub receiver: AccountName,
    act: Action,
    action_ordinal: u32,
    /// ordinal of the trace the first receiver executed under; inline
    /// actions scheduled from any notification hang off of it
    first_receiver_action_ordinal: u32,
    creator_action_ordinal: u32,
    recurse_depth: u32,
    privileged: bool,
    context_free: bool,

    /// accounts to replay the action to, with their trace ordinals;
    /// index 0 is the first receiver itself
    notified: Vec<(AccountName, u32)>,
    inline_actions: Vec<u32>,
    cfa_inline_actions: Vec<u32>,
    account_ram_deltas: BTreeMap<AccountName, i64>,
    pending_console: String,
    keyval_cache: IteratorCache,
}

impl<'a, 'b> ApplyContext<'a, 'b> {
    pub(crate) fn new(control: &'a mut Controller, trx: &'b mut TransactionContext,
                      action_ordinal: u32, recurse_depth: u32) -> Result<Self> {
        let trace = trx.get_action_trace(action_ordinal)?;
        Ok(Self {
            receiver: trace.receiver,
            act: trace.act.clone(),
            context_free: trace.context_free,
            creator_action_ordinal: trace.creator_action_ordinal,
            control,
            trx,
            action_ordinal,
            first_receiver_action_ordinal: action_ordinal,
            recurse_depth,
            privileged: false,
            notified: vec![],
            inline_actions: vec![],
            cfa_inline_actions: vec![],
            account_ram_deltas: BTreeMap::new(),
            pending_console: String::new(),
            keyval_cache: IteratorCache::new(),
        })
    }

    /// Run the action on its first receiver, replay it to every account it
    /// notified, then dispatch the inline actions it queued one recursion
    /// level deeper.
    pub(crate) fn exec(&mut self) -> Result<()> {
        self.notified.push((self.receiver, self.action_ordinal));
        self.exec_one()?;

        // handlers append to `notified` as they run; an account cannot be
        // notified twice so iterating by index visits each exactly once
        let mut i = 1;
        while i < self.notified.len() {
            let (receiver, ordinal) = self.notified[i];
            self.receiver = receiver;
            self.action_ordinal = ordinal;
            self.exec_one()?;
            i += 1;
        }

        if !self.cfa_inline_actions.is_empty() || !self.inline_actions.is_empty() {
            let max = self.control.config.max_inline_action_depth;
            ensure!(self.recurse_depth < max as u32, InlineActionDepthExceededSnafu { max });
        }

        for ordinal in std::mem::take(&mut self.cfa_inline_actions) {
            self.trx.execute_action(&mut *self.control, ordinal, self.recurse_depth + 1)?;
        }
        for ordinal in std::mem::take(&mut self.inline_actions) {
            self.trx.execute_action(&mut *self.control, ordinal, self.recurse_depth + 1)?;
        }
        Ok(())
    }

    fn exec_one(&mut self) -> Result<()> {
        trace!(receiver = %self.receiver, action = %self.act.name, ordinal = self.action_ordinal,
               "executing action");
        let start = self.trx.now();

        if let Err(e) = self.run_action() {
            let elapsed = self.trx.now() - start;
            self.finish_trace(None, elapsed)?;
            let trace = self.trx.get_action_trace_mut(self.action_ordinal)?;
            trace.except = Some(e.to_string());
            trace.error_code = Some(e.error_code());
            return Err(e);
        }

        // transient executions observe sequence numbers as zero so they
        // leave no trace in the chain's global ordering
        let transient = self.trx.is_transient();
        let (global_sequence, recv_sequence) = if transient {
            (0, 0)
        }
        else {
            (self.control.db.next_global_sequence(),
             self.control.db.next_recv_sequence(self.receiver)?)
        };

        let mut auth_sequence = Vec::with_capacity(self.act.authorization.len());
        for auth in &self.act.authorization {
            let sequence = if transient { 0 } else { self.control.db.next_auth_sequence(auth.actor)? };
            auth_sequence.push(AccountAuthSequence { account: auth.actor, sequence });
        }

        // code/abi sequences always come from the account the action targets,
        // not from whoever is receiving the notification
        let meta = self.control.db.get_metadata(self.act.account)?;
        let receipt = ActionReceipt {
            receiver: self.receiver,
            act_digest: self.act.digest(),
            global_sequence,
            recv_sequence,
            auth_sequence,
            code_sequence: meta.code_sequence,
            abi_sequence: meta.abi_sequence,
        };

        let elapsed = self.trx.now() - start;
        self.finish_trace(Some(receipt), elapsed)
    }

    fn run_action(&mut self) -> Result<()> {
        self.trx.checktime()?;

        let meta = self.control.db.get_metadata(self.receiver)?;
        self.privileged = meta.privileged;
        let has_contract = meta.has_contract;

        if self.receiver == config::SYSTEM_ACCOUNT {
            if let Some(native) = NativeAction::classify(self.act.account, self.act.name) {
                native.apply(self)?;
            }
        }

        if has_contract {
            if let Some(runtime) = self.control.runtime_for(self.receiver) {
                runtime.apply(self)?;
            }
        }
        else if self.act.account == self.receiver
             && self.receiver != config::SYSTEM_ACCOUNT
             && self.creator_action_ordinal == 0 {
            // a top-level action aimed at an account with no contract is a
            // mistake; as a mere notification it is silently ignored
            return ActionNotFoundSnafu { account: self.receiver, name: self.act.name }.fail();
        }

        self.validate_account_ram_deltas()
    }

    /// Everybody billed RAM by this action either authorized it, is the
    /// receiver itself, or consented through the payer pseudo-permission.
    fn validate_account_ram_deltas(&mut self) -> Result<()> {
        let not_in_notify_context = self.receiver == self.act.account;
        let deltas: Vec<(AccountName, i64)> =
            self.account_ram_deltas.iter().map(|(k, v)| (*k, *v)).collect();

        for (i, (payer, delta)) in deltas.into_iter().enumerate() {
            if i % RAM_DELTA_CHECKTIME_INTERVAL == RAM_DELTA_CHECKTIME_INTERVAL - 1 {
                self.trx.checktime()?;
            }
            if delta <= 0 || payer == self.receiver || self.privileged {
                continue;
            }
            ensure!(not_in_notify_context, UnauthorizedRamBillingSnafu { payer });
            ensure!(self.has_authorization(payer), UnauthorizedRamBillingSnafu { payer });

            if self.receiver == config::SYSTEM_ACCOUNT {
                continue;
            }
            // billing someone else requires their explicit consent through
            // the payer pseudo-permission (or system account involvement)
            let consented = self.act.authorization.iter().any(|a| {
                (a.actor == payer && a.permission == config::PAYER_PERMISSION)
                    || a.actor == config::SYSTEM_ACCOUNT
            });
            ensure!(consented, UnsatisfiedAuthorizationSnafu {
                level: PermissionLevel::new(payer, config::PAYER_PERMISSION),
            });
        }
        Ok(())
    }

    fn finish_trace(&mut self, receipt: Option<ActionReceipt>,
                    elapsed: crate::Microseconds) -> Result<()> {
        let console = std::mem::take(&mut self.pending_console);
        let deltas = std::mem::take(&mut self.account_ram_deltas);
        let trace = self.trx.get_action_trace_mut(self.action_ordinal)?;
        trace.receipt = receipt;
        trace.receiver = self.receiver;
        trace.console = console;
        trace.elapsed = elapsed;
        trace.account_ram_deltas = deltas.into_iter()
            .filter(|(_, delta)| *delta != 0)
            .map(|(account, delta)| AccountDelta { account, delta })
            .collect();
        Ok(())
    }

    // --- accessors -----------------------------------------------------------

    pub fn act(&self) -> &Action {
        &self.act
    }

    pub fn db(&self) -> &Database {
        &self.control.db
    }

    pub fn db_mut(&mut self) -> &mut Database {
        &mut self.control.db
    }

    pub fn pending_block_time(&self) -> TimePoint {
        self.control.pending_block_time()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.control.config
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn is_read_only(&self) -> bool {
        self.trx.is_read_only()
    }

    pub fn is_account(&self, account: AccountName) -> bool {
        self.control.db.find_account(account).is_some()
    }

    /// Append to the console output collected in the action's trace.
    pub fn print(&mut self, msg: impl AsRef<str>) {
        self.pending_console.push_str(msg.as_ref());
    }

    // --- authorization -------------------------------------------------------

    pub fn has_authorization(&self, account: AccountName) -> bool {
        self.act.authorization.iter().any(|a| a.actor == account)
    }

    pub fn require_authorization(&self, account: AccountName) -> Result<()> {
        ensure!(self.has_authorization(account),
                MissingAuthSnafu { account, permission: None::<PermissionName> });
        Ok(())
    }

    /// Like [`require_authorization`](Self::require_authorization), but the
    /// action must declare this exact permission level.
    pub fn require_authorization_level(&self, account: AccountName,
                                       permission: PermissionName) -> Result<()> {
        let wanted = PermissionLevel::new(account, permission);
        ensure!(self.act.authorization.contains(&wanted),
                MissingAuthSnafu { account, permission: Some(permission) });
        Ok(())
    }

    // --- notifications and inline actions ------------------------------------

    fn has_recipient(&self, account: AccountName) -> bool {
        self.notified.iter().any(|(recipient, _)| *recipient == account)
    }

    /// Replay the current action to `recipient` after the current handler
    /// returns. Idempotent within one action.
    pub fn require_recipient(&mut self, recipient: AccountName) -> Result<()> {
        if !self.has_recipient(recipient) {
            let ordinal = self.trx.schedule_action_from(
                self.action_ordinal, recipient, self.context_free,
                self.action_ordinal, self.first_receiver_action_ordinal)?;
            self.notified.push((recipient, ordinal));
        }
        Ok(())
    }

    /// Queue an inline action, dispatched after every notification of the
    /// current action completed, one recursion level deeper.
    pub fn execute_inline(&mut self, action: Action) -> Result<()> {
        ensure!(self.control.db.find_account(action.account).is_some(),
                ActionValidateSnafu {
                    msg: format!("inline action's code account '{}' does not exist", action.account),
                });

        let mut payer = None;
        for auth in &action.authorization {
            ensure!(self.control.db.find_account(auth.actor).is_some(), ActionValidateSnafu {
                msg: format!("inline action's authorizing actor '{}' does not exist", auth.actor),
            });
            if auth.permission == config::PAYER_PERMISSION {
                payer = Some(auth.actor);
                continue;
            }
            ensure!(self.control.db.find_permission(auth).is_some(), ActionValidateSnafu {
                msg: format!("inline action's authorizations include a non-existent permission: {auth}"),
            });
        }
        if let Some(payer) = payer {
            // the payer pseudo-permission needs a real authorization to
            // ride on, same as for input transactions
            let paired = action.authorization.iter().any(|a| {
                a.actor == payer && a.permission != config::PAYER_PERMISSION
            });
            ensure!(paired, UnsatisfiedAuthorizationSnafu {
                level: PermissionLevel::new(payer, config::PAYER_PERMISSION),
            });
        }

        let max = self.control.config.max_inline_action_size;
        ensure!(action.data.len() <= max as usize,
                InlineActionTooBigSnafu { size: action.data.len(), max });

        // the receiver vouches for inline actions through its implicit
        // sysio.code permission, everything else must check out normally;
        // dry runs still validate structure but tolerate missing
        // signatures, read-only executions skip the check entirely
        if !self.privileged && !self.trx.is_read_only() {
            let provided = std::collections::BTreeSet::from([
                PermissionLevel::new(self.receiver, config::CODE_PERMISSION),
            ]);
            let trx = &*self.trx;
            let manager = AuthorizationManager::new(&self.control.db, &self.control.config);
            manager.check_authorization(
                std::slice::from_ref(&action),
                &std::collections::BTreeSet::new(),
                &provided,
                crate::Microseconds::new(0),
                || trx.checktime(),
                true,
                trx.is_dry_run(),
            )?;
        }

        let ordinal = self.trx.schedule_action(
            action, self.receiver, false,
            self.action_ordinal, self.first_receiver_action_ordinal);
        self.inline_actions.push(ordinal);
        Ok(())
    }

    /// Like [`execute_inline`](Self::execute_inline) but context free: no
    /// authorizations allowed, none checked.
    pub fn execute_context_free_inline(&mut self, action: Action) -> Result<()> {
        ensure!(self.control.db.find_account(action.account).is_some(),
                ActionValidateSnafu {
                    msg: format!("inline action's code account '{}' does not exist", action.account),
                });
        ensure!(action.authorization.is_empty(), ActionValidateSnafu {
            msg: "context-free actions cannot have authorizations",
        });

        let ordinal = self.trx.schedule_action(
            action, self.receiver, true,
            self.action_ordinal, self.first_receiver_action_ordinal);
        self.cfa_inline_actions.push(ordinal);
        Ok(())
    }

    // --- deferred transactions -----------------------------------------------

    /// Store a transaction for later execution under `(receiver, sender_id)`,
    /// billing its storage to `payer`.
    pub fn schedule_deferred_transaction(&mut self, sender_id: u128, payer: AccountName,
                                         trx: crate::Transaction,
                                         replace_existing: bool) -> Result<()> {
        ensure!(!self.control.config.features.disable_deferred_trxs, TransactionSnafu {
            msg: "deferred transactions are disabled on this chain",
        });
        ensure!(!self.trx.is_transient(), TransactionSnafu {
            msg: "cannot schedule a deferred transaction from a transient transaction",
        });
        ensure!(self.control.db.find_account(payer).is_some(),
                AccountNotFoundSnafu { account: payer });
        if !self.privileged && payer != self.receiver {
            self.require_authorization(payer)?;
        }

        let sender = self.receiver;
        let published = self.control.pending_block_time();
        let delay_until = published + trx.delay();
        let window = self.control.config.deferred_trx_expiration_window;
        let gt = GeneratedTransaction {
            sender,
            sender_id,
            trx_id: trx.id(),
            payer,
            published,
            delay_until,
            expiration: delay_until + crate::Microseconds::seconds(window as i64),
            trx,
        };

        if let Some(existing) = self.control.db.find_generated_transaction(sender, sender_id) {
            ensure!(replace_existing, DuplicateDeferredTransactionSnafu { sender, sender_id });
            let old_payer = existing.payer;
            let old_size = existing.billable_size() as i64;
            // the replaced record still costs NET to retire later
            self.trx.add_net_usage(config::TRANSACTION_ID_NET_USAGE as u64);
            self.trx.check_net_usage()?;
            self.add_ram_usage(old_payer, -old_size)?;
        }

        debug!(%sender, sender_id, %payer, "scheduling deferred transaction");
        self.add_ram_usage(payer, gt.billable_size() as i64)?;
        self.control.db.store_generated_transaction(gt);
        Ok(())
    }

    /// Drop the deferred transaction stored under `(receiver, sender_id)`,
    /// refunding its storage. Returns whether one existed.
    pub fn cancel_deferred(&mut self, sender_id: u128) -> Result<bool> {
        let sender = self.receiver;
        match self.control.db.remove_generated_transaction(sender, sender_id) {
            None => Ok(false),
            Some(gt) => {
                self.add_ram_usage(gt.payer, -(gt.billable_size() as i64))?;
                Ok(true)
            }
        }
    }

    /// Cancel a deferred transaction of an arbitrary sender by its id,
    /// refunding storage to its payer.
    pub fn cancel_deferred_transaction(&mut self, sender: AccountName,
                                       trx_id: TransactionId) -> Result<()> {
        let Some(gt) = self.control.db.find_generated_by_trx_id(sender, trx_id) else {
            return TransactionSnafu {
                msg: format!("cannot cancel {trx_id}, there is no deferred transaction with that id"),
            }.fail();
        };
        let (sender_id, payer, refund) = (gt.sender_id, gt.payer, gt.billable_size() as i64);
        self.control.db.remove_generated_transaction(sender, sender_id);
        self.add_ram_usage(payer, -refund)
    }

    // --- RAM billing ---------------------------------------------------------

    /// Bill (or refund, for negative deltas) RAM to `payer`. Validation of
    /// who may be billed happens once the handler returns.
    pub fn add_ram_usage(&mut self, payer: AccountName, delta: i64) -> Result<()> {
        self.trx.add_ram_usage(&mut self.control.db, payer, delta)?;
        *self.account_ram_deltas.entry(payer).or_insert(0) += delta;
        Ok(())
    }

    // --- table API -----------------------------------------------------------

    fn ensure_writable(&self) -> Result<()> {
        ensure!(!self.trx.is_transient(), TransactionSnafu {
            msg: "cannot modify tables from a transient transaction",
        });
        Ok(())
    }

    /// Store a new row under the receiver's `(scope, table)`; returns an
    /// iterator to it.
    pub fn db_store_i64(&mut self, scope: ScopeName, table: TableName, payer: AccountName,
                        id: u64, value: &[u8]) -> Result<i32> {
        self.ensure_writable()?;
        ensure!(!payer.empty(), InvalidTablePayerSnafu { payer });

        let code = self.receiver;
        let (tid, created) = self.control.db.find_or_create_table(code, scope, table, payer);
        if created {
            self.add_ram_usage(payer, config::BILLABLE_SIZE_TABLE_OBJECT as i64)?;
        }
        self.control.db.insert_row(tid, id, payer, Bytes::from(value))?;
        self.add_ram_usage(payer, value.len() as i64 + config::BILLABLE_SIZE_KV_OBJECT as i64)?;

        self.keyval_cache.cache_table(tid);
        Ok(self.keyval_cache.add(tid, id))
    }

    /// Replace the value of the row behind `iterator`. An empty `payer`
    /// keeps the current one; changing payers moves the whole bill over.
    pub fn db_update_i64(&mut self, iterator: i32, payer: AccountName,
                         value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let (tid, key) = self.keyval_cache.get(iterator)?;
        let table = self.control.db.table_by_id(tid)?;
        ensure!(table.code == self.receiver,
                DatabaseSnafu { msg: "db access violation: table belongs to another contract" });

        let row = self.control.db.find_row(tid, key)
            .ok_or_else(|| DatabaseSnafu {
                msg: format!("no row with key {key} in table {tid}"),
            }.build())?;
        let old_payer = row.payer;
        let old_size = row.value.len() as i64 + config::BILLABLE_SIZE_KV_OBJECT as i64;
        let new_size = value.len() as i64 + config::BILLABLE_SIZE_KV_OBJECT as i64;
        let payer = if payer.empty() { old_payer } else { payer };

        if payer != old_payer {
            ensure!(!payer.empty(), InvalidTablePayerSnafu { payer });
            self.add_ram_usage(old_payer, -old_size)?;
            self.add_ram_usage(payer, new_size)?;
        }
        else if new_size != old_size {
            self.add_ram_usage(payer, new_size - old_size)?;
        }

        self.control.db.update_row(tid, key, payer, Bytes::from(value))
    }

    /// Delete the row behind `iterator`, refunding its payer. Dropping the
    /// last row of a table refunds the table overhead as well.
    pub fn db_remove_i64(&mut self, iterator: i32) -> Result<()> {
        self.ensure_writable()?;
        let (tid, key) = self.keyval_cache.get(iterator)?;
        let table = self.control.db.table_by_id(tid)?;
        ensure!(table.code == self.receiver,
                DatabaseSnafu { msg: "db access violation: table belongs to another contract" });
        let table_payer = table.payer;

        let row = self.control.db.find_row(tid, key)
            .ok_or_else(|| DatabaseSnafu {
                msg: format!("no row with key {key} in table {tid}"),
            }.build())?;
        let refund = row.value.len() as i64 + config::BILLABLE_SIZE_KV_OBJECT as i64;
        let row_payer = row.payer;

        self.add_ram_usage(row_payer, -refund)?;
        let table_dropped = self.control.db.remove_row(tid, key)?;
        if table_dropped {
            self.add_ram_usage(table_payer, -(config::BILLABLE_SIZE_TABLE_OBJECT as i64))?;
        }
        self.keyval_cache.remove(iterator);
        Ok(())
    }

    /// Read the value of the row behind `iterator`.
    pub fn db_get_i64(&self, iterator: i32) -> Result<Bytes> {
        let (tid, key) = self.keyval_cache.get(iterator)?;
        let row = self.control.db.find_row(tid, key)
            .ok_or_else(|| DatabaseSnafu {
                msg: format!("no row with key {key} in table {tid}"),
            }.build())?;
        Ok(row.value.clone())
    }

    /// Find the row with primary key `id`; the table's end iterator when
    /// the key is absent, `-1` when the table itself does not exist.
    pub fn db_find_i64(&mut self, code: AccountName, scope: ScopeName, table: TableName,
                       id: u64) -> i32 {
        let Some(tab) = self.control.db.find_table(code, scope, table) else { return -1 };
        let tid = tab.id;
        let end = self.keyval_cache.cache_table(tid);
        match self.control.db.find_row(tid, id) {
            Some(_) => self.keyval_cache.add(tid, id),
            None => end,
        }
    }

    /// First row with primary key `>= id`.
    pub fn db_lowerbound_i64(&mut self, code: AccountName, scope: ScopeName, table: TableName,
                             id: u64) -> i32 {
        let Some(tab) = self.control.db.find_table(code, scope, table) else { return -1 };
        let tid = tab.id;
        let end = self.keyval_cache.cache_table(tid);
        match self.control.db.lowerbound_row(tid, id) {
            Some(row) => { let key = row.primary_key; self.keyval_cache.add(tid, key) }
            None => end,
        }
    }

    /// First row with primary key `> id`.
    pub fn db_upperbound_i64(&mut self, code: AccountName, scope: ScopeName, table: TableName,
                             id: u64) -> i32 {
        let Some(tab) = self.control.db.find_table(code, scope, table) else { return -1 };
        let tid = tab.id;
        let end = self.keyval_cache.cache_table(tid);
        match self.control.db.upperbound_row(tid, id) {
            Some(row) => { let key = row.primary_key; self.keyval_cache.add(tid, key) }
            None => end,
        }
    }

    /// The end iterator of the table, `-1` when it does not exist.
    pub fn db_end_i64(&mut self, code: AccountName, scope: ScopeName,
                      table: TableName) -> i32 {
        match self.control.db.find_table(code, scope, table) {
            Some(tab) => { let tid = tab.id; self.keyval_cache.cache_table(tid) }
            None => -1,
        }
    }

    /// Step to the next row in primary key order. Returns the new iterator
    /// and the key it points at (the table's end iterator past the last row).
    pub fn db_next_i64(&mut self, iterator: i32) -> Result<(i32, u64)> {
        if iterator < -1 {
            // already past the end
            return Ok((-1, 0));
        }
        let (tid, key) = self.keyval_cache.get(iterator)?;
        match self.control.db.upperbound_row(tid, key) {
            Some(row) => {
                let key = row.primary_key;
                Ok((self.keyval_cache.add(tid, key), key))
            }
            None => Ok((self.keyval_cache.cache_table(tid), 0)),
        }
    }

    /// Step to the previous row in primary key order; accepts an end
    /// iterator to reach the last row. Returns `-1` before the first row.
    pub fn db_previous_i64(&mut self, iterator: i32) -> Result<(i32, u64)> {
        if iterator < -1 {
            let tid = self.keyval_cache.find_table_by_end_iterator(iterator)
                .ok_or_else(|| DatabaseSnafu { msg: "invalid end iterator" }.build())?;
            return match self.control.db.last_row(tid) {
                Some(row) => {
                    let key = row.primary_key;
                    Ok((self.keyval_cache.add(tid, key), key))
                }
                None => Ok((-1, 0)),
            };
        }
        let (tid, key) = self.keyval_cache.get(iterator)?;
        match self.control.db.previous_row(tid, key) {
            Some(row) => {
                let key = row.primary_key;
                Ok((self.keyval_cache.add(tid, key), key))
            }
            None => Ok((-1, 0)),
        }
    }
}


/// Maps `(table, primary key)` pairs to the small integer handles handed
/// to contract code. Non-negative handles point at rows; handles `<= -2`
/// are per-table end iterators; `-1` is the universal invalid iterator.
///
/// Handles stay valid for the lifetime of the action regardless of what
/// happens to other rows of the table.
#[derive(Debug, Default)]
struct IteratorCache {
    end_iterators: Vec<TableId>,
    table_to_end: BTreeMap<TableId, i32>,
    items: Vec<Option<(TableId, u64)>>,
    index: BTreeMap<(TableId, u64), i32>,
}

impl IteratorCache {
    fn new() -> Self {
        Self::default()
    }

    /// The end iterator for `table`, allocating one on first use.
    fn cache_table(&mut self, table: TableId) -> i32 {
        if let Some(end) = self.table_to_end.get(&table) {
            return *end;
        }
        let end = -(self.end_iterators.len() as i32) - 2;
        self.end_iterators.push(table);
        self.table_to_end.insert(table, end);
        end
    }

    fn find_table_by_end_iterator(&self, iterator: i32) -> Option<TableId> {
        if iterator >= -1 {
            return None;
        }
        self.end_iterators.get((-iterator - 2) as usize).copied()
    }

    fn add(&mut self, table: TableId, key: u64) -> i32 {
        if let Some(it) = self.index.get(&(table, key)) {
            return *it;
        }
        let it = self.items.len() as i32;
        self.items.push(Some((table, key)));
        self.index.insert((table, key), it);
        it
    }

    fn get(&self, iterator: i32) -> Result<(TableId, u64)> {
        let slot = usize::try_from(iterator).ok().and_then(|i| self.items.get(i));
        match slot {
            Some(Some(entry)) => Ok(*entry),
            _ => DatabaseSnafu { msg: format!("invalid table iterator {iterator}") }.fail(),
        }
    }

    fn remove(&mut self, iterator: i32) {
        if let Ok(i) = usize::try_from(iterator) {
            if let Some(slot) = self.items.get_mut(i) {
                if let Some(entry) = slot.take() {
                    self.index.remove(&entry);
                }
            }
        }
    }
}


// =============================================================================
//
//     Unittests
//
// =============================================================================

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;
    use super::*;

    #[test]
    fn iterator_cache_end_iterators_are_per_table() {
        let mut cache = IteratorCache::new();
        let end1 = cache.cache_table(1);
        let end2 = cache.cache_table(2);
        assert_eq!(end1, -2);
        assert_eq!(end2, -3);
        assert_eq!(cache.cache_table(1), end1);
        assert_eq!(cache.find_table_by_end_iterator(end2), Some(2));
        assert_eq!(cache.find_table_by_end_iterator(-1), None);
        assert_eq!(cache.find_table_by_end_iterator(-10), None);
    }

    #[test]
    fn iterator_cache_handles_are_stable() -> Result<()> {
        let mut cache = IteratorCache::new();
        let a = cache.add(1, 10);
        let b = cache.add(1, 20);
        assert_ne!(a, b);
        assert_eq!(cache.add(1, 10), a);
        assert_eq!(cache.get(a)?, (1, 10));

        cache.remove(a);
        assert!(cache.get(a).is_err());
        // the slot is retired, not recycled
        let c = cache.add(1, 10);
        assert_ne!(c, a);
        assert_eq!(cache.get(c)?, (1, 10));
        Ok(())
    }

    #[test]
    fn invalid_iterators_are_rejected() {
        let cache = IteratorCache::new();
        assert!(cache.get(-1).is_err());
        assert!(cache.get(0).is_err());
        assert!(cache.get(i32::MAX).is_err());
    }
}
