//! Per-transaction execution context: resource budgeting, deadlines and
//! the trace being built.
//!
//! A `TransactionContext` owns the transaction for its whole lifecycle:
//! it derives the NET and CPU budgets, schedules the root actions,
//! dispatches them through [`ApplyContext`](crate::apply_context::ApplyContext)
//! instances, and finally settles the bill against every authorizing
//! account.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use snafu::ensure;
use tracing::{debug, trace};

use crate::{
    AccountName, Action, ActionTrace, Microseconds, Name, PermissionLevel, TimePoint,
    Transaction, TransactionId, TransactionTrace,
    apply_context::ApplyContext,
    config,
    controller::{Clock, Controller},
    db::{Database, GeneratedTransaction},
    error::{
        BlockCpuUsageExceededSnafu, BlockNetUsageExceededSnafu, DatabaseSnafu,
        DeadlineExceededSnafu, DuplicateDeferredTransactionSnafu, ExpiredTransactionSnafu,
        GreylistCpuUsageExceededSnafu, GreylistNetUsageExceededSnafu,
        LeewayDeadlineExceededSnafu, PermissionNotFoundSnafu, Result, TransactionSnafu,
        TransactionInterruptedSnafu, TxCpuUsageExceededSnafu, TxNetUsageExceededSnafu,
    },
};

#[derive(Eq, PartialEq, Debug, Copy, Clone, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TrxType {
    /// signed transaction pushed from the outside
    Input,
    /// generated by the chain itself (eg. onerror dispatch)
    Implicit,
    /// previously delayed, now executing from storage
    Scheduled,
    /// speculative execution, always rolled back, sequences read as zero
    ReadOnly,
    /// like read-only but carrying authorizations to validate
    DryRun,
}

#[derive(Eq, PartialEq, Debug, Copy, Clone)]
enum State {
    Created,
    Initialized,
    Executing,
    Finalized,
}

/// Which budget the current deadline comes from; decides the error raised
/// when the clock runs past it.
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
enum DeadlineKind {
    /// the node's wall-clock limit or the block production deadline
    Node,
    /// the remaining objective CPU budget of the block
    Block,
    /// the objective per-transaction CPU ceiling
    TxCpu,
    /// the billed account's own CPU quota
    AccountCpu,
    /// the account quota plus subjective leeway
    Leeway,
}

pub struct TransactionContext {
    trx: Transaction,
    id: TransactionId,
    trx_type: TrxType,
    trace: TransactionTrace,
    state: State,
    clock: Clock,
    interrupt: Rc<Cell<bool>>,

    published: TimePoint,
    block_time: TimePoint,
    delay: Microseconds,
    bill_to_accounts: Vec<AccountName>,
    /// accounts whose RAM usage grew and must be re-validated at the end
    validate_ram_usage: BTreeSet<AccountName>,

    net_usage: u64,
    net_limit: u64,
    /// `net_limit` minus a leeway margin while the block budget binds, so
    /// speculative execution stays under what validation will allow
    eager_net_limit: u64,
    net_limit_due_to_block: bool,

    start: TimePoint,
    /// start of the billable window; shifted forward by paused intervals
    pseudo_start: TimePoint,
    paused_at: Option<TimePoint>,
    deadline: TimePoint,
    block_deadline: TimePoint,
    deadline_kind: DeadlineKind,
    objective_duration_limit: Microseconds,
    cpu_limit_due_to_block: bool,
    account_cpu_limit: i64,
    greylisted_cpu: bool,
    min_transaction_cpu_usage: u32,
    explicit_billed_cpu_time_us: Option<u32>,
    enforce_deadlines: bool,
}

impl TransactionContext {
    pub fn new(trx: Transaction, trx_type: TrxType, clock: Clock) -> Self {
        let id = trx.id();
        let now = clock();
        let trace = TransactionTrace {
            id,
            scheduled: trx_type == TrxType::Scheduled,
            ..Default::default()
        };
        Self {
            trx,
            id,
            trx_type,
            trace,
            state: State::Created,
            clock,
            interrupt: Rc::new(Cell::new(false)),
            published: now,
            block_time: now,
            delay: Microseconds::default(),
            bill_to_accounts: vec![],
            validate_ram_usage: BTreeSet::new(),
            net_usage: 0,
            net_limit: u64::MAX,
            eager_net_limit: u64::MAX,
            net_limit_due_to_block: true,
            start: now,
            pseudo_start: now,
            paused_at: None,
            deadline: TimePoint::maximum(),
            block_deadline: TimePoint::maximum(),
            deadline_kind: DeadlineKind::Node,
            objective_duration_limit: Microseconds::maximum(),
            cpu_limit_due_to_block: true,
            account_cpu_limit: i64::MAX,
            greylisted_cpu: false,
            min_transaction_cpu_usage: 0,
            explicit_billed_cpu_time_us: None,
            enforce_deadlines: true,
        }
    }

    // --- accessors -----------------------------------------------------------

    pub fn transaction(&self) -> &Transaction {
        &self.trx
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn delay(&self) -> Microseconds {
        self.delay
    }

    pub fn trace(&self) -> &TransactionTrace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut TransactionTrace {
        &mut self.trace
    }

    pub fn into_trace(self) -> TransactionTrace {
        self.trace
    }

    pub(crate) fn is_transient(&self) -> bool {
        matches!(self.trx_type, TrxType::ReadOnly | TrxType::DryRun)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.trx_type == TrxType::ReadOnly
    }

    pub(crate) fn is_dry_run(&self) -> bool {
        self.trx_type == TrxType::DryRun
    }

    pub(crate) fn now(&self) -> TimePoint {
        (self.clock)()
    }

    /// Wall-clock time since execution started.
    pub fn elapsed(&self) -> Microseconds {
        self.now() - self.start
    }

    /// Billable time: elapsed minus the paused intervals.
    fn billed_now(&self) -> Microseconds {
        self.now() - self.pseudo_start
    }

    /// A handle through which another thread of control can request the
    /// transaction be abandoned at the next deadline check.
    pub fn interrupt_handle(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.interrupt)
    }

    /// When replaying with an externally supplied bill, deadlines derived
    /// from our own clock are meaningless and only the block deadline is
    /// enforced; the bill is validated after the fact instead.
    pub fn set_explicit_billed_cpu_time(&mut self, billed_us: u32) {
        self.explicit_billed_cpu_time_us = Some(billed_us);
    }

    // --- initialization ------------------------------------------------------

    pub fn init_for_input_trx(&mut self, control: &mut Controller) -> Result<()> {
        let expiration = TimePoint::from(self.trx.expiration);
        ensure!(control.pending_block_time() < expiration,
                ExpiredTransactionSnafu { id: self.id, expiration });
        ensure!(!self.trx.actions.is_empty(),
                TransactionSnafu { msg: "transaction must have at least one action" });
        ensure!(self.trx.first_authorizer().is_some(),
                TransactionSnafu { msg: "transaction must have at least one authorization" });

        self.published = control.pending_block_time();
        self.delay = self.trx.delay();
        control.db.record_transaction(self.id, expiration)?;

        // base charge plus the payload itself; a delayed transaction also
        // pays up front for its storage and eventual retirement
        let mut initial_net = control.config.base_per_transaction_net_usage as u64
            + serde_json::to_vec(&self.trx).unwrap_or_default().len() as u64;
        if self.delay.count() > 0 {
            initial_net += control.config.base_per_transaction_net_usage as u64
                + config::TRANSACTION_ID_NET_USAGE as u64;
        }

        self.bill_to_accounts = authorizing_accounts(&self.trx);
        self.init(control, initial_net)
    }

    pub fn init_for_deferred_trx(&mut self, control: &mut Controller,
                                 published: TimePoint) -> Result<()> {
        ensure!(!self.trx.actions.is_empty(),
                TransactionSnafu { msg: "transaction must have at least one action" });
        self.published = published;
        self.bill_to_accounts = authorizing_accounts(&self.trx);
        self.init(control, 0)
    }

    pub fn init_for_readonly_trx(&mut self, control: &mut Controller) -> Result<()> {
        ensure!(!self.trx.actions.is_empty(),
                TransactionSnafu { msg: "transaction must have at least one action" });
        self.published = control.pending_block_time();
        self.init(control, 0)
    }

    fn init(&mut self, control: &mut Controller, initial_net_usage: u64) -> Result<()> {
        let cfg = control.config;
        let global = &control.db.state().global;

        self.block_time = control.pending_block_time();
        self.block_deadline = control.block_deadline();
        self.min_transaction_cpu_usage = cfg.min_transaction_cpu_usage;
        self.enforce_deadlines = control.node_config.enforce_deadlines;

        // NET: start from what is left in the block, tighten to the chain's
        // per-transaction ceiling, then to the caller's own cap
        let mut net_limit = cfg.max_block_net_usage
            .saturating_sub(global.pending_block_net_usage);
        self.net_limit_due_to_block = true;
        if (cfg.max_transaction_net_usage as u64) < net_limit {
            net_limit = cfg.max_transaction_net_usage as u64;
            self.net_limit_due_to_block = false;
        }
        if self.trx.max_net_usage_words > 0 {
            let caller_limit = self.trx.max_net_usage_words as u64 * 8;
            if caller_limit < net_limit {
                net_limit = caller_limit;
                self.net_limit_due_to_block = false;
            }
        }
        self.net_limit = net_limit;
        self.eager_net_limit = if self.net_limit_due_to_block {
            net_limit - (cfg.net_usage_leeway as u64).min(net_limit)
        }
        else {
            net_limit
        };

        // CPU: same cascade
        let mut objective = Microseconds::new(
            (cfg.max_block_cpu_usage as u64).saturating_sub(global.pending_block_cpu_usage) as i64);
        self.cpu_limit_due_to_block = true;
        if (cfg.max_transaction_cpu_usage as i64) < objective.count() {
            objective = Microseconds::new(cfg.max_transaction_cpu_usage as i64);
            self.cpu_limit_due_to_block = false;
        }
        if self.trx.max_cpu_usage_ms > 0 {
            let caller_limit = Microseconds::milliseconds(self.trx.max_cpu_usage_ms as i64);
            if caller_limit < objective {
                objective = caller_limit;
                self.cpu_limit_due_to_block = false;
            }
        }
        self.objective_duration_limit = objective;

        // tightest per-account CPU quota, minus what failed attempts
        // already cost this node subjectively
        self.account_cpu_limit = i64::MAX;
        self.greylisted_cpu = false;
        for account in self.bill_to_accounts.clone() {
            let remaining = if self.trx_type == TrxType::Input {
                control.subjective_cpu_left(account).map(|m| m.count())
            }
            else {
                control.db.account_cpu_limit(account).map(|l| l as i64)
            };
            if let Some(remaining) = remaining {
                if remaining < self.account_cpu_limit {
                    self.account_cpu_limit = remaining;
                    self.greylisted_cpu = control.is_greylisted(account);
                }
            }
        }

        self.start = self.now();
        self.pseudo_start = self.start;
        self.compute_deadline(&control.node_config);

        self.check_net_usage_against(initial_net_usage, self.eager_net_limit)?;
        self.net_usage = initial_net_usage;
        self.state = State::Initialized;
        self.checktime()
    }

    fn compute_deadline(&mut self, node: &crate::config::NodeConfig) {
        if self.explicit_billed_cpu_time_us.is_some() || !self.enforce_deadlines {
            self.deadline = self.block_deadline;
            self.deadline_kind = DeadlineKind::Node;
            return;
        }

        self.deadline = self.start + self.objective_duration_limit;
        self.deadline_kind = if self.cpu_limit_due_to_block {
            DeadlineKind::Block
        }
        else {
            DeadlineKind::TxCpu
        };

        if self.account_cpu_limit < self.objective_duration_limit.count() {
            let account_limit = Microseconds::new(self.account_cpu_limit.max(0));
            let leeway = (self.trx_type == TrxType::Input)
                .then_some(node.subjective_cpu_leeway)
                .flatten();
            let (candidate, kind) = match leeway {
                Some(leeway) => (self.start + account_limit + leeway, DeadlineKind::Leeway),
                None => (self.start + account_limit, DeadlineKind::AccountCpu),
            };
            if candidate < self.deadline {
                self.deadline = candidate;
                self.deadline_kind = kind;
            }
        }

        let node_deadline = self.start + node.max_transaction_time;
        if node_deadline < self.deadline {
            self.deadline = node_deadline;
            self.deadline_kind = DeadlineKind::Node;
        }
        if self.block_deadline < self.deadline {
            self.deadline = self.block_deadline;
            self.deadline_kind = DeadlineKind::Node;
        }
    }

    // --- deadline checking ---------------------------------------------------

    /// Fail if the transaction was interrupted or ran past its deadline.
    /// Called at every significant step of execution.
    pub fn checktime(&self) -> Result<()> {
        if self.interrupt.get() {
            return TransactionInterruptedSnafu { elapsed: self.elapsed() }.fail();
        }
        let now = self.now();
        if now < self.deadline || self.paused_at.is_some() {
            return Ok(());
        }

        let billed = (now - self.pseudo_start).count();
        match self.deadline_kind {
            DeadlineKind::Node =>
                DeadlineExceededSnafu { elapsed: now - self.start }.fail(),
            DeadlineKind::Block =>
                BlockCpuUsageExceededSnafu {
                    billed, limit: self.objective_duration_limit.count(),
                }.fail(),
            DeadlineKind::TxCpu =>
                TxCpuUsageExceededSnafu {
                    billed, limit: self.objective_duration_limit.count(),
                }.fail(),
            DeadlineKind::AccountCpu if self.greylisted_cpu =>
                GreylistCpuUsageExceededSnafu { billed, limit: self.account_cpu_limit }.fail(),
            DeadlineKind::AccountCpu =>
                TxCpuUsageExceededSnafu { billed, limit: self.account_cpu_limit }.fail(),
            DeadlineKind::Leeway =>
                LeewayDeadlineExceededSnafu { elapsed: now - self.start }.fail(),
        }
    }

    /// Stop the billing clock, eg. while waiting on work that is nobody's
    /// fault (signature recovery on another thread).
    pub fn pause_billing_timer(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(self.now());
        }
    }

    /// Restart the billing clock, shifting the billable window and the
    /// deadline by the paused interval. The block deadline never moves.
    pub fn resume_billing_timer(&mut self) {
        let Some(paused) = self.paused_at.take() else { return };
        let shift = self.now() - paused;
        self.pseudo_start += shift;
        let shifted = self.deadline + shift;
        if shifted > self.block_deadline {
            self.deadline = self.block_deadline;
            self.deadline_kind = DeadlineKind::Node;
        }
        else {
            self.deadline = shifted;
        }
    }

    // --- validation ----------------------------------------------------------

    /// Every account and permission the transaction names must exist; the
    /// implicit pseudo-permissions are exempt since no row backs them.
    pub fn validate_referenced_accounts(&self, control: &Controller) -> Result<()> {
        for act in &self.trx.actions {
            control.db.get_account(act.account)?;
            for auth in &act.authorization {
                control.db.get_account(auth.actor)?;
                let name = auth.permission;
                if name == config::ANY_PERMISSION
                    || name == config::CODE_PERMISSION
                    || name == config::PAYER_PERMISSION {
                    continue;
                }
                ensure!(control.db.find_permission(auth).is_some(),
                        PermissionNotFoundSnafu { level: *auth });
            }
        }
        Ok(())
    }

    // --- action scheduling and dispatch --------------------------------------

    /// Append a new action trace slot; returns its 1-based ordinal.
    pub(crate) fn schedule_action(&mut self, act: Action, receiver: AccountName,
                                  context_free: bool, creator_action_ordinal: u32,
                                  closest_unnotified_ancestor_action_ordinal: u32) -> u32 {
        let action_ordinal = self.trace.action_traces.len() as u32 + 1;
        self.trace.action_traces.push(ActionTrace {
            action_ordinal,
            creator_action_ordinal,
            closest_unnotified_ancestor_action_ordinal,
            receiver,
            act,
            context_free,
            trx_id: self.id,
            block_time: self.block_time,
            ..Default::default()
        });
        action_ordinal
    }

    /// Schedule a notification: same action as the trace at `ordinal`,
    /// delivered to a different receiver.
    pub(crate) fn schedule_action_from(&mut self, ordinal: u32, receiver: AccountName,
                                       context_free: bool, creator_action_ordinal: u32,
                                       closest_unnotified_ancestor_action_ordinal: u32)
                                       -> Result<u32> {
        let act = self.get_action_trace(ordinal)?.act.clone();
        Ok(self.schedule_action(act, receiver, context_free, creator_action_ordinal,
                                closest_unnotified_ancestor_action_ordinal))
    }

    pub(crate) fn get_action_trace(&self, ordinal: u32) -> Result<&ActionTrace> {
        self.trace.action_traces.get(ordinal.wrapping_sub(1) as usize)
            .ok_or_else(|| DatabaseSnafu {
                msg: format!("no action trace with ordinal {ordinal}"),
            }.build())
    }

    pub(crate) fn get_action_trace_mut(&mut self, ordinal: u32) -> Result<&mut ActionTrace> {
        self.trace.action_traces.get_mut(ordinal.wrapping_sub(1) as usize)
            .ok_or_else(|| DatabaseSnafu {
                msg: format!("no action trace with ordinal {ordinal}"),
            }.build())
    }

    pub(crate) fn execute_action(&mut self, control: &mut Controller, ordinal: u32,
                                 recurse_depth: u32) -> Result<()> {
        let mut ctx = ApplyContext::new(control, self, ordinal, recurse_depth)?;
        ctx.exec()
    }

    /// Execute the whole transaction: every root action, with everything
    /// each of them notifies and queues inline.
    pub fn exec(&mut self, control: &mut Controller) -> Result<()> {
        self.state = State::Executing;

        for act in self.trx.actions.clone() {
            let receiver = act.account;
            self.schedule_action(act, receiver, false, 0, 0);
        }
        let root_actions = self.trace.action_traces.len() as u32;
        for ordinal in 1..=root_actions {
            self.checktime()?;
            self.execute_action(control, ordinal, 0)?;
        }
        Ok(())
    }

    /// Store the transaction for execution once its delay elapsed, instead
    /// of executing it now. Storage is billed to the first authorizer.
    pub fn schedule_as_delayed(&mut self, control: &mut Controller) -> Result<()> {
        let payer = self.trx.first_authorizer()
            .ok_or_else(|| TransactionSnafu {
                msg: "delayed transaction must have at least one authorization",
            }.build())?;

        // delayed input transactions live under the empty sender with a
        // sender id carved out of the transaction id
        let sender = Name::default();
        let sender_id = u128::from_be_bytes(
            self.id.as_bytes()[..16].try_into().unwrap_or_default());
        ensure!(control.db.find_generated_transaction(sender, sender_id).is_none(),
                DuplicateDeferredTransactionSnafu { sender, sender_id });

        let delay_until = self.published + self.delay;
        let window = control.config.deferred_trx_expiration_window;
        debug!(id = %self.id, %delay_until, "delaying transaction");
        let gt = GeneratedTransaction {
            sender,
            sender_id,
            trx_id: self.id,
            payer,
            published: self.published,
            delay_until,
            expiration: delay_until + Microseconds::seconds(window as i64),
            trx: self.trx.clone(),
        };
        let ram_delta = gt.billable_size() as i64;
        control.db.store_generated_transaction(gt);
        self.add_ram_usage(&mut control.db, payer, ram_delta)
    }

    // --- resource accounting -------------------------------------------------

    pub(crate) fn add_ram_usage(&mut self, db: &mut Database, payer: AccountName,
                                delta: i64) -> Result<()> {
        db.add_ram_usage(payer, delta)?;
        if delta > 0 {
            self.validate_ram_usage.insert(payer);
        }
        Ok(())
    }

    pub(crate) fn add_net_usage(&mut self, bytes: u64) {
        self.net_usage += bytes;
    }

    fn check_net_usage_against(&self, usage: u64, limit: u64) -> Result<()> {
        if usage <= limit {
            return Ok(());
        }
        if self.net_limit_due_to_block {
            BlockNetUsageExceededSnafu { billed: usage, limit }.fail()
        }
        else {
            TxNetUsageExceededSnafu { billed: usage, limit }.fail()
        }
    }

    pub(crate) fn check_net_usage(&self) -> Result<()> {
        self.check_net_usage_against(self.net_usage, self.eager_net_limit)
    }

    // --- finalization --------------------------------------------------------

    /// Settle the bill: validate RAM growth, round and validate NET,
    /// compute the CPU bill and validate it objectively and per account,
    /// then record everything in state and the trace.
    pub fn finalize(&mut self, control: &mut Controller) -> Result<()> {
        let now = self.now();
        self.trace.elapsed = now - self.start;

        if self.is_transient() {
            self.trace.net_usage = self.net_usage;
            self.state = State::Finalized;
            return Ok(());
        }

        for account in &self.validate_ram_usage {
            control.db.verify_account_ram_usage(*account)?;
        }

        // NET rounds up to full words and is now checked against the real
        // limit, leeway no longer applies
        self.net_usage = self.net_usage.div_ceil(8) * 8;
        self.check_net_usage_against(self.net_usage, self.net_limit)?;

        let billed = match self.explicit_billed_cpu_time_us {
            Some(explicit) => explicit as i64,
            None => self.billed_now().count().max(self.min_transaction_cpu_usage as i64),
        };
        self.distribute_cpu_residual(billed);

        if billed > self.objective_duration_limit.count() {
            let limit = self.objective_duration_limit.count();
            return if self.cpu_limit_due_to_block {
                BlockCpuUsageExceededSnafu { billed, limit }.fail()
            }
            else {
                TxCpuUsageExceededSnafu { billed, limit }.fail()
            };
        }

        self.validate_account_usage(control, billed)?;

        control.db.add_transaction_usage(&self.bill_to_accounts, billed as u64, self.net_usage)?;

        self.trace.cpu_usage_us = billed as u32;
        self.trace.net_usage = self.net_usage;
        trace!(id = %self.id, cpu_us = billed, net = self.net_usage, "transaction finalized");
        self.state = State::Finalized;
        Ok(())
    }

    /// The billed CPU always exceeds the sum of per-action wall clock (the
    /// context machinery in between is billable too); spread the residual
    /// over the action traces so they add up to the bill, biased upward.
    fn distribute_cpu_residual(&mut self, billed: i64) {
        let n = self.trace.action_traces.len() as i64;
        if n == 0 {
            return;
        }
        let accounted: i64 = self.trace.action_traces.iter()
            .map(|at| at.elapsed.count())
            .sum();
        let residual = billed - accounted;
        if residual <= 0 {
            return;
        }
        let share = residual / n;
        let remainder = residual % n;
        for (i, at) in self.trace.action_traces.iter_mut().enumerate() {
            let extra = share + if (i as i64) < remainder { 1 } else { 0 };
            at.elapsed += Microseconds::new(extra);
        }
    }

    fn validate_account_usage(&self, control: &Controller, billed_cpu: i64) -> Result<()> {
        for &account in &self.bill_to_accounts {
            let greylisted = control.is_greylisted(account);
            if let Some(limit) = control.db.account_net_limit(account) {
                if self.net_usage > limit {
                    return if greylisted {
                        GreylistNetUsageExceededSnafu { billed: self.net_usage, limit }.fail()
                    }
                    else {
                        TxNetUsageExceededSnafu { billed: self.net_usage, limit }.fail()
                    };
                }
            }
            if let Some(limit) = control.db.account_cpu_limit(account) {
                let limit = limit as i64;
                if billed_cpu > limit {
                    return if greylisted {
                        GreylistCpuUsageExceededSnafu { billed: billed_cpu, limit }.fail()
                    }
                    else {
                        TxCpuUsageExceededSnafu { billed: billed_cpu, limit }.fail()
                    };
                }
            }
        }
        Ok(())
    }

    // --- retry support -------------------------------------------------------

    /// Reset to a pristine pre-init state after an interrupt, so the
    /// transaction can be attempted once more.
    pub fn reset_for_retry(&mut self) {
        self.trace = TransactionTrace {
            id: self.id,
            scheduled: self.trx_type == TrxType::Scheduled,
            ..Default::default()
        };
        self.state = State::Created;
        self.interrupt.set(false);
        self.bill_to_accounts.clear();
        self.validate_ram_usage.clear();
        self.net_usage = 0;
        self.net_limit = u64::MAX;
        self.eager_net_limit = u64::MAX;
        self.net_limit_due_to_block = true;
        self.paused_at = None;
        self.deadline = TimePoint::maximum();
        self.deadline_kind = DeadlineKind::Node;
        self.objective_duration_limit = Microseconds::maximum();
        self.cpu_limit_due_to_block = true;
        self.account_cpu_limit = i64::MAX;
        self.greylisted_cpu = false;
    }
}

/// Distinct authorizing actors across all actions, in first-seen order.
/// The payer pseudo-permission also marks its actor as billable.
fn authorizing_accounts(trx: &Transaction) -> Vec<AccountName> {
    let mut seen = BTreeSet::new();
    let mut accounts = vec![];
    for level in trx.actions.iter().flat_map(|a| a.authorization.iter()) {
        let PermissionLevel { actor, .. } = *level;
        if seen.insert(actor) {
            accounts.push(actor);
        }
    }
    accounts
}


// =============================================================================
//
//     Unittests
//
// =============================================================================

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use color_eyre::eyre::Result;

    use crate::{Bytes, ChainError, Name, PermissionLevel};
    use super::*;

    fn simple_trx() -> Transaction {
        let mut trx = Transaction::default();
        trx.actions.push(Action::new(
            Name::constant("hodl"), Name::constant("transfer"),
            vec![PermissionLevel::new(Name::constant("alice"), Name::constant("active"))],
            Bytes::from(&b"{}"[..]),
        ));
        trx
    }

    fn fixed_clock(micros: i64) -> Clock {
        Rc::new(move || TimePoint::new(micros))
    }

    #[test]
    fn authorizing_accounts_dedups_in_order() {
        let mut trx = simple_trx();
        trx.actions.push(Action::new(
            Name::constant("hodl"), Name::constant("burn"),
            vec![
                PermissionLevel::new(Name::constant("bob"), Name::constant("active")),
                PermissionLevel::new(Name::constant("alice"), Name::constant("owner")),
            ],
            Bytes::default(),
        ));
        assert_eq!(authorizing_accounts(&trx),
                   vec![Name::constant("alice"), Name::constant("bob")]);
    }

    #[test]
    fn interrupt_fails_the_next_checktime() {
        let tc = TransactionContext::new(simple_trx(), TrxType::Input, fixed_clock(0));
        assert!(tc.checktime().is_ok());

        tc.interrupt_handle().set(true);
        let err = tc.checktime().unwrap_err();
        assert!(matches!(err, ChainError::TransactionInterrupted { .. }));
    }

    #[test]
    fn checktime_maps_deadline_kinds() {
        // advancing clock: each call returns 100us more
        let t = Rc::new(Cell::new(0i64));
        let t2 = Rc::clone(&t);
        let clock: Clock = Rc::new(move || {
            t2.set(t2.get() + 100);
            TimePoint::new(t2.get())
        });

        let mut tc = TransactionContext::new(simple_trx(), TrxType::Input, clock);
        tc.start = TimePoint::new(0);
        tc.pseudo_start = tc.start;

        tc.deadline = TimePoint::new(50);
        tc.deadline_kind = DeadlineKind::Node;
        assert!(matches!(tc.checktime().unwrap_err(),
                         ChainError::DeadlineExceeded { .. }));

        tc.deadline_kind = DeadlineKind::Block;
        assert!(matches!(tc.checktime().unwrap_err(),
                         ChainError::BlockCpuUsageExceeded { .. }));

        tc.deadline_kind = DeadlineKind::Leeway;
        assert!(matches!(tc.checktime().unwrap_err(),
                         ChainError::LeewayDeadlineExceeded { .. }));

        tc.deadline_kind = DeadlineKind::AccountCpu;
        assert!(matches!(tc.checktime().unwrap_err(),
                         ChainError::TxCpuUsageExceeded { .. }));
        tc.greylisted_cpu = true;
        assert!(matches!(tc.checktime().unwrap_err(),
                         ChainError::GreylistCpuUsageExceeded { .. }));
    }

    #[test]
    fn pausing_shifts_the_billable_window() {
        let t = Rc::new(Cell::new(0i64));
        let t2 = Rc::clone(&t);
        let clock: Clock = Rc::new(move || TimePoint::new(t2.get()));

        let mut tc = TransactionContext::new(simple_trx(), TrxType::Input, clock);
        tc.start = TimePoint::new(0);
        tc.pseudo_start = tc.start;
        tc.deadline = TimePoint::new(1000);
        tc.block_deadline = TimePoint::new(10_000);

        t.set(400);
        tc.pause_billing_timer();
        t.set(1400);
        // paused past what would have been the deadline
        assert!(tc.checktime().is_ok());
        tc.resume_billing_timer();

        // the 1000us pause shifted both the billable window and the deadline
        assert_eq!(tc.pseudo_start, TimePoint::new(1000));
        assert_eq!(tc.deadline, TimePoint::new(2000));
        assert!(tc.checktime().is_ok());
    }

    #[test]
    fn resume_never_moves_past_the_block_deadline() {
        let t = Rc::new(Cell::new(0i64));
        let t2 = Rc::clone(&t);
        let clock: Clock = Rc::new(move || TimePoint::new(t2.get()));

        let mut tc = TransactionContext::new(simple_trx(), TrxType::Input, clock);
        tc.deadline = TimePoint::new(1000);
        tc.block_deadline = TimePoint::new(1200);

        tc.pause_billing_timer();
        t.set(500);
        tc.resume_billing_timer();
        assert_eq!(tc.deadline, TimePoint::new(1200));
        assert!(matches!(tc.deadline_kind, DeadlineKind::Node));
    }

    #[test]
    fn cpu_residual_distribution_is_biased_upward() {
        let mut tc = TransactionContext::new(simple_trx(), TrxType::Input, fixed_clock(0));
        for _ in 0..3 {
            let act = tc.trx.actions[0].clone();
            tc.schedule_action(act, Name::constant("hodl"), false, 0, 0);
        }
        tc.trace.action_traces[0].elapsed = Microseconds::new(10);

        // 10 accounted, 100 billed: residual 90 splits 30/30/30
        tc.distribute_cpu_residual(100);
        let elapsed: Vec<i64> = tc.trace.action_traces.iter()
            .map(|at| at.elapsed.count()).collect();
        assert_eq!(elapsed, vec![40, 30, 30]);

        // residual 2 over 3 actions: the first two get the extra us
        let mut tc2 = TransactionContext::new(simple_trx(), TrxType::Input, fixed_clock(0));
        for _ in 0..3 {
            let act = tc2.trx.actions[0].clone();
            tc2.schedule_action(act, Name::constant("hodl"), false, 0, 0);
        }
        tc2.distribute_cpu_residual(2);
        let elapsed: Vec<i64> = tc2.trace.action_traces.iter()
            .map(|at| at.elapsed.count()).collect();
        assert_eq!(elapsed, vec![1, 1, 0]);
    }

    #[test]
    fn reset_for_retry_returns_to_pristine_state() {
        let mut tc = TransactionContext::new(simple_trx(), TrxType::Input, fixed_clock(0));
        tc.net_usage = 500;
        tc.state = State::Executing;
        tc.interrupt_handle().set(true);
        let act = tc.trx.actions[0].clone();
        tc.schedule_action(act, Name::constant("hodl"), false, 0, 0);

        tc.reset_for_retry();
        assert_eq!(tc.state, State::Created);
        assert_eq!(tc.net_usage, 0);
        assert!(tc.trace.action_traces.is_empty());
        assert!(tc.checktime().is_ok());
    }
}
