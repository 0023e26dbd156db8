//! Orchestration of transaction execution against the chain state.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::{
    AccountName, Authority, Microseconds, PublicKey, TimePoint, Transaction, TransactionStatus,
    TransactionTrace,
    authorization::AuthorizationManager,
    config::{self, ChainConfig, NodeConfig},
    db::Database,
    error::{ChainError, Result},
    runtime::RuntimeHandle,
    subjective_billing::SubjectiveBilling,
    transaction_context::{TransactionContext, TrxType},
};

pub type Clock = Rc<dyn Fn() -> TimePoint>;

pub struct Controller {
    pub db: Database,
    pub config: ChainConfig,
    pub node_config: NodeConfig,
    pub subjective_billing: SubjectiveBilling,
    runtimes: HashMap<AccountName, RuntimeHandle>,
    greylist: HashSet<AccountName>,
    pending_block_time: TimePoint,
    block_deadline: TimePoint,
    clock: Clock,
}

impl Controller {
    /// A fresh chain with only the system account, whose owner and active
    /// permissions are both controlled by `genesis_key`.
    pub fn new(genesis_key: PublicKey) -> Self {
        let mut db = Database::new();
        let t0 = TimePoint::default();
        let auth = Authority::single_key(genesis_key);

        // genesis state cannot fail to build
        db.create_account(config::SYSTEM_ACCOUNT, t0)
            .and_then(|_| {
                let owner = db.create_permission(
                    config::SYSTEM_ACCOUNT, config::OWNER_PERMISSION, None, auth.clone(), t0)?;
                db.create_permission(
                    config::SYSTEM_ACCOUNT, config::ACTIVE_PERMISSION, Some(owner), auth, t0)?;
                db.set_privileged(config::SYSTEM_ACCOUNT, true)
            })
            .unwrap_or_else(|e| panic!("genesis state construction failed: {e}"));
        db.initialize_account_usage(config::SYSTEM_ACCOUNT);

        Self {
            db,
            config: ChainConfig::default(),
            node_config: NodeConfig::default(),
            subjective_billing: SubjectiveBilling::new(),
            runtimes: HashMap::new(),
            greylist: HashSet::new(),
            pending_block_time: t0,
            block_deadline: TimePoint::maximum(),
            clock: Rc::new(TimePoint::now),
        }
    }

    /// Replace the wall clock, for deterministic tests.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    pub fn clock(&self) -> Clock {
        Rc::clone(&self.clock)
    }

    pub fn now(&self) -> TimePoint {
        (self.clock)()
    }

    // --- block plumbing ------------------------------------------------------

    pub fn start_block(&mut self, time: TimePoint, deadline: TimePoint) {
        info!(%time, "starting block");
        self.pending_block_time = time;
        self.block_deadline = deadline;
        let global = &mut self.db.state_mut().global;
        global.pending_block_net_usage = 0;
        global.pending_block_cpu_usage = 0;
        self.db.expire_transactions(time);
    }

    pub fn pending_block_time(&self) -> TimePoint {
        self.pending_block_time
    }

    pub fn block_deadline(&self) -> TimePoint {
        self.block_deadline
    }

    // --- contracts and greylist ----------------------------------------------

    pub fn set_contract(&mut self, account: AccountName,
                        runtime: RuntimeHandle) -> Result<()> {
        self.db.set_contract(account, true)?;
        self.runtimes.insert(account, runtime);
        Ok(())
    }

    pub fn set_contract_fn<F>(&mut self, account: AccountName, f: F) -> Result<()>
    where
        F: for<'a, 'b> Fn(&mut crate::apply_context::ApplyContext<'a, 'b>) -> Result<()> + 'static,
    {
        self.set_contract(account, Rc::new(f) as RuntimeHandle)
    }

    pub fn runtime_for(&self, account: AccountName) -> Option<RuntimeHandle> {
        self.runtimes.get(&account).map(Rc::clone)
    }

    pub fn add_to_greylist(&mut self, account: AccountName) {
        self.greylist.insert(account);
    }

    pub fn is_greylisted(&self, account: AccountName) -> bool {
        self.greylist.contains(&account)
    }

    // --- transaction entry points --------------------------------------------

    /// Execute a signed transaction against the pending block. Failures are
    /// reported through the returned trace, never as an `Err`.
    pub fn push_transaction(&mut self, trx: Transaction,
                            provided_keys: BTreeSet<PublicKey>) -> TransactionTrace {
        self.push_transaction_with_billed(trx, provided_keys, None)
    }

    /// Like [`push_transaction`](Self::push_transaction) but with an
    /// externally supplied CPU bill (validating replay): the deadline
    /// machinery is bypassed and the number is validated post hoc.
    pub fn push_transaction_with_billed(&mut self, trx: Transaction,
                                        provided_keys: BTreeSet<PublicKey>,
                                        explicit_billed_cpu_us: Option<u32>) -> TransactionTrace {
        let first_auth = trx.first_authorizer();
        let mut tc = TransactionContext::new(trx, TrxType::Input, self.clock());
        if let Some(billed) = explicit_billed_cpu_us {
            tc.set_explicit_billed_cpu_time(billed);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            self.db.start_undo_session();

            match self.execute_input_trx(&mut tc, &provided_keys) {
                Ok(status) => {
                    // the session stays open if a block-level one wraps it
                    let _ = self.db.squash();
                    tc.trace_mut().status = status;
                    if let Some(account) = first_auth {
                        self.subjective_billing.clear(account);
                    }
                    return tc.into_trace();
                }
                Err(e @ ChainError::TransactionInterrupted { .. }) if attempts == 1 => {
                    warn!(error = %e, "transaction interrupted, retrying once");
                    let _ = self.db.undo();
                    tc.reset_for_retry();
                }
                Err(e) => {
                    let _ = self.db.undo();
                    debug!(error = %e, "transaction failed");
                    let elapsed = tc.elapsed();
                    let trace = tc.trace_mut();
                    trace.status = TransactionStatus::HardFail;
                    trace.error_code = Some(e.error_code());
                    trace.except = Some(e.to_string());
                    trace.elapsed = elapsed;

                    let duplicate = matches!(e, ChainError::DuplicateTransaction { .. });
                    if !e.is_exhaustion() && !duplicate {
                        if let Some(account) = first_auth {
                            self.subjective_billing.bill_failure(account, elapsed, self.now());
                        }
                    }
                    return tc.into_trace();
                }
            }
        }
    }

    fn execute_input_trx(&mut self, tc: &mut TransactionContext,
                         provided_keys: &BTreeSet<PublicKey>) -> Result<TransactionStatus> {
        tc.init_for_input_trx(self)?;
        tc.validate_referenced_accounts(self)?;

        {
            let actions = tc.transaction().actions.clone();
            let manager = AuthorizationManager::new(&self.db, &self.config);
            manager.check_authorization(
                &actions,
                provided_keys,
                &BTreeSet::new(),
                tc.delay(),
                || tc.checktime(),
                false,
                false,
            )?;
        }

        if tc.delay().count() > 0 {
            tc.schedule_as_delayed(self)?;
            tc.finalize(self)?;
            return Ok(TransactionStatus::Delayed);
        }

        tc.exec(self)?;
        tc.finalize(self)?;
        Ok(TransactionStatus::Executed)
    }

    /// Execute a previously delayed transaction whose wait has elapsed.
    /// Returns `None` when no such transaction is stored.
    pub fn push_scheduled_transaction(&mut self, sender: AccountName,
                                      sender_id: u128) -> Option<TransactionTrace> {
        let gt = self.db.remove_generated_transaction(sender, sender_id)?;
        // retire the stored record and refund its footprint
        let _ = self.db.add_ram_usage(gt.payer, -(gt.billable_size() as i64));

        let mut tc = TransactionContext::new(gt.trx, TrxType::Scheduled, self.clock());
        self.db.start_undo_session();

        let result = tc.init_for_deferred_trx(self, gt.published)
            .and_then(|_| tc.exec(self))
            .and_then(|_| tc.finalize(self));

        match result {
            Ok(()) => {
                let _ = self.db.squash();
                tc.trace_mut().status = TransactionStatus::Executed;
            }
            Err(e) => {
                let _ = self.db.undo();
                let trace = tc.trace_mut();
                trace.status = TransactionStatus::HardFail;
                trace.error_code = Some(e.error_code());
                trace.except = Some(e.to_string());
            }
        }
        Some(tc.into_trace())
    }

    /// Speculative execution that never commits: state changes are made,
    /// observed through the trace, then rolled back.
    pub fn push_readonly_transaction(&mut self, trx: Transaction) -> TransactionTrace {
        self.push_transient_transaction(trx, TrxType::ReadOnly)
    }

    /// Like [`push_readonly_transaction`](Self::push_readonly_transaction),
    /// but executed as a dry run: authorization structure is still
    /// validated, only the signatures backing it may be missing.
    pub fn push_dry_run_transaction(&mut self, trx: Transaction) -> TransactionTrace {
        self.push_transient_transaction(trx, TrxType::DryRun)
    }

    fn push_transient_transaction(&mut self, trx: Transaction,
                                  trx_type: TrxType) -> TransactionTrace {
        let mut tc = TransactionContext::new(trx, trx_type, self.clock());
        self.db.start_undo_session();

        let result = tc.init_for_readonly_trx(self)
            .and_then(|_| tc.exec(self))
            .and_then(|_| tc.finalize(self));

        let _ = self.db.undo();
        match result {
            Ok(()) => tc.trace_mut().status = TransactionStatus::Executed,
            Err(e) => {
                let trace = tc.trace_mut();
                trace.status = TransactionStatus::HardFail;
                trace.error_code = Some(e.error_code());
                trace.except = Some(e.to_string());
            }
        }
        tc.into_trace()
    }

    /// The keys among `candidate_keys` a signer actually needs for `trx`.
    pub fn get_required_keys(&self, trx: &Transaction,
                             candidate_keys: &BTreeSet<PublicKey>)
                             -> Result<BTreeSet<PublicKey>> {
        let manager = AuthorizationManager::new(&self.db, &self.config);
        manager.get_required_keys(&trx.actions, candidate_keys, trx.delay())
    }

    /// The subjective CPU still available to `account` in this block, after
    /// deducting what recently failed transactions already cost us.
    pub(crate) fn subjective_cpu_left(&mut self, account: AccountName) -> Option<Microseconds> {
        let objective = self.db.account_cpu_limit(account)?;
        let now = self.now();
        let pending = self.subjective_billing.get_bill(account, now);
        Some(Microseconds::new((objective as i64).saturating_sub(pending.count())))
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("pending_block_time", &self.pending_block_time)
            .field("contracts", &self.runtimes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
