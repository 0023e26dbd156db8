//! Transaction-level authorization: linking declared authorities to the
//! minimum permissions actions require, and verifying they are satisfied
//! by the provided keys, permissions and delay.

use std::collections::{BTreeMap, BTreeSet};

use snafu::ensure;
use tracing::debug;

use crate::{
    AccountName, Action, ActionName, Microseconds, Name, PermissionLevel, PermissionName,
    PublicKey,
    chain::native::{CancelDelay, DeleteAuth, LinkAuth, UnlinkAuth, UpdateAuth},
    config::{self, ChainConfig},
    db::Database,
    error::{
        ActionValidateSnafu, AuthorizationSnafu, InvalidPermissionSnafu, IrrelevantAuthSnafu,
        IrrelevantSignatureSnafu, Result, TransactionSnafu, UnlinkableActionSnafu,
        UnsatisfiedAuthorizationSnafu,
    },
};

pub mod checker;

pub use checker::AuthorityChecker;

/// Actions on the system account that manage the permission graph itself;
/// they cannot be re-linked to weaker permissions.
const RESTRICTED_LINK_ACTIONS: [Name; 5] = [
    config::UPDATEAUTH_ACTION,
    config::DELETEAUTH_ACTION,
    config::LINKAUTH_ACTION,
    config::UNLINKAUTH_ACTION,
    config::CANCELDELAY_ACTION,
];

pub struct AuthorizationManager<'a> {
    db: &'a Database,
    config: &'a ChainConfig,
}

impl<'a> AuthorizationManager<'a> {
    pub fn new(db: &'a Database, config: &'a ChainConfig) -> Self {
        Self { db, config }
    }

    /// The permission an authorizer minimally needs for `scope::act_name`:
    /// the linked permission if one exists, `active` otherwise. `None`
    /// means the action was linked to `sysio.any` and anything goes.
    pub fn lookup_minimum_permission(&self, authorizer: AccountName, scope: AccountName,
                                     act_name: ActionName) -> Result<Option<PermissionName>> {
        if scope == config::SYSTEM_ACCOUNT {
            ensure!(!RESTRICTED_LINK_ACTIONS.contains(&act_name), UnlinkableActionSnafu {
                msg: format!("permission management action {act_name} has no minimum permission"),
            });
        }

        match self.db.lookup_linked_permission(authorizer, scope, act_name) {
            None => Ok(Some(config::ACTIVE_PERMISSION)),
            Some(linked) if linked == config::ANY_PERMISSION => Ok(None),
            Some(linked) => Ok(Some(linked)),
        }
    }

    fn ensure_declared_satisfies(&self, declared: &PermissionLevel,
                                 min: &PermissionLevel) -> Result<()> {
        let declared_obj = self.db.get_permission(declared)?;
        let min_obj = self.db.get_permission(min)?;
        ensure!(self.db.permission_satisfies(declared_obj, min_obj),
                IrrelevantAuthSnafu { level: *declared });
        Ok(())
    }

    // --- native action special cases -----------------------------------------

    fn check_updateauth_authorization(&self, update: &UpdateAuth,
                                      auths: &[PermissionLevel]) -> Result<()> {
        ensure!(auths.len() == 1, AuthorizationSnafu {
            msg: "updateauth action should only have one declared authorization",
        });
        let auth = &auths[0];

        // the '*.ext' namespace is reserved for system-managed permissions
        if update.permission.suffix() == Name::constant("ext") {
            ensure!(auth.actor == config::SYSTEM_ACCOUNT, InvalidPermissionSnafu {
                msg: "protected permission namespace, only 'sysio' can update or add '*.ext' permissions",
            });
            return Ok(());
        }

        ensure!(auth.actor == update.account, IrrelevantAuthSnafu { level: *auth });

        let target = PermissionLevel::new(update.account, update.permission);
        let min = if self.db.find_permission(&target).is_some() {
            target
        }
        else {
            // creating a new permission: its parent sets the bar
            PermissionLevel::new(update.account, update.parent)
        };
        self.ensure_declared_satisfies(auth, &min)
    }

    fn check_deleteauth_authorization(&self, del: &DeleteAuth,
                                      auths: &[PermissionLevel]) -> Result<()> {
        ensure!(auths.len() == 1, AuthorizationSnafu {
            msg: "deleteauth action should only have one declared authorization",
        });
        let auth = &auths[0];
        ensure!(auth.actor == del.account, IrrelevantAuthSnafu { level: *auth });
        self.ensure_declared_satisfies(auth, &PermissionLevel::new(del.account, del.permission))
    }

    fn check_linkauth_authorization(&self, link: &LinkAuth,
                                    auths: &[PermissionLevel]) -> Result<()> {
        ensure!(auths.len() == 1, AuthorizationSnafu {
            msg: "linkauth action should only have one declared authorization",
        });
        let auth = &auths[0];
        ensure!(auth.actor == link.account, IrrelevantAuthSnafu { level: *auth });

        if link.code == config::SYSTEM_ACCOUNT || !self.config.features.fix_linkauth_restriction {
            ensure!(!RESTRICTED_LINK_ACTIONS.contains(&link.action), ActionValidateSnafu {
                msg: format!("cannot link {} to a minimum permission", link.action),
            });
        }

        match self.lookup_minimum_permission(link.account, link.code, link.action)? {
            None => Ok(()),
            Some(min) => self.ensure_declared_satisfies(
                auth, &PermissionLevel::new(link.account, min)),
        }
    }

    fn check_unlinkauth_authorization(&self, unlink: &UnlinkAuth,
                                      auths: &[PermissionLevel]) -> Result<()> {
        ensure!(auths.len() == 1, AuthorizationSnafu {
            msg: "unlinkauth action should only have one declared authorization",
        });
        let auth = &auths[0];
        ensure!(auth.actor == unlink.account, IrrelevantAuthSnafu { level: *auth });

        let unlinked = self.db.lookup_linked_permission(unlink.account, unlink.code, unlink.action);
        let Some(unlinked) = unlinked else {
            return TransactionSnafu {
                msg: format!("cannot unlink non-existent permission link of account '{}' for actions matching '{}::{}'",
                             unlink.account, unlink.code, unlink.action),
            }.fail();
        };

        if unlinked == config::ANY_PERMISSION {
            return Ok(());
        }
        self.ensure_declared_satisfies(auth, &PermissionLevel::new(unlink.account, unlinked))
    }

    /// Validates the cancellation and returns the delay the canceled
    /// transaction was scheduled with, which the canceler inherits.
    fn check_canceldelay_authorization(&self, cancel: &CancelDelay,
                                       auths: &[PermissionLevel]) -> Result<Microseconds> {
        ensure!(auths.len() == 1, AuthorizationSnafu {
            msg: "canceldelay action should only have one declared authorization",
        });
        let auth = &auths[0];
        self.ensure_declared_satisfies(auth, &cancel.canceling_auth)?;

        // delayed input transactions are stored with an empty sender
        let Some(gt) = self.db.find_generated_by_trx_id(Name::default(), cancel.trx_id) else {
            return TransactionSnafu {
                msg: format!("cannot cancel {}, there is no deferred transaction with that id",
                             cancel.trx_id),
            }.fail();
        };

        let found = gt.trx.actions.iter()
            .flat_map(|a| a.authorization.iter())
            .any(|a| *a == cancel.canceling_auth);
        ensure!(found, ActionValidateSnafu {
            msg: "canceling_auth in canceldelay action was not found as authorization in the original delayed transaction",
        });

        Ok(gt.delay_until - gt.published)
    }

    // --- the main entry point ------------------------------------------------

    /// Check that every authority declared by `actions` is both relevant
    /// (at least the linked minimum permission) and satisfiable from the
    /// provided keys, permissions and delay.
    ///
    /// With `allow_unused_keys` unset, signatures that end up unused fail
    /// the check, so callers cannot pad transactions with stray keys.
    ///
    /// With `check_but_dont_fail` set, the structural validations still
    /// apply but an unsatisfiable authority does not fail the check;
    /// dry-run executions estimate costs without carrying signatures.
    pub fn check_authorization<F>(&self,
                                  actions: &[Action],
                                  provided_keys: &BTreeSet<PublicKey>,
                                  provided_permissions: &BTreeSet<PermissionLevel>,
                                  provided_delay: Microseconds,
                                  mut checktime: F,
                                  allow_unused_keys: bool,
                                  check_but_dont_fail: bool) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        // beyond the maximum configurable delay, treat the delay as
        // unbounded so waits of any length can be satisfied
        let delay_max_limit = self.config.max_transaction_delay_duration();
        let effective_delay = if provided_delay >= delay_max_limit {
            Microseconds::maximum()
        }
        else {
            provided_delay
        };

        // minimum required delay per declared authority
        let mut permissions_to_satisfy: BTreeMap<PermissionLevel, Microseconds> = BTreeMap::new();

        for act in actions {
            let mut special_case = false;
            let mut delay = effective_delay;

            if act.account == config::SYSTEM_ACCOUNT {
                special_case = true;
                match act.name {
                    n if n == config::UPDATEAUTH_ACTION =>
                        self.check_updateauth_authorization(&act.data_as()?, &act.authorization)?,
                    n if n == config::DELETEAUTH_ACTION =>
                        self.check_deleteauth_authorization(&act.data_as()?, &act.authorization)?,
                    n if n == config::LINKAUTH_ACTION =>
                        self.check_linkauth_authorization(&act.data_as()?, &act.authorization)?,
                    n if n == config::UNLINKAUTH_ACTION =>
                        self.check_unlinkauth_authorization(&act.data_as()?, &act.authorization)?,
                    n if n == config::CANCELDELAY_ACTION => {
                        let canceled_delay =
                            self.check_canceldelay_authorization(&act.data_as()?, &act.authorization)?;
                        delay = delay.max(canceled_delay);
                    }
                    _ => special_case = false,
                }
            }

            let mut payer = None;
            for declared_auth in &act.authorization {
                checktime()?;

                if declared_auth.permission == config::PAYER_PERMISSION {
                    // pseudo-permission marking who pays for the action's RAM
                    ensure!(payer.is_none(), AuthorizationSnafu {
                        msg: "multiple payers specified for action",
                    });
                    payer = Some(declared_auth.actor);
                }
                else if !special_case {
                    if let Some(min) = self.lookup_minimum_permission(
                        declared_auth.actor, act.account, act.name)? {
                        self.ensure_declared_satisfies(
                            declared_auth, &PermissionLevel::new(declared_auth.actor, min))?;
                    }
                }

                if declared_auth.permission != config::PAYER_PERMISSION {
                    permissions_to_satisfy.entry(*declared_auth)
                        .and_modify(|d| *d = (*d).min(delay))
                        .or_insert(delay);
                }
            }

            // the payer pseudo-permission rides on a real authorization of
            // the same actor, it cannot stand alone
            if let Some(payer) = payer {
                let paired = act.authorization.iter().any(|a| {
                    a.actor == payer && a.permission != config::PAYER_PERMISSION
                });
                ensure!(paired, UnsatisfiedAuthorizationSnafu {
                    level: PermissionLevel::new(payer, config::PAYER_PERMISSION),
                });
            }
        }

        let mut checker = AuthorityChecker::new(
            self.db,
            provided_keys.iter().cloned().collect(),
            provided_permissions,
            effective_delay,
            self.config.max_authority_depth,
            &mut checktime,
        );

        // ascending (actor, permission) order keeps evaluation and its
        // side effects on the key usage bitmap deterministic
        for (level, delay) in &permissions_to_satisfy {
            debug!(%level, "checking declared authority");
            ensure!(checker.satisfied_with_delay(level, *delay)? || check_but_dont_fail,
                    UnsatisfiedAuthorizationSnafu { level: *level });
        }

        if !allow_unused_keys {
            ensure!(checker.all_keys_used() || check_but_dont_fail, IrrelevantSignatureSnafu {
                keys: checker.unused_keys().iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        Ok(())
    }

    /// The subset of `candidate_keys` actually needed to satisfy every
    /// authority declared by `actions`; the caller only signs with these.
    /// Fails if some declared authority cannot be satisfied from the
    /// candidates alone.
    pub fn get_required_keys(&self, actions: &[Action],
                             candidate_keys: &BTreeSet<PublicKey>,
                             provided_delay: Microseconds) -> Result<BTreeSet<PublicKey>> {
        let provided_permissions = BTreeSet::new();
        let mut checker = AuthorityChecker::new(
            self.db,
            candidate_keys.iter().cloned().collect(),
            &provided_permissions,
            provided_delay,
            self.config.max_authority_depth,
            || Ok(()),
        );

        let declared: BTreeSet<PermissionLevel> = actions.iter()
            .flat_map(|act| act.authorization.iter())
            .filter(|auth| auth.permission != config::PAYER_PERMISSION)
            .copied()
            .collect();

        for level in &declared {
            ensure!(checker.satisfied(level)?, UnsatisfiedAuthorizationSnafu { level: *level });
        }
        Ok(checker.used_keys())
    }
}
