//! Weighted-threshold authority evaluation.
//!
//! The checker answers one question: given a set of provided public keys,
//! pre-satisfied permission levels and an accumulated delay, is a given
//! authority satisfied? Evaluation is deterministic: key factors first,
//! then waits, then delegated accounts, each list in its stored
//! (ascending) order.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    Authority, Microseconds, PermissionLevel, PublicKey,
    db::Database,
    error::{AuthorityDepthExceededSnafu, Result},
};
use snafu::ensure;

#[derive(Eq, PartialEq, Debug, Copy, Clone)]
enum CacheStatus {
    BeingEvaluated,
    Satisfied,
    Unsatisfied,
}

pub struct AuthorityChecker<'a, F>
where
    F: FnMut() -> Result<()>,
{
    db: &'a Database,
    provided_keys: Vec<PublicKey>,
    used_keys: Vec<bool>,
    provided_delay: Microseconds,
    recursion_depth_limit: u16,
    checktime: F,
    /// evaluation results, seeded with the externally satisfied levels;
    /// the `BeingEvaluated` marker breaks delegation cycles
    cache: BTreeMap<PermissionLevel, CacheStatus>,
}

impl<'a, F> AuthorityChecker<'a, F>
where
    F: FnMut() -> Result<()>,
{
    pub fn new(db: &'a Database,
               provided_keys: Vec<PublicKey>,
               provided_permissions: &BTreeSet<PermissionLevel>,
               provided_delay: Microseconds,
               recursion_depth_limit: u16,
               checktime: F) -> Self {
        let mut provided_keys = provided_keys;
        provided_keys.sort();
        provided_keys.dedup();
        let used_keys = vec![false; provided_keys.len()];
        let cache = provided_permissions.iter()
            .map(|level| (*level, CacheStatus::Satisfied))
            .collect();
        Self { db, provided_keys, used_keys, provided_delay, recursion_depth_limit, checktime, cache }
    }

    /// Whether the named permission is satisfied by what was provided.
    /// A missing permission is simply unsatisfied; only exceeding the
    /// recursion depth limit is a hard error.
    pub fn satisfied(&mut self, level: &PermissionLevel) -> Result<bool> {
        self.satisfied_at_depth(level, 0)
    }

    /// Evaluate under a caller-chosen delay budget instead of the one the
    /// checker was built with; used when an action lowered the effective
    /// delay for a specific declared authority.
    pub fn satisfied_with_delay(&mut self, level: &PermissionLevel,
                                delay: Microseconds) -> Result<bool> {
        let saved = self.provided_delay;
        self.provided_delay = delay;
        let result = self.satisfied(level);
        self.provided_delay = saved;
        result
    }

    fn satisfied_at_depth(&mut self, level: &PermissionLevel, depth: u16) -> Result<bool> {
        match self.cache.get(level) {
            Some(CacheStatus::Satisfied) => return Ok(true),
            Some(CacheStatus::Unsatisfied) => return Ok(false),
            Some(CacheStatus::BeingEvaluated) => return Ok(false),
            None => {}
        }

        let Some(permission) = self.db.find_permission(level) else {
            return Ok(false);
        };
        let authority = permission.auth.clone();

        self.cache.insert(*level, CacheStatus::BeingEvaluated);
        let satisfied = self.satisfies_authority(&authority, depth)?;
        self.cache.insert(*level, if satisfied { CacheStatus::Satisfied }
                                  else { CacheStatus::Unsatisfied });
        Ok(satisfied)
    }

    /// Evaluate a bare authority (as opposed to a named permission).
    pub fn satisfies_authority(&mut self, authority: &Authority, depth: u16) -> Result<bool> {
        ensure!(depth <= self.recursion_depth_limit,
                AuthorityDepthExceededSnafu { max: self.recursion_depth_limit });
        (self.checktime)()?;

        // keys marked used while evaluating a branch that ends up failing
        // were not actually used
        let used_keys_snapshot = self.used_keys.clone();

        let threshold = authority.threshold as u64;
        let mut total: u64 = 0;

        for kw in &authority.keys {
            if let Ok(index) = self.provided_keys.binary_search(&kw.key) {
                self.used_keys[index] = true;
                total += kw.weight as u64;
                if total >= threshold {
                    return Ok(true);
                }
            }
        }

        for ww in &authority.waits {
            if self.provided_delay >= Microseconds::seconds(ww.wait_sec as i64) {
                total += ww.weight as u64;
                if total >= threshold {
                    return Ok(true);
                }
            }
        }

        for aw in &authority.accounts {
            if self.satisfied_at_depth(&aw.permission, depth + 1)? {
                total += aw.weight as u64;
                if total >= threshold {
                    return Ok(true);
                }
            }
        }

        self.used_keys = used_keys_snapshot;
        Ok(false)
    }

    pub fn all_keys_used(&self) -> bool {
        self.used_keys.iter().all(|u| *u)
    }

    pub fn used_keys(&self) -> BTreeSet<PublicKey> {
        self.keys_matching(true)
    }

    pub fn unused_keys(&self) -> BTreeSet<PublicKey> {
        self.keys_matching(false)
    }

    fn keys_matching(&self, used: bool) -> BTreeSet<PublicKey> {
        self.provided_keys.iter()
            .zip(self.used_keys.iter())
            .filter(|(_, u)| **u == used)
            .map(|(k, _)| k.clone())
            .collect()
    }
}


// =============================================================================
//
//     Unittests
//
// =============================================================================

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result as EyreResult;
    use crate::{
        Authority, KeyType, KeyWeight, Name, PermissionLevelWeight, TimePoint, WaitWeight,
        error::{ChainError, Result},
    };
    use super::*;

    fn n(s: &str) -> Name { Name::new(s).unwrap() }
    fn key(tag: u8) -> PublicKey { PublicKey::new(KeyType::K1, [tag; 33]) }
    fn level(actor: &str, permission: &str) -> PermissionLevel {
        PermissionLevel::new(n(actor), n(permission))
    }
    fn key_auth(threshold: u32, keys: &[(u8, u16)]) -> Authority {
        Authority {
            threshold,
            keys: keys.iter().map(|(tag, w)| KeyWeight { key: key(*tag), weight: *w }).collect(),
            accounts: vec![],
            waits: vec![],
        }
    }
    fn no_checktime() -> impl FnMut() -> Result<()> {
        || Ok(())
    }

    fn db_with(perms: &[(&str, &str, Option<(&str, &str)>, Authority)]) -> Database {
        let mut db = Database::new();
        let now = TimePoint::default();
        for (owner, name, parent, auth) in perms {
            if db.find_account(n(owner)).is_none() {
                db.create_account(n(owner), now).unwrap();
            }
            let parent_id = parent.map(|(o, p)| {
                db.get_permission(&level(o, p)).unwrap().id
            });
            db.create_permission(n(owner), n(name), parent_id, auth.clone(), now).unwrap();
        }
        db
    }

    #[test]
    fn single_key_threshold() -> EyreResult<()> {
        let db = db_with(&[("alice", "active", None, key_auth(1, &[(1, 1)]))]);

        let mut checker = AuthorityChecker::new(
            &db, vec![key(1)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(checker.satisfied(&level("alice", "active"))?);
        assert!(checker.all_keys_used());

        let mut checker = AuthorityChecker::new(
            &db, vec![key(2)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(!checker.satisfied(&level("alice", "active"))?);
        assert_eq!(checker.unused_keys().len(), 1);
        Ok(())
    }

    #[test]
    fn multisig_threshold() -> EyreResult<()> {
        let db = db_with(&[("alice", "active", None, key_auth(2, &[(1, 1), (2, 1), (3, 1)]))]);

        let mut checker = AuthorityChecker::new(
            &db, vec![key(1), key(3)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(checker.satisfied(&level("alice", "active"))?);
        assert!(checker.all_keys_used());

        let mut checker = AuthorityChecker::new(
            &db, vec![key(3)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(!checker.satisfied(&level("alice", "active"))?);
        Ok(())
    }

    #[test]
    fn delegated_account_recursion() -> EyreResult<()> {
        let db = db_with(&[
            ("bob", "active", None, key_auth(1, &[(9, 1)])),
            ("alice", "active", None, Authority {
                threshold: 1,
                keys: vec![],
                accounts: vec![PermissionLevelWeight { permission: level("bob", "active"), weight: 1 }],
                waits: vec![],
            }),
        ]);

        let mut checker = AuthorityChecker::new(
            &db, vec![key(9)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(checker.satisfied(&level("alice", "active"))?);
        Ok(())
    }

    #[test]
    fn delegation_cycles_do_not_loop() -> EyreResult<()> {
        let db = db_with(&[
            ("alice", "active", None, Authority {
                threshold: 1,
                keys: vec![],
                accounts: vec![PermissionLevelWeight { permission: level("bob", "active"), weight: 1 }],
                waits: vec![],
            }),
        ]);
        let mut db = db;
        db.create_account(n("bob"), TimePoint::default())?;
        db.create_permission(n("bob"), n("active"), None, Authority {
            threshold: 1,
            keys: vec![],
            accounts: vec![PermissionLevelWeight { permission: level("alice", "active"), weight: 1 }],
            waits: vec![],
        }, TimePoint::default())?;

        let mut checker = AuthorityChecker::new(
            &db, vec![], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(!checker.satisfied(&level("alice", "active"))?);
        Ok(())
    }

    #[test]
    fn depth_limit_is_a_hard_error() -> EyreResult<()> {
        // a chain of delegations longer than the limit
        let mut db = Database::new();
        let now = TimePoint::default();
        db.create_account(n("acct"), now)?;
        // permission names pa..pi (digits 6-9 are not valid name characters)
        let pname = |i: u8| format!("p{}", (b'a' + i - 1) as char);
        db.create_permission(n("acct"), n(&pname(1)), None, key_auth(1, &[(1, 1)]), now)?;
        for i in 2..=9u8 {
            let this = pname(i);
            let prev = pname(i - 1);
            db.create_permission(n("acct"), Name::new(&this)?, None, Authority {
                threshold: 1,
                keys: vec![],
                accounts: vec![PermissionLevelWeight {
                    permission: level("acct", &prev), weight: 1,
                }],
                waits: vec![],
            }, now)?;
        }

        let mut checker = AuthorityChecker::new(
            &db, vec![key(1)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        let err = checker.satisfied(&level("acct", &pname(9))).unwrap_err();
        assert!(matches!(err, ChainError::AuthorityDepthExceeded { max: 6 }));
        Ok(())
    }

    #[test]
    fn waits_grant_weight_once_delay_is_provided() -> EyreResult<()> {
        let auth = Authority {
            threshold: 2,
            keys: vec![KeyWeight { key: key(1), weight: 1 }],
            accounts: vec![],
            waits: vec![WaitWeight { wait_sec: 60, weight: 1 }],
        };
        let db = db_with(&[("alice", "active", None, auth)]);

        let mut checker = AuthorityChecker::new(
            &db, vec![key(1)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(!checker.satisfied(&level("alice", "active"))?);

        let mut checker = AuthorityChecker::new(
            &db, vec![key(1)], &BTreeSet::new(), Microseconds::seconds(60), 6, no_checktime());
        assert!(checker.satisfied(&level("alice", "active"))?);
        Ok(())
    }

    #[test]
    fn failed_branch_does_not_consume_keys() -> EyreResult<()> {
        // key 2 contributes to a branch that cannot reach its threshold;
        // it must come back as unused
        let db = db_with(&[
            ("bob", "active", None, key_auth(2, &[(2, 1)])),
            ("alice", "active", None, Authority {
                threshold: 1,
                keys: vec![KeyWeight { key: key(1), weight: 1 }],
                accounts: vec![PermissionLevelWeight { permission: level("bob", "active"), weight: 1 }],
                waits: vec![],
            }),
        ]);

        let mut checker = AuthorityChecker::new(
            &db, vec![key(1), key(2)], &BTreeSet::new(), Microseconds::new(0), 6, no_checktime());
        assert!(checker.satisfied(&level("alice", "active"))?);
        assert!(!checker.all_keys_used());
        assert_eq!(checker.used_keys(), BTreeSet::from([key(1)]));
        assert_eq!(checker.unused_keys(), BTreeSet::from([key(2)]));
        Ok(())
    }

    #[test]
    fn provided_permissions_short_circuit() -> EyreResult<()> {
        // no db entry needed when the level itself was provided
        let db = Database::new();
        let provided = BTreeSet::from([level("hodl", "sysio.code")]);

        let mut checker = AuthorityChecker::new(
            &db, vec![], &provided, Microseconds::new(0), 6, no_checktime());
        assert!(checker.satisfied(&level("hodl", "sysio.code"))?);
        assert!(!checker.satisfied(&level("hodl", "active"))?);
        Ok(())
    }

    #[test]
    fn checktime_propagates_failure() {
        let db = db_with(&[("alice", "active", None, key_auth(1, &[(1, 1)]))]);
        let mut calls = 0;
        let mut checker = AuthorityChecker::new(
            &db, vec![key(1)], &BTreeSet::new(), Microseconds::new(0), 6,
            || {
                calls += 1;
                crate::error::DeadlineExceededSnafu { elapsed: Microseconds::new(1) }.fail()
            });
        assert!(checker.satisfied(&level("alice", "active")).is_err());
        drop(checker);
        assert_eq!(calls, 1);
    }
}
