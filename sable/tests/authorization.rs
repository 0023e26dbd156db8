//! End-to-end authorization behavior, driven through the controller the
//! way a producing node would drive it.

use std::collections::BTreeSet;

use color_eyre::eyre::Result;

use sable::{
    Action, Authority, Bytes, CancelDelay, Controller, KeyType, KeyWeight, LinkAuth, Name,
    NewAccount, PermissionLevel, PermissionLevelWeight, PublicKey, TimePoint, TimePointSec,
    Transaction, TransactionStatus, UpdateAuth, WaitWeight,
    config,
};

// -----------------------------------------------------------------------------
//     Utility test functions
// -----------------------------------------------------------------------------

fn n(s: &str) -> Name { Name::new(s).unwrap() }
fn key(tag: u8) -> PublicKey { PublicKey::new(KeyType::K1, [tag; 33]) }
fn keys(tags: &[u8]) -> BTreeSet<PublicKey> { tags.iter().map(|t| key(*t)).collect() }
fn level(actor: &str, permission: &str) -> PermissionLevel {
    PermissionLevel::new(n(actor), n(permission))
}

fn setup() -> Controller {
    let mut control = Controller::new(key(0));
    control.start_block(TimePoint::new(1_000_000), TimePoint::maximum());
    control
}

fn create_account_with(control: &mut Controller, name: &str,
                       owner: Authority, active: Authority) {
    let account = n(name);
    let now = control.pending_block_time();
    control.db.create_account(account, now).unwrap();
    let owner_id = control.db
        .create_permission(account, config::OWNER_PERMISSION, None, owner, now).unwrap();
    control.db
        .create_permission(account, config::ACTIVE_PERMISSION, Some(owner_id), active, now)
        .unwrap();
    control.db.initialize_account_usage(account);
}

fn create_account(control: &mut Controller, name: &str, tag: u8) {
    create_account_with(control, name,
                        Authority::single_key(key(tag)), Authority::single_key(key(tag)));
}

/// An account carrying a no-op contract, with the usual `account@sysio.code`
/// delegation in its active authority so it can authorize its own inlines.
fn create_contract_account(control: &mut Controller, name: &str, tag: u8) {
    let active = Authority {
        threshold: 1,
        keys: vec![KeyWeight { key: key(tag), weight: 1 }],
        accounts: vec![PermissionLevelWeight {
            permission: PermissionLevel::new(n(name), config::CODE_PERMISSION),
            weight: 1,
        }],
        waits: vec![],
    };
    create_account_with(control, name, Authority::single_key(key(tag)), active);
    control.set_contract_fn(n(name), |_ctx| Ok(())).unwrap();
}

fn act(account: &str, name: &str, auths: &[(&str, &str)]) -> Action {
    Action::new(
        n(account), n(name),
        auths.iter().map(|(a, p)| level(a, p)).collect(),
        Bytes::from(&b"{}"[..]),
    )
}

fn trx(actions: Vec<Action>) -> Transaction {
    Transaction {
        expiration: TimePointSec::new(3600),
        max_net_usage_words: 0,
        max_cpu_usage_ms: 0,
        delay_sec: 0,
        actions,
    }
}


// -----------------------------------------------------------------------------
//     Basic satisfaction
// -----------------------------------------------------------------------------

#[test]
fn single_key_authorization() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_contract_account(&mut control, "hodl", 10);

    let t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    let trace = control.push_transaction(t.clone(), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);

    // the wrong key satisfies nothing
    let mut t2 = t;
    t2.actions[0].data = Bytes::from(&b"[]"[..]);
    let trace = control.push_transaction(t2, keys(&[2]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3090003));
    Ok(())
}

#[test]
fn multisig_threshold() -> Result<()> {
    let mut control = setup();
    create_contract_account(&mut control, "hodl", 10);
    create_account_with(&mut control, "alice",
        Authority::single_key(key(1)),
        Authority {
            threshold: 2,
            keys: vec![
                KeyWeight { key: key(2), weight: 1 },
                KeyWeight { key: key(3), weight: 1 },
                KeyWeight { key: key(4), weight: 1 },
            ],
            accounts: vec![],
            waits: vec![],
        });

    let t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    let trace = control.push_transaction(t.clone(), keys(&[2, 4]));
    assert_eq!(trace.status, TransactionStatus::Executed);

    let mut t2 = t;
    t2.actions[0].data = Bytes::from(&b"[]"[..]);
    let trace = control.push_transaction(t2, keys(&[3]));
    assert_eq!(trace.error_code, Some(3090003));
    Ok(())
}

#[test]
fn unused_signatures_are_rejected() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_contract_account(&mut control, "hodl", 10);

    let t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    let trace = control.push_transaction(t, keys(&[1, 9]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3090002));
    Ok(())
}

#[test]
fn required_keys_are_the_minimal_signing_set() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_account(&mut control, "bob", 2);
    create_contract_account(&mut control, "hodl", 10);

    let t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    let required = control.get_required_keys(&t, &keys(&[1, 2, 9]))?;
    assert_eq!(required, keys(&[1]));

    // an authority no candidate key can satisfy is an error
    let t = trx(vec![act("hodl", "transfer", &[("bob", "active")])]);
    let err = control.get_required_keys(&t, &keys(&[1, 9])).unwrap_err();
    assert_eq!(err.error_code(), 3090003);
    Ok(())
}


// -----------------------------------------------------------------------------
//     Linked minimum permissions
// -----------------------------------------------------------------------------

/// Builds alice with a custom `spending` permission under `active` (key 5)
/// and links `hodl::transfer` to it.
fn setup_spending_link(control: &mut Controller) {
    create_account(control, "alice", 1);
    create_contract_account(control, "hodl", 10);

    let active_id = control.db.get_permission(&level("alice", "active")).unwrap().id;
    control.db.create_permission(
        n("alice"), n("spending"), Some(active_id),
        Authority::single_key(key(5)), control.pending_block_time()).unwrap();
    control.db.set_link(n("alice"), n("hodl"), n("transfer"), n("spending"));
}

#[test]
fn linked_permission_lowers_the_bar() -> Result<()> {
    let mut control = setup();
    setup_spending_link(&mut control);

    let t = trx(vec![act("hodl", "transfer", &[("alice", "spending")])]);
    let trace = control.push_transaction(t, keys(&[5]));
    assert_eq!(trace.status, TransactionStatus::Executed);
    Ok(())
}

#[test]
fn ancestor_permission_satisfies_the_link() -> Result<()> {
    let mut control = setup();
    setup_spending_link(&mut control);

    // owner sits above spending in the hierarchy
    let t = trx(vec![act("hodl", "transfer", &[("alice", "owner")])]);
    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);
    Ok(())
}

#[test]
fn link_does_not_extend_to_other_actions() -> Result<()> {
    let mut control = setup();
    setup_spending_link(&mut control);

    // burn is not linked, so active is the minimum; spending sits below it
    let t = trx(vec![act("hodl", "burn", &[("alice", "spending")])]);
    let trace = control.push_transaction(t, keys(&[5]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3090005));
    Ok(())
}

#[test]
fn linkauth_restriction_narrows_with_the_protocol_feature() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_contract_account(&mut control, "hodl", 10);

    // the contract happens to name an action after the system's updateauth
    let payload = LinkAuth {
        account: n("alice"),
        code: n("hodl"),
        action: n("updateauth"),
        requirement: n("active"),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::LINKAUTH_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action.clone()]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);

    // before the fix the action name alone was enough to forbid the link,
    // whatever the contract
    control.config.features.fix_linkauth_restriction = false;
    let mut action = action;
    action.data = Action::encode_data(&LinkAuth { requirement: n("owner"), ..payload });
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3050000));
    Ok(())
}


// -----------------------------------------------------------------------------
//     Native action special cases
// -----------------------------------------------------------------------------

#[test]
fn newaccount_through_the_system_account() -> Result<()> {
    let mut control = setup();

    let payload = NewAccount {
        creator: config::SYSTEM_ACCOUNT,
        name: n("frank"),
        owner: Authority::single_key(key(7)),
        active: Authority::single_key(key(7)),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::NEWACCOUNT_ACTION,
        vec![level("sysio", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action]), keys(&[0]));
    assert_eq!(trace.status, TransactionStatus::Executed);

    assert!(control.db.find_account(n("frank")).is_some());
    assert!(control.db.find_permission(&level("frank", "owner")).is_some());

    // overhead + two permission rows, each with one key factor, billed to
    // the system account rather than to the newborn
    let expected = (config::OVERHEAD_PER_ACCOUNT_RAM_BYTES
        + 2 * config::BILLABLE_SIZE_PERMISSION_BASE + 2 * 40) as i64;
    assert_eq!(trace.ram_delta_for(config::SYSTEM_ACCOUNT), expected);
    assert_eq!(control.db.usage(config::SYSTEM_ACCOUNT).ram_usage, expected);

    // outside the system namespace accounts start with no resources
    let usage = control.db.usage(n("frank"));
    assert_eq!(usage.ram_usage, 0);
    assert_eq!(usage.ram_limit, 0);
    assert_eq!(usage.net_limit, 0);
    assert_eq!(usage.cpu_limit, 0);
    Ok(())
}

#[test]
fn newaccount_requires_a_privileged_creator() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);

    let payload = NewAccount {
        creator: n("alice"),
        name: n("frank"),
        owner: Authority::single_key(key(7)),
        active: Authority::single_key(key(7)),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::NEWACCOUNT_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3050000));
    assert!(control.db.find_account(n("frank")).is_none());
    Ok(())
}

#[test]
fn updateauth_rejects_foreign_authorization() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_account(&mut control, "bob", 2);

    let payload = UpdateAuth {
        account: n("alice"),
        permission: n("trading"),
        parent: n("active"),
        auth: Authority::single_key(key(5)),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::UPDATEAUTH_ACTION,
        vec![level("bob", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action]), keys(&[2]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3090005));
    Ok(())
}

#[test]
fn updateauth_creates_and_bills_the_new_permission() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);

    let payload = UpdateAuth {
        account: n("alice"),
        permission: n("trading"),
        parent: n("active"),
        auth: Authority::single_key(key(5)),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::UPDATEAUTH_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);

    let perm = control.db.get_permission(&level("alice", "trading")).unwrap();
    assert_eq!(perm.auth.keys[0].key, key(5));
    assert_eq!(trace.ram_delta_for(n("alice")),
               (config::BILLABLE_SIZE_PERMISSION_BASE + 40) as i64);
    Ok(())
}

#[test]
fn system_manages_ext_permissions_of_other_accounts() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);

    // the '*.ext' namespace belongs to the system account: it creates the
    // permission on alice without alice authorizing the action
    let payload = UpdateAuth {
        account: n("alice"),
        permission: n("foo.ext"),
        parent: n("active"),
        auth: Authority::single_key(key(5)),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::UPDATEAUTH_ACTION,
        vec![level("sysio", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action.clone()]), keys(&[0]));
    assert_eq!(trace.status, TransactionStatus::Executed);
    assert!(control.db.find_permission(&level("alice", "foo.ext")).is_some());

    // alice herself is locked out of the namespace
    let mut action = action;
    action.authorization = vec![level("alice", "active")];
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3090007));
    Ok(())
}

#[test]
fn updateauth_rejects_waits_beyond_the_delay_ceiling() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);

    let payload = UpdateAuth {
        account: n("alice"),
        permission: n("trading"),
        parent: n("active"),
        auth: Authority {
            threshold: 1,
            keys: vec![KeyWeight { key: key(5), weight: 1 }],
            accounts: vec![],
            waits: vec![WaitWeight {
                wait_sec: control.config.max_transaction_delay + 1,
                weight: 1,
            }],
        },
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::UPDATEAUTH_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3050000));
    assert!(control.db.find_permission(&level("alice", "trading")).is_none());
    Ok(())
}

#[test]
fn payer_pseudo_permission_is_accepted_in_authorities() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_account(&mut control, "bob", 2);

    // bob@sysio.payer never exists as a stored permission, it is still a
    // valid factor in an authority
    let payload = UpdateAuth {
        account: n("alice"),
        permission: n("trading"),
        parent: n("active"),
        auth: Authority {
            threshold: 1,
            keys: vec![KeyWeight { key: key(5), weight: 1 }],
            accounts: vec![PermissionLevelWeight {
                permission: level("bob", "sysio.payer"),
                weight: 1,
            }],
            waits: vec![],
        },
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::UPDATEAUTH_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);
    Ok(())
}

#[test]
fn unactivated_key_types_are_rejected_in_new_authorities() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    control.config.features.num_supported_key_types = 1;

    let payload = UpdateAuth {
        account: n("alice"),
        permission: n("trading"),
        parent: n("active"),
        auth: Authority::single_key(PublicKey::new(KeyType::R1, [9; 33])),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::UPDATEAUTH_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3090010));
    Ok(())
}

#[test]
fn relinking_to_the_same_requirement_is_rejected() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_contract_account(&mut control, "hodl", 10);

    let payload = LinkAuth {
        account: n("alice"),
        code: n("hodl"),
        action: n("transfer"),
        requirement: n("active"),
    };
    let action = Action::new(
        config::SYSTEM_ACCOUNT, config::LINKAUTH_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![action.clone()]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);
    assert_eq!(trace.ram_delta_for(n("alice")),
               config::BILLABLE_SIZE_PERMISSION_LINK as i64);

    // linking again to the very same requirement is a no-op and an error
    // (fresh expiration so the transaction is not a duplicate)
    let mut t = trx(vec![action.clone()]);
    t.expiration = TimePointSec::new(3601);
    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3050000));

    // moving the link to a different requirement is fine and costs nothing
    let mut action = action;
    action.data = Action::encode_data(&LinkAuth { requirement: n("owner"), ..payload });
    let trace = control.push_transaction(trx(vec![action]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);
    assert_eq!(trace.ram_delta_for(n("alice")), 0);
    Ok(())
}


// -----------------------------------------------------------------------------
//     Delays, waits, canceldelay
// -----------------------------------------------------------------------------

/// alice's active authority needs its 60s wait on top of the key.
fn setup_wait_authority(control: &mut Controller) {
    create_contract_account(control, "hodl", 10);
    create_account_with(control, "alice",
        Authority::single_key(key(1)),
        Authority {
            threshold: 2,
            keys: vec![KeyWeight { key: key(1), weight: 1 }],
            accounts: vec![],
            waits: vec![WaitWeight { wait_sec: 60, weight: 1 }],
        });
}

#[test]
fn wait_requires_a_delayed_transaction() -> Result<()> {
    let mut control = setup();
    setup_wait_authority(&mut control);

    // without a delay the wait weight is unavailable
    let t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.error_code, Some(3090003));
    Ok(())
}

#[test]
fn delayed_transaction_lifecycle() -> Result<()> {
    let mut control = setup();
    setup_wait_authority(&mut control);

    let mut t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    t.delay_sec = 120;
    let id = t.id();
    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Delayed);
    // nothing executed yet, but storage was billed to the first authorizer:
    // the fixed record overhead plus the serialized payload
    assert!(trace.action_traces.is_empty());

    // delayed input transactions are stored under the empty sender
    let sender_id = u128::from_be_bytes(id.as_bytes()[..16].try_into().unwrap());
    let stored = control.db.find_generated_transaction(Name::default(), sender_id).unwrap();
    let stored_size = stored.billable_size();
    assert!(stored_size > config::BILLABLE_SIZE_GENERATED_TRANSACTION);
    assert_eq!(control.db.usage(n("alice")).ram_usage, stored_size as i64);

    let trace = control.push_scheduled_transaction(Name::default(), sender_id).unwrap();
    assert_eq!(trace.status, TransactionStatus::Executed);
    assert!(trace.scheduled);
    assert_eq!(trace.action_traces.len(), 1);
    assert_eq!(control.db.usage(n("alice")).ram_usage, 0);

    assert!(control.push_scheduled_transaction(Name::default(), sender_id).is_none());
    Ok(())
}

#[test]
fn canceldelay_inherits_the_canceled_delay() -> Result<()> {
    let mut control = setup();
    setup_wait_authority(&mut control);

    let mut t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    t.delay_sec = 120;
    let id = t.id();
    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Delayed);

    // the cancel itself runs with no delay; the canceled transaction's
    // 120s delay is inherited, so the wait factor is available
    let payload = CancelDelay { canceling_auth: level("alice", "active"), trx_id: id };
    let cancel = Action::new(
        config::SYSTEM_ACCOUNT, config::CANCELDELAY_ACTION,
        vec![level("alice", "active")],
        Action::encode_data(&payload),
    );
    let trace = control.push_transaction(trx(vec![cancel]), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);

    let sender_id = u128::from_be_bytes(id.as_bytes()[..16].try_into().unwrap());
    assert!(control.db.find_generated_transaction(Name::default(), sender_id).is_none());
    assert_eq!(control.db.usage(n("alice")).ram_usage, 0);
    Ok(())
}


// -----------------------------------------------------------------------------
//     Structural validation
// -----------------------------------------------------------------------------

#[test]
fn expired_transaction_is_rejected() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_contract_account(&mut control, "hodl", 10);

    let mut t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    t.expiration = TimePointSec::new(0);
    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3040002));
    Ok(())
}

#[test]
fn empty_transaction_is_rejected() -> Result<()> {
    let mut control = setup();
    let trace = control.push_transaction(trx(vec![]), keys(&[]));
    assert_eq!(trace.error_code, Some(3040000));
    Ok(())
}

#[test]
fn unknown_referenced_permission_is_rejected() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_contract_account(&mut control, "hodl", 10);

    let t = trx(vec![act("hodl", "transfer", &[("alice", "missing")])]);
    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.error_code, Some(3060001));
    Ok(())
}

#[test]
fn duplicate_transaction_is_rejected() -> Result<()> {
    let mut control = setup();
    create_account(&mut control, "alice", 1);
    create_contract_account(&mut control, "hodl", 10);

    let t = trx(vec![act("hodl", "transfer", &[("alice", "active")])]);
    let trace = control.push_transaction(t.clone(), keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::Executed);

    let trace = control.push_transaction(t, keys(&[1]));
    assert_eq!(trace.status, TransactionStatus::HardFail);
    assert_eq!(trace.error_code, Some(3040005));
    Ok(())
}
