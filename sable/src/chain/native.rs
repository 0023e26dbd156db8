//! The system actions handled natively by the chain itself: account
//! creation and the permission/link management family.

use serde::{Deserialize, Serialize};
use snafu::ensure;
use tracing::debug;

use crate::{
    AccountName, ActionName, Authority, Name, PermissionLevel, PermissionName, TransactionId,
    apply_context::ApplyContext,
    config,
    error::{
        AccountExistsSnafu, ActionValidateSnafu, PermissionNotFoundSnafu, Result,
        TransactionSnafu, UnactivatedKeyTypeSnafu,
    },
};

// -----------------------------------------------------------------------------
//     Action payloads
// -----------------------------------------------------------------------------

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub creator: AccountName,
    pub name: AccountName,
    pub owner: Authority,
    pub active: Authority,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAuth {
    pub account: AccountName,
    pub permission: PermissionName,
    pub parent: PermissionName,
    pub auth: Authority,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DeleteAuth {
    pub account: AccountName,
    pub permission: PermissionName,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct LinkAuth {
    pub account: AccountName,
    pub code: AccountName,
    #[serde(rename = "type")]
    pub action: ActionName,
    pub requirement: PermissionName,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct UnlinkAuth {
    pub account: AccountName,
    pub code: AccountName,
    #[serde(rename = "type")]
    pub action: ActionName,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CancelDelay {
    pub canceling_auth: PermissionLevel,
    pub trx_id: TransactionId,
}

/// The set of actions dispatched to built-in handlers when delivered to
/// the system account as first receiver.
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub enum NativeAction {
    NewAccount,
    UpdateAuth,
    DeleteAuth,
    LinkAuth,
    UnlinkAuth,
    CancelDelay,
}

impl NativeAction {
    /// Classify an action; `None` means it goes to the receiver's contract.
    pub fn classify(account: AccountName, name: ActionName) -> Option<Self> {
        if account != config::SYSTEM_ACCOUNT {
            return None;
        }
        match name {
            n if n == config::NEWACCOUNT_ACTION  => Some(Self::NewAccount),
            n if n == config::UPDATEAUTH_ACTION  => Some(Self::UpdateAuth),
            n if n == config::DELETEAUTH_ACTION  => Some(Self::DeleteAuth),
            n if n == config::LINKAUTH_ACTION    => Some(Self::LinkAuth),
            n if n == config::UNLINKAUTH_ACTION  => Some(Self::UnlinkAuth),
            n if n == config::CANCELDELAY_ACTION => Some(Self::CancelDelay),
            _ => None,
        }
    }

    pub(crate) fn apply(&self, ctx: &mut ApplyContext) -> Result<()> {
        match self {
            Self::NewAccount  => apply_newaccount(ctx),
            Self::UpdateAuth  => apply_updateauth(ctx),
            Self::DeleteAuth  => apply_deleteauth(ctx),
            Self::LinkAuth    => apply_linkauth(ctx),
            Self::UnlinkAuth  => apply_unlinkauth(ctx),
            Self::CancelDelay => apply_canceldelay(ctx),
        }
    }
}

// -----------------------------------------------------------------------------
//     Handlers
// -----------------------------------------------------------------------------

/// Referenced accounts must exist and referenced permissions must exist on
/// them, except for the `sysio.any` / `sysio.code` / `sysio.payer` implicit
/// permissions. Keys must be of a type the chain has activated.
fn validate_authority_precondition(ctx: &ApplyContext, auth: &Authority) -> Result<()> {
    for a in &auth.accounts {
        ctx.db().get_account(a.permission.actor)?;
        let name = a.permission.permission;
        if name == config::ANY_PERMISSION || name == config::CODE_PERMISSION
            || name == config::PAYER_PERMISSION {
            continue;
        }
        ensure!(ctx.db().find_permission(&a.permission).is_some(),
                PermissionNotFoundSnafu { level: a.permission });
    }
    for k in &auth.keys {
        let supported = ctx.config().features.num_supported_key_types;
        ensure!(k.key.key_type.activation_index() < supported,
                UnactivatedKeyTypeSnafu { key_type: k.key.key_type.to_string() });
    }
    Ok(())
}

fn apply_newaccount(ctx: &mut ApplyContext) -> Result<()> {
    ensure!(!ctx.is_read_only(), ActionValidateSnafu {
        msg: "newaccount not allowed in read-only transaction",
    });
    let create: NewAccount = ctx.act().data_as()?;
    ctx.require_authorization(create.creator)?;

    ensure!(create.owner.validate(), ActionValidateSnafu { msg: "invalid owner authority" });
    ensure!(create.active.validate(), ActionValidateSnafu { msg: "invalid active authority" });

    let name_str = create.name.to_string();
    ensure!(!create.name.empty(), ActionValidateSnafu { msg: "account name cannot be empty" });
    ensure!(name_str.len() <= 12, ActionValidateSnafu { msg: "account names can only be 12 chars long" });

    ensure!(ctx.db().is_privileged(create.creator), ActionValidateSnafu {
        msg: "only privileged accounts can create new accounts",
    });

    ensure!(ctx.db().find_account(create.name).is_none(),
            AccountExistsSnafu { account: create.name });

    validate_authority_precondition(ctx, &create.owner)?;
    validate_authority_precondition(ctx, &create.active)?;

    debug!(creator = %create.creator, name = %create.name, "creating account");

    let now = ctx.pending_block_time();
    ctx.db_mut().create_account(create.name, now)?;
    let owner_id = ctx.db_mut().create_permission(
        create.name, config::OWNER_PERMISSION, None, create.owner.clone(), now)?;
    ctx.db_mut().create_permission(
        create.name, config::ACTIVE_PERMISSION, Some(owner_id), create.active.clone(), now)?;
    ctx.db_mut().initialize_account_usage(create.name);

    // accounts outside the system namespace start with zero resources;
    // the system contract grants them quotas afterwards
    let is_system_account =
        create.name == config::SYSTEM_ACCOUNT || name_str.starts_with("sysio.");
    if !is_system_account {
        ctx.db_mut().set_account_limits(create.name, 0, 0, 0);
    }

    let ram_delta = config::OVERHEAD_PER_ACCOUNT_RAM_BYTES
        + 2 * config::BILLABLE_SIZE_PERMISSION_BASE
        + create.owner.billable_size()
        + create.active.billable_size();
    ctx.add_ram_usage(config::SYSTEM_ACCOUNT, ram_delta as i64)
}

fn apply_updateauth(ctx: &mut ApplyContext) -> Result<()> {
    ensure!(!ctx.is_read_only(), ActionValidateSnafu {
        msg: "updateauth not allowed in read-only transaction",
    });
    let update: UpdateAuth = ctx.act().data_as()?;
    // '*.ext' permissions are system-managed; the authorization check
    // already pinned the declared actor to sysio, not the owning account
    if update.permission.suffix() != Name::constant("ext") {
        ctx.require_authorization(update.account)?;
    }

    ensure!(!update.permission.empty(), ActionValidateSnafu { msg: "cannot create authority with empty name" });
    ensure!(!update.permission.to_string().starts_with("sysio."), ActionValidateSnafu {
        msg: "permission names that start with 'sysio.' are reserved",
    });
    ensure!(update.permission != update.parent,
            ActionValidateSnafu { msg: "cannot set an authority as its own parent" });
    ctx.db().get_account(update.account)?;
    ensure!(update.auth.validate(),
            ActionValidateSnafu { msg: "invalid authority" });

    if update.permission == config::OWNER_PERMISSION {
        ensure!(update.parent.empty(),
                ActionValidateSnafu { msg: "parent permission of owner must be empty" });
    }
    else if update.permission == config::ACTIVE_PERMISSION {
        ensure!(update.parent == config::OWNER_PERMISSION,
                ActionValidateSnafu { msg: "parent permission of active must be owner" });
    }
    else {
        ensure!(!update.parent.empty(),
                ActionValidateSnafu { msg: "only owner permission can have empty parent" });
    }

    // waits are strictly ascending, so checking the last one suffices
    if let Some(longest_wait) = update.auth.waits.last() {
        let max_delay = ctx.config().max_transaction_delay;
        ensure!(longest_wait.wait_sec <= max_delay, ActionValidateSnafu {
            msg: format!("cannot set delay longer than max_transaction_delay, \
                          which is {max_delay} seconds"),
        });
    }

    validate_authority_precondition(ctx, &update.auth)?;

    let parent_id = if update.parent.empty() {
        None
    }
    else {
        let parent_level = PermissionLevel::new(update.account, update.parent);
        Some(ctx.db().get_permission(&parent_level)?.id)
    };

    let level = PermissionLevel::new(update.account, update.permission);
    let now = ctx.pending_block_time();

    let ram_delta = match ctx.db().find_permission(&level) {
        Some(existing) => {
            ensure!(existing.parent == parent_id, ActionValidateSnafu {
                msg: "changing parent authority is not currently supported",
            });
            let old_size = config::BILLABLE_SIZE_PERMISSION_BASE as i64
                + existing.auth.billable_size() as i64;
            let new_size = config::BILLABLE_SIZE_PERMISSION_BASE as i64
                + update.auth.billable_size() as i64;
            let id = existing.id;
            ctx.db_mut().modify_permission(id, update.auth.clone(), now)?;
            new_size - old_size
        }
        None => {
            debug!(account = %update.account, permission = %update.permission, "creating permission");
            ctx.db_mut().create_permission(
                update.account, update.permission, parent_id, update.auth.clone(), now)?;
            config::BILLABLE_SIZE_PERMISSION_BASE as i64 + update.auth.billable_size() as i64
        }
    };

    ctx.add_ram_usage(update.account, ram_delta)
}

fn apply_deleteauth(ctx: &mut ApplyContext) -> Result<()> {
    ensure!(!ctx.is_read_only(), ActionValidateSnafu {
        msg: "deleteauth not allowed in read-only transaction",
    });
    let del: DeleteAuth = ctx.act().data_as()?;
    ctx.require_authorization(del.account)?;

    ensure!(del.permission != config::OWNER_PERMISSION,
            ActionValidateSnafu { msg: "cannot delete owner authority" });
    ensure!(del.permission != config::ACTIVE_PERMISSION,
            ActionValidateSnafu { msg: "cannot delete active authority" });

    let level = PermissionLevel::new(del.account, del.permission);
    let permission = ctx.db().get_permission(&level)?;
    let id = permission.id;
    let ram_delta = config::BILLABLE_SIZE_PERMISSION_BASE as i64
        + permission.auth.billable_size() as i64;

    ensure!(!ctx.db().permission_is_linked(del.account, del.permission), ActionValidateSnafu {
        msg: "cannot delete a linked authority, unlink the authority first",
    });
    ensure!(!ctx.db().permission_has_children(id), ActionValidateSnafu {
        msg: "cannot delete an authority which has children",
    });

    ctx.db_mut().remove_permission(id)?;
    ctx.add_ram_usage(del.account, -ram_delta)
}

fn apply_linkauth(ctx: &mut ApplyContext) -> Result<()> {
    ensure!(!ctx.is_read_only(), ActionValidateSnafu {
        msg: "linkauth not allowed in read-only transaction",
    });
    let link: LinkAuth = ctx.act().data_as()?;
    ctx.require_authorization(link.account)?;

    ensure!(!link.requirement.empty(),
            ActionValidateSnafu { msg: "required permission cannot be empty" });
    ctx.db().get_account(link.account)?;
    ctx.db().get_account(link.code)?;

    if link.requirement != config::ANY_PERMISSION {
        let level = PermissionLevel::new(link.account, link.requirement);
        ensure!(ctx.db().find_permission(&level).is_some(),
                PermissionNotFoundSnafu { level });
    }

    if let Some(existing) = ctx.db().find_link(link.account, link.code, link.action) {
        ensure!(existing != link.requirement, ActionValidateSnafu {
            msg: "attempting to update required authority, but new requirement is same as old",
        });
    }

    let replaced = ctx.db_mut().set_link(link.account, link.code, link.action, link.requirement);
    if !replaced {
        ctx.add_ram_usage(link.account, config::BILLABLE_SIZE_PERMISSION_LINK as i64)?;
    }
    Ok(())
}

fn apply_unlinkauth(ctx: &mut ApplyContext) -> Result<()> {
    ensure!(!ctx.is_read_only(), ActionValidateSnafu {
        msg: "unlinkauth not allowed in read-only transaction",
    });
    let unlink: UnlinkAuth = ctx.act().data_as()?;
    ctx.require_authorization(unlink.account)?;

    let removed = ctx.db_mut().remove_link(unlink.account, unlink.code, unlink.action);
    ensure!(removed, TransactionSnafu {
        msg: format!("cannot unlink non-existent permission link of account '{}' for actions matching '{}::{}'",
                     unlink.account, unlink.code, unlink.action),
    });
    ctx.add_ram_usage(unlink.account, -(config::BILLABLE_SIZE_PERMISSION_LINK as i64))
}

fn apply_canceldelay(ctx: &mut ApplyContext) -> Result<()> {
    ensure!(!ctx.is_read_only(), ActionValidateSnafu {
        msg: "canceldelay not allowed in read-only transaction",
    });
    let cancel: CancelDelay = ctx.act().data_as()?;
    ctx.require_authorization(cancel.canceling_auth.actor)?;
    ctx.cancel_deferred_transaction(Name::default(), cancel.trx_id)
}
