use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::ResultExt;

use crate::{AccountName, ActionName, Bytes, Digest, PermissionName};
use crate::error::{ActionDataSnafu, ChainError};

/// An actor authorizing an action under one of its named permissions.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct PermissionLevel {
    pub actor: AccountName,
    pub permission: PermissionName,
}

impl PermissionLevel {
    pub const fn new(actor: AccountName, permission: PermissionName) -> Self {
        Self { actor, permission }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.actor, self.permission)
    }
}

/// A single dispatchable unit of work: a method `name` on contract
/// `account`, with its payload and the authorizations it declares.
#[derive(Eq, Hash, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub account: AccountName,
    pub name: ActionName,
    pub authorization: Vec<PermissionLevel>,
    pub data: Bytes,
}

impl Action {
    pub fn new(account: AccountName, name: ActionName,
               authorization: Vec<PermissionLevel>, data: Bytes) -> Self {
        Self { account, name, authorization, data }
    }

    /// Decode the payload into a typed struct. Payloads are carried in
    /// their canonical JSON encoding.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ChainError> {
        serde_json::from_slice(self.data.as_slice())
            .context(ActionDataSnafu { account: self.account, name: self.name })
    }

    /// Encode a typed payload into action data.
    pub fn encode_data<T: Serialize>(payload: &T) -> Bytes {
        // our payload types always serialize cleanly
        Bytes::new(serde_json::to_vec(payload).unwrap_or_default())
    }

    /// Digest over the full action, bound into its receipt.
    pub fn digest(&self) -> Digest {
        Digest::hash(serde_json::to_vec(self).unwrap_or_default())
    }
}


#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;
    use serde::Deserialize;
    use crate::Name;
    use super::*;

    #[derive(Deserialize)]
    struct Transfer {
        from: Name,
        to: Name,
        quantity: u64,
    }

    #[test]
    fn typed_payload_decoding() -> Result<()> {
        let action = Action::new(
            Name::constant("hodl"), Name::constant("transfer"),
            vec![PermissionLevel::new(Name::constant("alice"), Name::constant("active"))],
            Bytes::from(&br#"{"from":"alice","to":"bob","quantity":5}"#[..]),
        );

        let t: Transfer = action.data_as()?;
        assert_eq!(t.from, Name::constant("alice"));
        assert_eq!(t.to, Name::constant("bob"));
        assert_eq!(t.quantity, 5);

        assert!(action.data_as::<Vec<u8>>().is_err());
        Ok(())
    }

    #[test]
    fn digest_covers_payload() {
        let mut action = Action::new(
            Name::constant("hodl"), Name::constant("transfer"),
            vec![], Bytes::from(&b"{}"[..]),
        );
        let d1 = action.digest();
        action.data = Bytes::from(&b"{ }"[..]);
        assert_ne!(action.digest(), d1);
    }

    #[test]
    fn permission_level_display() {
        let level = PermissionLevel::new(Name::constant("alice"), Name::constant("owner"));
        assert_eq!(level.to_string(), "alice@owner");
    }
}
