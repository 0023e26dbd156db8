use serde::{Deserialize, Serialize};

use crate::{PublicKey, PermissionLevel};

pub type Weight = u16;

#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Clone, Serialize, Deserialize)]
pub struct KeyWeight {
    pub key: PublicKey,
    pub weight: Weight,
}

#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct PermissionLevelWeight {
    pub permission: PermissionLevel,
    pub weight: Weight,
}

/// Grants `weight` once the transaction has been delayed for at least
/// `wait_sec` seconds. Only meaningful in combination with other factors
/// since a wait alone cannot reach a nonzero threshold.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct WaitWeight {
    pub wait_sec: u32,
    pub weight: Weight,
}

/// A weighted-threshold authority: satisfied when the weights of the
/// provided keys, satisfied account permissions and elapsed waits sum to
/// at least `threshold`.
#[derive(Eq, Hash, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Authority {
    pub threshold: u32,
    pub keys: Vec<KeyWeight>,
    pub accounts: Vec<PermissionLevelWeight>,
    pub waits: Vec<WaitWeight>,
}

impl Authority {
    /// Single-key authority with threshold 1.
    pub fn single_key(key: PublicKey) -> Self {
        Self {
            threshold: 1,
            keys: vec![KeyWeight { key, weight: 1 }],
            accounts: vec![],
            waits: vec![],
        }
    }

    /// Authority delegated to a single account permission.
    pub fn single_account(permission: PermissionLevel) -> Self {
        Self {
            threshold: 1,
            keys: vec![],
            accounts: vec![PermissionLevelWeight { permission, weight: 1 }],
            waits: vec![],
        }
    }

    /// Structural validity: a nonzero, attainable threshold and strictly
    /// ascending factor lists (which also guarantees uniqueness).
    /// A wait of zero seconds is meaningless and rejected.
    pub fn validate(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }

        if !strictly_ascending(&self.keys) { return false; }
        if !strictly_ascending(&self.accounts) { return false; }
        if !strictly_ascending(&self.waits) { return false; }
        if let Some(first) = self.waits.first() {
            if first.wait_sec == 0 { return false; }
        }

        let total: u64 = self.keys.iter().map(|k| k.weight as u64)
            .chain(self.accounts.iter().map(|a| a.weight as u64))
            .chain(self.waits.iter().map(|w| w.weight as u64))
            .sum();

        total >= self.threshold as u64
    }

    /// RAM billed for the variable part of a stored authority.
    pub fn billable_size(&self) -> u64 {
        self.keys.len() as u64 * 40
            + self.accounts.len() as u64 * 20
            + self.waits.len() as u64 * 8
    }
}

fn strictly_ascending<T: Ord>(items: &[T]) -> bool {
    items.windows(2).all(|w| w[0] < w[1])
}


#[cfg(test)]
mod tests {
    use crate::{KeyType, Name};
    use super::*;

    fn key(tag: u8) -> PublicKey {
        PublicKey::new(KeyType::K1, [tag; 33])
    }

    fn level(actor: &str, permission: &str) -> PermissionLevel {
        PermissionLevel::new(Name::new(actor).unwrap(), Name::new(permission).unwrap())
    }

    #[test]
    fn single_key_is_valid() {
        assert!(Authority::single_key(key(1)).validate());
        assert!(Authority::single_account(level("prod", "active")).validate());
    }

    #[test]
    fn zero_threshold_is_invalid() {
        let mut auth = Authority::single_key(key(1));
        auth.threshold = 0;
        assert!(!auth.validate());
    }

    #[test]
    fn unattainable_threshold_is_invalid() {
        let mut auth = Authority::single_key(key(1));
        auth.threshold = 2;
        assert!(!auth.validate());
        auth.keys[0].weight = 2;
        assert!(auth.validate());
    }

    #[test]
    fn unsorted_or_duplicate_factors_are_invalid() {
        let sorted = Authority {
            threshold: 2,
            keys: vec![
                KeyWeight { key: key(1), weight: 1 },
                KeyWeight { key: key(2), weight: 1 },
            ],
            accounts: vec![],
            waits: vec![],
        };
        assert!(sorted.validate());

        let mut unsorted = sorted.clone();
        unsorted.keys.swap(0, 1);
        assert!(!unsorted.validate());

        let mut duplicated = sorted;
        duplicated.keys[1] = duplicated.keys[0].clone();
        assert!(!duplicated.validate());
    }

    #[test]
    fn wait_rules() {
        let auth = Authority {
            threshold: 2,
            keys: vec![KeyWeight { key: key(1), weight: 1 }],
            accounts: vec![],
            waits: vec![WaitWeight { wait_sec: 60, weight: 1 }],
        };
        // waits may be load-bearing: a delayed transaction can supply
        // the missing weight
        assert!(auth.validate());

        let mut zero_wait = auth;
        zero_wait.waits[0].wait_sec = 0;
        assert!(!zero_wait.validate());
    }
}
