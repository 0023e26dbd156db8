//! Base value types shared by the whole crate.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod crypto;
pub mod name;
pub mod time;

pub use crypto::{InvalidCrypto, KeyType, PublicKey, Sha256Digest};
pub use name::{InvalidName, Name};
pub use time::{InvalidTimestamp, Microseconds, TimePoint, TimePointSec};

/// Semantic aliases to make signatures self-describing.
pub type AccountName = Name;
pub type ActionName = Name;
pub type PermissionName = Name;
pub type ScopeName = Name;
pub type TableName = Name;

pub type TransactionId = Sha256Digest;
pub type Digest = Sha256Digest;

/// Raw payload bytes, hex-encoded in JSON.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Clone, Default)]
pub struct Bytes(Vec<u8>);

impl Bytes {
    pub fn new(data: Vec<u8>) -> Self { Self(data) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn as_slice(&self) -> &[u8] { &self.0 }
}

impl From<Vec<u8>> for Bytes {
    fn from(data: Vec<u8>) -> Self { Self(data) }
}

impl From<&[u8]> for Bytes {
    fn from(data: &[u8]) -> Self { Self(data.to_vec()) }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] { &self.0 }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr: &str = <&str>::deserialize(deserializer)?;
        hex::decode(repr).map(Self).map_err(de::Error::custom)
    }
}
