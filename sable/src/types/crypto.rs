use std::fmt;
use std::str::FromStr;

use ripemd::Ripemd160;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum InvalidCrypto {
    #[snafu(display(r#"cannot parse digest from: "{repr}""#))]
    DigestFormat { repr: String, source: hex::FromHexError },

    #[snafu(display("digest must be 32 bytes, got {len}"))]
    DigestLength { len: usize },

    #[snafu(display(r#"unknown public key prefix in: "{repr}""#))]
    KeyPrefix { repr: String },

    #[snafu(display(r#"invalid base58 data in key: "{repr}""#))]
    KeyBase58 { repr: String, source: bs58::decode::Error },

    #[snafu(display("invalid key payload length: {len}"))]
    KeyLength { len: usize },

    #[snafu(display("key checksum mismatch"))]
    KeyChecksum,
}


// -----------------------------------------------------------------------------
//     SHA-256 digest
// -----------------------------------------------------------------------------

/// A SHA-256 digest, rendered as lowercase hex in JSON.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone)]
pub struct Sha256Digest([u8; 32]);

impl Sha256Digest {
    pub fn hash(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Self(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self { Self(bytes) }
    pub const fn as_bytes(&self) -> &[u8; 32] { &self.0 }
}

impl Default for Sha256Digest {
    fn default() -> Self { Self([0; 32]) }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Sha256Digest {
    type Err = InvalidCrypto;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).context(DigestFormatSnafu { repr: s.to_owned() })?;
        let bytes: [u8; 32] = bytes.try_into()
            .map_err(|v: Vec<u8>| DigestLengthSnafu { len: v.len() }.build())?;
        Ok(Self(bytes))
    }
}

impl Serialize for Sha256Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr: &str = <&str>::deserialize(deserializer)?;
        repr.parse().map_err(de::Error::custom)
    }
}


// -----------------------------------------------------------------------------
//     Public keys
//
//     only the text representation is needed here; signature recovery is the
//     caller's concern and recovered keys are passed in already verified
// -----------------------------------------------------------------------------

/// The curve type of a public key.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, strum::Display)]
pub enum KeyType {
    K1,
    R1,
}

impl KeyType {
    /// Activation index; chains accept key types in this order.
    pub const fn activation_index(self) -> u8 {
        match self {
            Self::K1 => 0,
            Self::R1 => 1,
        }
    }
}

/// A public key in its compressed 33-byte form.
///
/// Text format is the modern one, `PUB_K1_...` / `PUB_R1_...`, with the
/// 4-byte RIPEMD-160 checksum salted with the key type suffix.
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Clone)]
pub struct PublicKey {
    pub key_type: KeyType,
    pub data: [u8; 33],
}

fn checksum(data: &[u8], salt: &str) -> [u8; 4] {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

impl PublicKey {
    pub const fn new(key_type: KeyType, data: [u8; 33]) -> Self {
        Self { key_type, data }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let salt = self.key_type.to_string();
        let mut payload = Vec::with_capacity(37);
        payload.extend_from_slice(&self.data);
        payload.extend_from_slice(&checksum(&self.data, &salt));
        write!(f, "PUB_{}_{}", salt, bs58::encode(payload).into_string())
    }
}

impl FromStr for PublicKey {
    type Err = InvalidCrypto;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("PUB_").context(KeyPrefixSnafu { repr: s.to_owned() })?;
        let (key_type, b58) = if let Some(b58) = rest.strip_prefix("K1_") {
            (KeyType::K1, b58)
        }
        else if let Some(b58) = rest.strip_prefix("R1_") {
            (KeyType::R1, b58)
        }
        else {
            return KeyPrefixSnafu { repr: s.to_owned() }.fail();
        };

        let payload = bs58::decode(b58).into_vec()
            .context(KeyBase58Snafu { repr: s.to_owned() })?;
        ensure!(payload.len() == 37, KeyLengthSnafu { len: payload.len() });

        let data: [u8; 33] = payload[..33].try_into().unwrap();
        ensure!(payload[33..] == checksum(&data, &key_type.to_string()), KeyChecksumSnafu);

        Ok(Self { key_type, data })
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr: &str = <&str>::deserialize(deserializer)?;
        repr.parse().map_err(de::Error::custom)
    }
}


// =============================================================================
//
//     Unittests
//
// =============================================================================
