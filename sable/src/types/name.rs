use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ensure, Snafu};

#[derive(Debug, Snafu)]
pub enum InvalidName {
    #[snafu(display(r#"name is longer than 13 characters: "{name}""#))]
    TooLong { name: String },

    #[snafu(display(r#"name not properly normalized (given: "{given}", normalized: "{normalized}")"#))]
    NotNormalized { given: String, normalized: String },
}

/// An immutable on-chain name, encoded in base-32 into a `u64`.
///
/// Names are at most 13 characters drawn from `.12345abcdefghijklmnopqrstuvwxyz`
/// and identify accounts, permissions, actions, tables and scopes. Their `u64`
/// encoding defines the canonical ordering used everywhere determinism matters
/// (authorization processing order, table iteration, ...).
///
/// ## Example
/// ```
/// # use sable::Name;
/// let n = Name::new("alice")?;
/// assert_eq!(n.to_string(), "alice");
/// # Ok::<(), sable::InvalidName>(())
/// ```
#[derive(Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Default)]
pub struct Name {
    value: u64,
}

impl Name {
    /// Build a `Name` from its string representation, rejecting strings that
    /// do not round-trip through the `u64` encoding.
    pub fn new(s: &str) -> Result<Self, InvalidName> {
        ensure!(s.len() <= 13, TooLongSnafu { name: s.to_owned() });

        let result = Name { value: encode_name(s.as_bytes()) };

        if round_trips(s.as_bytes(), result.value) {
            Ok(result)
        }
        else {
            NotNormalizedSnafu { given: s.to_owned(), normalized: result.to_string() }.fail()
        }
    }

    /// Compile-time constructor, panics on invalid input.
    pub const fn constant(s: &str) -> Self {
        if s.len() > 13 { panic!("name too long, max is 13 chars"); }
        let value = encode_name(s.as_bytes());
        if !round_trips(s.as_bytes(), value) { panic!("name not normalized"); }
        Name { value }
    }

    #[inline]
    pub const fn from_u64(n: u64) -> Self {
        // all u64 values decode to some (possibly empty) name
        Self { value: n }
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 { self.value }

    /// Whether this is the empty name (the `u64` zero).
    #[inline]
    pub const fn empty(&self) -> bool { self.value == 0 }

    /// Everything before the last `.` separator, or the name itself when
    /// it has no separator.
    pub fn prefix(&self) -> Name {
        let repr = self.to_string();
        match repr.rsplit_once('.') {
            Some((prefix, _)) => Name::new(prefix).unwrap_or_default(),
            None => *self,
        }
    }

    /// Everything after the last `.` separator, or the name itself when
    /// it has no separator. Used for reserved permission namespaces.
    pub fn suffix(&self) -> Name {
        let repr = self.to_string();
        match repr.rsplit_once('.') {
            Some((_, suffix)) => Name::new(suffix).unwrap_or_default(),
            None => *self,
        }
    }
}


// -----------------------------------------------------------------------------
//     Encoding helpers
//
//     see the reference implementation in
//     AntelopeIO/spring:libraries/chain/name.{hpp,cpp}
// -----------------------------------------------------------------------------

const fn char_to_symbol(c: u8) -> u64 {
    match c {
        b'a'..=b'z' => (c - b'a') as u64 + 6,
        b'1'..=b'5' => (c - b'1') as u64 + 1,
        _ => 0,
    }
}

const fn encode_name(s: &[u8]) -> u64 {
    let mut n: u64 = 0;
    let maxlen = if s.len() < 12 { s.len() } else { 12 };
    let mut i = 0;
    while i < maxlen {
        n |= char_to_symbol(s[i]) << (64 - 5 * (i + 1));
        i += 1;
    }

    // the loop above encoded up to 60 high bits; a 13th char, when present,
    // goes into the low 4 bits and so can only be one of `.12345abcdefghij`
    if s.len() >= 13 {
        n |= char_to_symbol(s[12]) & 0x0F;
    }

    n
}

const CHARMAP: &[u8] = b".12345abcdefghijklmnopqrstuvwxyz";

const fn decode_into(n: u64, out: &mut [u8; 13]) -> usize {
    let mut n = n;
    let mut i = 0;
    while i < 13 {
        let c: u8 = CHARMAP[n as usize & if i == 0 { 0x0F } else { 0x1F }];
        out[12 - i] = c;
        n >>= if i == 0 { 4 } else { 5 };
        i += 1;
    }

    // drop unused trailing separators
    let mut end = 13;
    while end > 0 && out[end - 1] == b'.' {
        end -= 1;
    }
    end
}

const fn round_trips(s: &[u8], encoded: u64) -> bool {
    let mut decoded = [b'.'; 13];
    let len = decode_into(encoded, &mut decoded);

    if s.len() != len { return false; }
    let mut i = 0;
    while i < len {
        if s[i] != decoded[i] { return false; }
        i += 1;
    }
    true
}


// -----------------------------------------------------------------------------
//     Conversion traits
// -----------------------------------------------------------------------------

impl TryFrom<&str> for Name {
    type Error = InvalidName;

    fn try_from(s: &str) -> Result<Name, InvalidName> {
        Name::new(s)
    }
}

impl From<u64> for Name {
    fn from(n: u64) -> Name {
        Name::from_u64(n)
    }
}


// -----------------------------------------------------------------------------
//     `Display` / `FromStr` implementations
// -----------------------------------------------------------------------------

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut decoded = [b'.'; 13];
        let len = decode_into(self.value, &mut decoded);
        // the charmap is pure ASCII so this cannot fail
        f.write_str(std::str::from_utf8(&decoded[..len]).unwrap())
    }
}

impl FromStr for Name {
    type Err = InvalidName;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::new(s)
    }
}


// -----------------------------------------------------------------------------
//     `Serde` traits implementation
// -----------------------------------------------------------------------------

impl Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D>(deserializer: D) -> Result<Name, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name: &str = <&str>::deserialize(deserializer)?;
        Name::new(name).map_err(|e| de::Error::custom(e.to_string()))
    }
}


// =============================================================================
//
//     Unittests
//
// =============================================================================
