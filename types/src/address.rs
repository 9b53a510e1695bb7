//! Address-like identifiers: identities, hermes instances and channels.
//!
//! All of them are `0x`-prefixed hex strings. Parsing normalizes to lower
//! case so that two spellings of the same address compare equal and hash to
//! the same storage key.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::TypesError;

/// Length of an account address in bytes (`0x` + 40 hex chars).
pub const ADDRESS_LEN: usize = 20;

/// A `0x`-prefixed, lower-case hex address.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl Address {
    pub const PREFIX: &'static str = "0x";

    /// Create an address from a raw string, normalizing case and prefix.
    ///
    /// No length validation is performed; use [`Address::parse`] for input
    /// coming from outside the process.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim();
        let body = raw
            .strip_prefix(Self::PREFIX)
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        Self(format!("{}{}", Self::PREFIX, body.to_ascii_lowercase()))
    }

    /// Parse and validate a 20-byte hex address.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, TypesError> {
        let address = Self::new(raw.as_ref());
        if !address.is_valid() {
            return Err(TypesError::InvalidAddress(raw.as_ref().to_string()));
        }
        Ok(address)
    }

    /// Build an address from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("{}{}", Self::PREFIX, hex::encode(bytes)))
    }

    /// The zero address, used as "no beneficiary".
    pub fn zero() -> Self {
        Self::from_bytes(&[0u8; ADDRESS_LEN])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn body(&self) -> &str {
        self.0.strip_prefix(Self::PREFIX).unwrap_or(&self.0)
    }

    /// Whether this is a well-formed 20-byte hex address.
    pub fn is_valid(&self) -> bool {
        let body = self.body();
        body.len() == ADDRESS_LEN * 2 && body.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub fn is_zero(&self) -> bool {
        self.body().bytes().all(|b| b == b'0')
    }

    /// Decode the hex body into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        hex::decode(self.body()).map_err(|e| TypesError::InvalidHex(format!("{}: {e}", self.0)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! address_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Address);

        impl $name {
            pub fn new(raw: impl AsRef<str>) -> Self {
                Self(Address::new(raw))
            }

            pub fn parse(raw: impl AsRef<str>) -> Result<Self, TypesError> {
                Address::parse(raw).map(Self)
            }

            pub fn address(&self) -> &Address {
                &self.0
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<Address> for $name {
            fn from(address: Address) -> Self {
                Self(address)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

address_newtype!(
    /// A consumer or provider identity.
    Identity
);

address_newtype!(
    /// The on-chain address of a hermes instance.
    HermesId
);

/// Identifier of a payment channel between an identity and a hermes.
///
/// Channel ids are 32-byte hashes rather than 20-byte addresses, so they are
/// kept as a separate type with no length validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Normalize any hex spelling to `0x` + lower-case hex.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Address::new(raw).0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Address::from_bytes(bytes).0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        let body = self.0.strip_prefix(Address::PREFIX).unwrap_or(&self.0);
        hex::decode(body)
            .map_err(|e| TypesError::InvalidHex(format!("{}: {e}", self.0)))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
