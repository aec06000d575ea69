//! Fixed-width 256-bit field values and their snapshot codec.
//!
//! Every big integer that crosses a persistence boundary goes through
//! [`FieldElement`]. On the wire it takes the tagged shape
//!
//! ```json
//! { "type": "BigNumber", "hex": "0x1e" }
//! ```
//!
//! and decoding additionally accepts bare decimal or `0x` hex strings and
//! JSON integers, which is how public signals arrive from provers.

use std::{fmt, str::FromStr};

use ethers::types::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::FieldError;

/// Tag written into the `type` member of a serialized [`FieldElement`].
pub const BIG_NUMBER_TAG: &str = "BigNumber";

/// An unsigned 256-bit value (tree roots, nullifiers, epoch keys, signals).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldElement(U256);

impl FieldElement {
    pub fn zero() -> Self {
        Self(U256::zero())
    }

    pub fn one() -> Self {
        Self(U256::one())
    }

    pub fn from_u256(value: U256) -> Self {
        Self(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Big-endian 32-byte encoding.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.0.to_big_endian(&mut out);
        out
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(U256::from_big_endian(&bytes))
    }

    /// Minimal `0x` hex form used by the BigNumber codec.
    pub fn to_hex(&self) -> String {
        format!("0x{:x}", self.0)
    }

    /// Zero-padded 64-digit `0x` hex form.
    pub fn to_hex_padded(&self) -> String {
        format!("0x{}", hex::encode(self.to_be_bytes()))
    }

    /// Returns the value as `u64` if it fits.
    pub fn to_u64(&self) -> Option<u64> {
        if self.0 > U256::from(u64::MAX) {
            None
        } else {
            Some(self.0.low_u64())
        }
    }

    /// Reduces the value modulo `2^bits`.
    pub fn truncate_bits(&self, bits: u32) -> Self {
        if bits >= 256 {
            return *self;
        }
        let mask = (U256::one() << bits as usize) - U256::one();
        Self(self.0 & mask)
    }

    /// Whether the value is strictly below `2^bits`.
    pub fn fits_bits(&self, bits: u32) -> bool {
        bits >= 256 || self.0.bits() <= bits as usize
    }

    /// Parses a decimal string or a `0x`-prefixed hex string.
    pub fn parse(input: &str) -> Result<Self, FieldError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FieldError::Empty);
        }
        if let Some(hex_digits) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            if hex_digits.is_empty() || hex_digits.len() > 64 {
                return Err(FieldError::InvalidHex(trimmed.to_string()));
            }
            return U256::from_str_radix(hex_digits, 16)
                .map(Self)
                .map_err(|_| FieldError::InvalidHex(trimmed.to_string()));
        }
        U256::from_dec_str(trimmed)
            .map(Self)
            .map_err(|_| FieldError::InvalidDecimal(trimmed.to_string()))
    }
}

impl From<u64> for FieldElement {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<U256> for FieldElement {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<FieldElement> for U256 {
    fn from(value: FieldElement) -> Self {
        value.0
    }
}

impl FromStr for FieldElement {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldElement({})", self.to_hex())
    }
}

// ============================================================================
// BigNumber codec
// ============================================================================

#[derive(Serialize)]
struct TaggedOut<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    hex: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaggedIn {
    Tagged {
        #[serde(rename = "type")]
        kind: String,
        hex: String,
    },
    Text(String),
    Integer(u64),
}

impl Serialize for FieldElement {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        TaggedOut {
            kind: BIG_NUMBER_TAG,
            hex: self.to_hex(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldElement {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match TaggedIn::deserialize(deserializer)? {
            TaggedIn::Tagged { kind, hex } => {
                if kind != BIG_NUMBER_TAG {
                    return Err(de::Error::custom(FieldError::UnexpectedTag(kind)));
                }
                if !hex.starts_with("0x") && !hex.starts_with("0X") {
                    return Err(de::Error::custom(FieldError::InvalidHex(hex)));
                }
                FieldElement::parse(&hex).map_err(de::Error::custom)
            }
            TaggedIn::Text(text) => FieldElement::parse(&text).map_err(de::Error::custom),
            TaggedIn::Integer(value) => Ok(FieldElement::from(value)),
        }
    }
}

/// Serializes a [`FieldElement`] as its zero-padded hex string.
///
/// Used for values that must be usable as JSON object keys.
pub mod serde_hex_padded {
    use super::*;

    pub fn serialize<S>(value: &FieldElement, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_hex_padded())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<FieldElement, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        if text.len() != 66 || !text.starts_with("0x") {
            return Err(de::Error::custom(FieldError::InvalidHex(text)));
        }
        FieldElement::parse(&text).map_err(de::Error::custom)
    }
}
