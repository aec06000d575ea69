//! Shared primitives for the zkrep reputation ledger crates.

pub mod field;
pub mod hash;

pub use field::{serde_hex_padded, FieldElement, BIG_NUMBER_TAG};
pub use hash::{hash_fields, hash_left_right};

use thiserror::Error;

/// Errors raised while parsing or decoding field values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("empty field element")]
    Empty,

    #[error("invalid hex field element: {0}")]
    InvalidHex(String),

    #[error("invalid decimal field element: {0}")]
    InvalidDecimal(String),

    #[error("unexpected big number tag: {0}")]
    UnexpectedTag(String),
}
