//! Substitution-table codec for the shadow transport
//!
//! A codec is a pair of 256-byte permutations derived deterministically from
//! a passphrase. Encryption and decryption are byte-wise table lookups
//! applied in place, so they preserve length and compose with any framing
//! the surrounding transport does.

pub mod pool;
pub mod table;

pub use pool::CoderPool;
pub use table::TableCoder;

use thiserror::Error;

/// Codec construction errors
#[derive(Debug, Error)]
pub enum CoderError {
    #[error("unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    #[error("empty cipher key")]
    EmptyKey,
}
