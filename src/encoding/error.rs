//! Error type and Return values used by the Serialization.

use serde::ser;
use thiserror::Error;

/// Represents all possible errors that can happen during Serialization.
#[derive(Debug, Error)]
pub enum Error {
    /// The struct contains a type that has no canonical byte representation.
    ///
    /// Floating point numbers and maps are rejected: their encoding would not
    /// be unique (NaN payloads, iteration order), which breaks hashing.
    #[error("type is not representable in the canonical encoding: {0}")]
    TypeNotRepresentable(&'static str),
    /// Sequences have to report their length up front, the length is part of
    /// the encoding.
    #[error("sequence length must be known before serializing")]
    UnknownLength,
    /// Lengths are written as `u32`.
    #[error("length {0} does not fit into the length prefix")]
    LengthOverflow(usize),
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: core::fmt::Display,
    {
        Error::Custom(msg.to_string())
    }
}

/// Alias for `Result` using the [Error] returned by the Serializer.
pub type Result<T> = core::result::Result<T, Error>;
