//! Trace and span identifiers.
//!
//! Identifiers are fixed-width byte arrays on the wire. They are kept as bytes
//! in memory and rendered as lowercase hex wherever a human or a destination
//! needs text.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The identifier has the wrong number of bytes.
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// The identifier text is not valid hex.
    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),

    /// All bytes are zero, which the wire protocol reserves for "absent".
    #[error("identifier must not be all zeros")]
    AllZero,
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Width of the identifier in bytes.
            pub const LEN: usize = $len;

            /// Creates an identifier from raw bytes.
            ///
            /// # Errors
            ///
            /// Returns [`IdError::AllZero`] when every byte is zero.
            pub fn from_bytes(bytes: [u8; $len]) -> Result<Self, IdError> {
                if bytes.iter().all(|b| *b == 0) {
                    return Err(IdError::AllZero);
                }
                Ok(Self(bytes))
            }

            /// Creates an identifier from a byte slice of exactly the right width.
            ///
            /// # Errors
            ///
            /// Returns an error if the slice has the wrong length or is all zeros.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| IdError::InvalidLength {
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Self::from_bytes(array)
            }

            /// Parses an identifier from hex text (either case).
            ///
            /// # Errors
            ///
            /// Returns an error if the text is not hex, has the wrong length,
            /// or decodes to all zeros.
            pub fn from_hex(text: &str) -> Result<Self, IdError> {
                let bytes =
                    hex::decode(text.trim()).map_err(|e| IdError::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }

            /// Returns the raw bytes.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Returns the bytes as an owned vector, the shape the protobuf types use.
            #[must_use]
            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }

            /// Returns the lowercase hex rendering.
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::from_hex(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// 128-bit trace identifier shared by every span of one trace.
    TraceId,
    16
);

define_id!(
    /// 64-bit span identifier, unique within its trace.
    SpanId,
    8
);

/// Parses an optional identifier from protobuf bytes, where an empty slice means absent.
///
/// # Errors
///
/// Returns an error if the bytes are present but malformed.
pub fn optional_span_id(bytes: &[u8]) -> Result<Option<SpanId>, IdError> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        SpanId::from_slice(bytes).map(Some)
    }
}

/// Parses an optional trace identifier from protobuf bytes.
///
/// # Errors
///
/// Returns an error if the bytes are present but malformed.
pub fn optional_trace_id(bytes: &[u8]) -> Result<Option<TraceId>, IdError> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        TraceId::from_slice(bytes).map(Some)
    }
}
