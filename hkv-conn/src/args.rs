//! # Request Arguments
//!
//! Every argument is sent as a bulk string; this module only decides which
//! borrowed values may become one and how numbers are spelled.

/// A single request argument.
///
/// Borrows byte-like values so building a request never copies payloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    /// Strings and raw bytes, sent as-is.
    Bytes(&'a [u8]),
    /// Signed integer, sent in decimal.
    Int(i64),
    /// Unsigned integer, sent in decimal.
    UInt(u64),
    /// Float, sent as its shortest round-trip decimal (`inf`/`-inf` for
    /// infinities). NaN has no encoding.
    Float(f64),
    /// Boolean, sent as `1` or `0`.
    Bool(bool),
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Bytes(value.as_bytes())
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(value: &'a String) -> Self {
        Arg::Bytes(value.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a> From<&'a Vec<u8>> for Arg<'a> {
    fn from(value: &'a Vec<u8>) -> Self {
        Arg::Bytes(value.as_slice())
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Arg<'a> {
    fn from(value: &'a [u8; N]) -> Self {
        Arg::Bytes(value.as_slice())
    }
}

macro_rules! signed_arg {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg<'_> {
            fn from(value: $ty) -> Self {
                Arg::Int(value as i64)
            }
        })*
    };
}

macro_rules! unsigned_arg {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg<'_> {
            fn from(value: $ty) -> Self {
                Arg::UInt(value as u64)
            }
        })*
    };
}

signed_arg!(i8, i16, i32, i64, isize);
unsigned_arg!(u8, u16, u32, u64, usize);

impl From<f32> for Arg<'_> {
    fn from(value: f32) -> Self {
        Arg::Float(value as f64)
    }
}

impl From<f64> for Arg<'_> {
    fn from(value: f64) -> Self {
        Arg::Float(value)
    }
}

impl From<bool> for Arg<'_> {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}
