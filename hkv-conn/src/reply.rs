//! # Decoded Replies
//!
//! Purpose: Hold one decoded reply frame and offer typed views over it.
//!
//! ## Design Principles
//! 1. **Closed Sum Type**: Decoding dispatches into an exhaustive enum.
//! 2. **Command-Agnostic**: No variant belongs to a specific command.
//! 3. **Owned Payloads**: Replies outlive the connection's read buffer.

use crate::error::{ConnError, ConnResult};

/// One reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK` style status line.
    Status(String),
    /// `-ERR ...` line nested in an array or a drained pipeline.
    ///
    /// A top-level error frame is returned as [`ConnError::Server`] instead.
    Error(String),
    /// `:123` integer.
    Integer(i64),
    /// `$...` bulk string.
    Bulk(Vec<u8>),
    /// `$-1` nil bulk string or `*-1` nil array.
    Nil,
    /// `*...` array, elements may be arrays themselves.
    Array(Vec<Reply>),
}

impl Reply {
    /// Returns true for the nil bulk string and the nil array.
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Returns the payload of a bulk or status reply.
    pub fn into_bytes(self) -> ConnResult<Vec<u8>> {
        match self {
            Reply::Bulk(data) => Ok(data),
            Reply::Status(text) => Ok(text.into_bytes()),
            other => Err(other.mismatch("bytes")),
        }
    }

    /// Returns a status reply, or a bulk reply decoded as UTF-8.
    pub fn into_string(self) -> ConnResult<String> {
        match self {
            Reply::Status(text) => Ok(text),
            Reply::Bulk(data) => String::from_utf8(data)
                .map_err(|_| ConnError::UnexpectedReply("bulk string is not UTF-8".into())),
            other => Err(other.mismatch("string")),
        }
    }

    /// Returns an integer reply, or a bulk reply holding a decimal integer.
    pub fn as_i64(&self) -> ConnResult<i64> {
        match self {
            Reply::Integer(value) => Ok(*value),
            Reply::Bulk(data) => parse_text(data, "integer"),
            other => Err(other.clone().mismatch("integer")),
        }
    }

    /// Returns a bulk reply parsed as a float. Integer replies widen.
    pub fn as_f64(&self) -> ConnResult<f64> {
        match self {
            Reply::Integer(value) => Ok(*value as f64),
            Reply::Bulk(data) => parse_text(data, "float"),
            other => Err(other.clone().mismatch("float")),
        }
    }

    /// Interprets an integer (or integer-valued bulk) reply as a flag.
    pub fn as_bool(&self) -> ConnResult<bool> {
        self.as_i64().map(|value| value != 0)
    }

    /// Returns the elements of an array reply.
    pub fn into_array(self) -> ConnResult<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            other => Err(other.mismatch("array")),
        }
    }

    /// Returns an array of bulk or status replies as strings.
    ///
    /// Nil elements become empty strings, matching how servers pad
    /// `MGET`-style replies.
    pub fn into_strings(self) -> ConnResult<Vec<String>> {
        self.into_array()?
            .into_iter()
            .map(|item| match item {
                Reply::Nil => Ok(String::new()),
                other => other.into_string(),
            })
            .collect()
    }

    /// Returns a flat `key, value, key, value` array as pairs.
    pub fn into_string_map(self) -> ConnResult<Vec<(String, Vec<u8>)>> {
        let items = self.into_array()?;
        if items.len() % 2 != 0 {
            return Err(ConnError::UnexpectedReply(
                "map reply has an odd number of elements".into(),
            ));
        }

        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            let value = match value {
                Reply::Nil => Vec::new(),
                other => other.into_bytes()?,
            };
            pairs.push((key.into_string()?, value));
        }
        Ok(pairs)
    }

    fn mismatch(self, wanted: &str) -> ConnError {
        match self {
            Reply::Nil => ConnError::Nil,
            Reply::Error(message) => ConnError::Server(message),
            Reply::Status(_) => unexpected("status", wanted),
            Reply::Integer(_) => unexpected("integer", wanted),
            Reply::Bulk(_) => unexpected("bulk", wanted),
            Reply::Array(_) => unexpected("array", wanted),
        }
    }
}

fn unexpected(got: &str, wanted: &str) -> ConnError {
    ConnError::UnexpectedReply(format!("{got} reply, want {wanted}"))
}

fn parse_text<T: std::str::FromStr>(data: &[u8], wanted: &str) -> ConnResult<T> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| ConnError::UnexpectedReply(format!("bulk reply is not a valid {wanted}")))
}
