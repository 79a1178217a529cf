//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode requests and parse replies for one connection, keeping
//! allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Scratch buffers for numbers and lines live with the
//!    connection, not the call.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::io::{self, BufRead, Read, Write};

use crate::args::Arg;
use crate::error::{ConnError, ConnResult};
use crate::reply::Reply;

const CRLF: &[u8] = b"\r\n";

// Upper bound on speculative allocation from a peer-declared length.
const MAX_PREALLOC: usize = 64 * 1024;

/// Longest status, error, integer or length line accepted, CRLF included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Deepest array nesting accepted. `Reply` drops recursively, so the cap
/// also bounds the stack used when a reply is released.
pub const MAX_DEPTH: usize = 512;

/// Request encoder with reusable number formatting buffers.
///
/// Each request is written as an array of bulk strings whose first element
/// is the command name, so the encoder needs no knowledge of any command.
pub struct Encoder {
    lens: itoa::Buffer,
    ints: itoa::Buffer,
    floats: ryu::Buffer,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            lens: itoa::Buffer::new(),
            ints: itoa::Buffer::new(),
            floats: ryu::Buffer::new(),
        }
    }

    /// Writes `name` and `args` as one request frame.
    ///
    /// Callers run [`validate_command`] first: this only fails when `out`
    /// does, and a failure may leave a partial frame behind.
    pub fn encode_command<W: Write>(
        &mut self,
        out: &mut W,
        name: &str,
        args: &[Arg<'_>],
    ) -> io::Result<()> {
        write_header(out, &mut self.lens, b'*', args.len() + 1)?;
        write_bulk(out, &mut self.lens, name.as_bytes())?;

        for arg in args {
            match *arg {
                Arg::Bytes(data) => write_bulk(out, &mut self.lens, data)?,
                Arg::Int(value) => {
                    let text = self.ints.format(value);
                    write_bulk(out, &mut self.lens, text.as_bytes())?;
                }
                Arg::UInt(value) => {
                    let text = self.ints.format(value);
                    write_bulk(out, &mut self.lens, text.as_bytes())?;
                }
                Arg::Float(value) => {
                    let text = if value.is_infinite() {
                        if value > 0.0 { "inf" } else { "-inf" }
                    } else {
                        self.floats.format_finite(value)
                    };
                    write_bulk(out, &mut self.lens, text.as_bytes())?;
                }
                Arg::Bool(value) => {
                    write_bulk(out, &mut self.lens, if value { b"1" } else { b"0" })?
                }
            }
        }
        Ok(())
    }
}

/// Rejects requests that have no wire form, before any byte is buffered.
pub fn validate_command(name: &str, args: &[Arg<'_>]) -> ConnResult<()> {
    if name.is_empty() {
        return Err(ConnError::Encode("empty command name".into()));
    }
    for (idx, arg) in args.iter().enumerate() {
        if let Arg::Float(value) = arg {
            if value.is_nan() {
                return Err(ConnError::Encode(format!("argument {idx} is NaN")));
            }
        }
    }
    Ok(())
}

fn write_header<W: Write>(
    out: &mut W,
    lens: &mut itoa::Buffer,
    tag: u8,
    len: usize,
) -> io::Result<()> {
    out.write_all(&[tag])?;
    out.write_all(lens.format(len).as_bytes())?;
    out.write_all(CRLF)
}

fn write_bulk<W: Write>(out: &mut W, lens: &mut itoa::Buffer, data: &[u8]) -> io::Result<()> {
    write_header(out, lens, b'$', data.len())?;
    out.write_all(data)?;
    out.write_all(CRLF)
}

/// Reads one reply from the buffered reader.
///
/// A top-level `-` frame comes back as [`Reply::Error`]; deciding whether it
/// is a failure is left to the caller. Arrays are assembled on an explicit
/// work stack, so nesting never grows the native stack.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ConnResult<Reply> {
    // Arrays still being filled, with the number of elements they lack.
    let mut open: Vec<(Vec<Reply>, usize)> = Vec::new();

    'frames: loop {
        let mut value = match read_frame(reader, line_buf)? {
            Frame::Value(value) => value,
            Frame::Array(0) => Reply::Array(Vec::new()),
            Frame::Array(len) => {
                if open.len() >= MAX_DEPTH {
                    return Err(ConnError::protocol(format!(
                        "array nesting exceeds {MAX_DEPTH} levels"
                    )));
                }
                open.push((Vec::with_capacity(len.min(MAX_PREALLOC)), len));
                continue;
            }
        };

        // Hand the finished value to its parent, closing every array it completes.
        while let Some((mut items, missing)) = open.pop() {
            items.push(value);
            if missing > 1 {
                open.push((items, missing - 1));
                continue 'frames;
            }
            value = Reply::Array(items);
        }
        return Ok(value);
    }
}

enum Frame {
    Value(Reply),
    Array(usize),
}

/// Reads one frame header, plus the payload for everything but arrays.
fn read_frame<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ConnResult<Frame> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ConnError::protocol("empty reply line"));
    }

    let value = match line_buf[0] {
        b'+' => Reply::Status(line_text(&line_buf[1..])?),
        b'-' => Reply::Error(line_text(&line_buf[1..])?),
        b':' => Reply::Integer(parse_i64(&line_buf[1..])?),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            read_bulk(reader, len)?
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            if len == -1 {
                return Ok(Frame::Value(Reply::Nil));
            }
            let len = usize::try_from(len)
                .map_err(|_| ConnError::protocol(format!("invalid array length {len}")))?;
            return Ok(Frame::Array(len));
        }
        tag => {
            return Err(ConnError::protocol(format!(
                "unexpected reply type byte {tag:#04x}"
            )))
        }
    };
    Ok(Frame::Value(value))
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> ConnResult<Reply> {
    if len == -1 {
        return Ok(Reply::Nil);
    }
    let len = usize::try_from(len)
        .map_err(|_| ConnError::protocol(format!("invalid bulk length {len}")))?;

    let mut data = Vec::with_capacity(len.min(MAX_PREALLOC));
    (&mut *reader).take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != *b"\r\n" {
        return Err(ConnError::protocol("bulk string not terminated by CRLF"));
    }
    Ok(Reply::Bulk(data))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ConnResult<()> {
    buf.clear();
    let bytes = (&mut *reader).take(MAX_LINE_LEN as u64).read_until(b'\n', buf)?;
    if buf.last() != Some(&b'\n') {
        if bytes == MAX_LINE_LEN {
            return Err(ConnError::protocol(format!(
                "reply line longer than {MAX_LINE_LEN} bytes"
            )));
        }
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    if !buf.ends_with(CRLF) {
        return Err(ConnError::protocol("reply line not terminated by CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn line_text(data: &[u8]) -> ConnResult<String> {
    String::from_utf8(data.to_vec()).map_err(|_| ConnError::protocol("reply line is not UTF-8"))
}

fn parse_i64(data: &[u8]) -> ConnResult<i64> {
    let invalid = || {
        ConnError::protocol(format!("invalid integer {:?}", String::from_utf8_lossy(data)))
    };

    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(invalid());
    }

    // Accumulate toward the sign so i64::MIN parses without overflow.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(invalid());
        }
        let digit = (b - b'0') as i64;
        value = value.checked_mul(10).ok_or_else(invalid)?;
        value = if negative {
            value.checked_sub(digit)
        } else {
            value.checked_add(digit)
        }
        .ok_or_else(invalid)?;
    }
    Ok(value)
}
