//! # HybridKV Connection
//!
//! Purpose: Provide one blocking, pipelined RESP2 connection to a
//! Redis-compatible server. Pools, cluster routing and pub/sub build on top
//! of the [`Connection`] trait defined here.
//!
//! ## Design Principles
//! 1. **Send/Receive Split**: `send` buffers, `flush` writes, `receive` reads
//!    one reply; `do_command` is the three in one step.
//! 2. **Sticky Errors**: The first I/O or protocol failure poisons the
//!    connection; server error replies do not.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ```no_run
//! use hkv_conn::{dial, Connection, Reply};
//!
//! let conn = dial("tcp", "127.0.0.1:6379")?;
//! conn.send("SET", &["k".into(), "v".into()])?;
//! conn.send("GET", &["k".into()])?;
//! conn.flush()?;
//! assert_eq!(conn.receive()?, Reply::Status("OK".into()));
//! assert_eq!(conn.receive()?, Reply::Bulk(b"v".to_vec()));
//! # Ok::<(), hkv_conn::ConnError>(())
//! ```

mod args;
mod conn;
mod dial;
mod error;
mod reply;
mod resp;

pub use args::Arg;
pub use conn::{Conn, Connection, Transport};
pub use dial::{dial, dial_timeout, dial_with_options, DialOptions, NetStream};
pub use error::{ConnError, ConnResult};
pub use reply::Reply;
pub use resp::{read_reply, validate_command, Encoder};
