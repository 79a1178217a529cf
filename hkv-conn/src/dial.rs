//! # Dialing
//!
//! Purpose: Establish the stream a [`Conn`] runs over and apply per-operation
//! timeouts before any request is sent.
//!
//! ## Design Principles
//! 1. **Builder-Free Options**: A plain `DialOptions` struct with `Default`,
//!    deserializable so callers can embed it in their own config files.
//! 2. **Per-Operation Deadlines**: Read/write timeouts are socket options, so
//!    each read or write gets the full budget.
//! 3. **Fail Fast**: Dial errors are returned as-is; no retry, no fallback.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::conn::{Conn, Transport};
use crate::error::{ConnError, ConnResult};

/// Options applied when establishing a connection.
///
/// A zero duration is treated as "no timeout".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// Timeout for establishing a TCP connection, per resolved address.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    /// Timeout for each socket read.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
    /// Timeout for each socket write.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on TCP sockets.
    pub nodelay: bool,
    /// Capacity of the buffered reader.
    pub read_buffer_size: usize,
    /// Capacity of the buffered writer.
    pub write_buffer_size: usize,
    /// Maximum commands sent but not yet received. `None` is unbounded.
    pub max_pending: Option<usize>,
}

impl Default for DialOptions {
    fn default() -> Self {
        DialOptions {
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            nodelay: true,
            read_buffer_size: 8 * 1024,
            write_buffer_size: 8 * 1024,
            max_pending: None,
        }
    }
}

/// Stream produced by the dial functions.
pub enum NetStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl NetStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            NetStream::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            NetStream::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.flush(),
        }
    }
}

impl Transport for NetStream {
    fn try_clone(&self) -> io::Result<Self> {
        match self {
            NetStream::Tcp(stream) => stream.try_clone().map(NetStream::Tcp),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.try_clone().map(NetStream::Unix),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            NetStream::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            NetStream::Unix(stream) => stream.shutdown(std::net::Shutdown::Both),
        }
    }
}

/// Connects with default options.
///
/// `network` is `tcp`, `tcp4`, `tcp6` or (on Unix) `unix`.
pub fn dial(network: &str, address: &str) -> ConnResult<Conn<NetStream>> {
    dial_with_options(network, address, &DialOptions::default())
}

/// Connects with explicit connect, read and write timeouts.
pub fn dial_timeout(
    network: &str,
    address: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
) -> ConnResult<Conn<NetStream>> {
    let options = DialOptions {
        connect_timeout: Some(connect_timeout),
        read_timeout: Some(read_timeout),
        write_timeout: Some(write_timeout),
        ..DialOptions::default()
    };
    dial_with_options(network, address, &options)
}

/// Connects using `options`.
pub fn dial_with_options(
    network: &str,
    address: &str,
    options: &DialOptions,
) -> ConnResult<Conn<NetStream>> {
    let dial_err = |source: io::Error| ConnError::Dial {
        network: network.to_string(),
        address: address.to_string(),
        source: Arc::new(source),
    };

    let stream = match network {
        "tcp" | "tcp4" | "tcp6" => connect_tcp(network, address, options),
        #[cfg(unix)]
        "unix" => UnixStream::connect(address).map(NetStream::Unix),
        other => return Err(ConnError::UnsupportedNetwork(other.to_string())),
    }
    .map_err(dial_err)?;

    stream
        .set_read_timeout(non_zero(options.read_timeout))
        .and_then(|_| stream.set_write_timeout(non_zero(options.write_timeout)))
        .map_err(dial_err)?;

    debug!(network, address, "connected");
    Conn::new(stream, options)
}

fn connect_tcp(network: &str, address: &str, options: &DialOptions) -> io::Result<NetStream> {
    let mut last_err = None;
    for addr in address.to_socket_addrs()? {
        let wanted = match network {
            "tcp4" => addr.is_ipv4(),
            "tcp6" => addr.is_ipv6(),
            _ => true,
        };
        if !wanted {
            continue;
        }

        let attempt = match non_zero(options.connect_timeout) {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(options.nodelay)?;
                return Ok(NetStream::Tcp(stream));
            }
            Err(err) => {
                debug!(%addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {network} address for {address}"),
        )
    }))
}

fn non_zero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|timeout| !timeout.is_zero())
}
