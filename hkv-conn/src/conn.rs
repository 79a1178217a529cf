//! # Single Connection
//!
//! Purpose: Own one stream to the server and expose send/flush/receive so
//! callers can pipeline requests, plus `do_command` for the common
//! one-request-one-reply case.
//!
//! ## Design Principles
//! 1. **Sticky Failure**: The first I/O, protocol or close error is recorded
//!    once and returned by every later call without touching the stream.
//! 2. **Split Halves**: Reader and writer sit behind separate locks so a
//!    pipeline can keep writing while another call is blocked reading, and
//!    `close` never waits on either.
//! 3. **Buffer Reuse**: Line and number scratch buffers live with the halves.
//! 4. **Caller-Ordered Pipelining**: Replies come back in send order; the
//!    connection counts them but does not queue on the caller's behalf.

use std::io::{self, BufReader, BufWriter, Read, Write};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::args::Arg;
use crate::dial::DialOptions;
use crate::error::{ConnError, ConnResult};
use crate::reply::Reply;
use crate::resp::{read_reply, validate_command, Encoder};

/// Byte stream a connection can run over.
///
/// Implemented for TCP and Unix sockets; tests and alternate transports
/// provide their own.
pub trait Transport: Read + Write + Send + Sized {
    /// Returns another handle to the same underlying stream.
    fn try_clone(&self) -> io::Result<Self>;

    /// Shuts down both directions, waking any handle blocked in I/O.
    fn shutdown(&self) -> io::Result<()>;
}

/// Operations every connection offers.
///
/// `do_command` is a complete unit on its own. `send`, `flush` and
/// `receive` compose into a pipeline: N sends, one flush, N receives, with
/// replies returned in send order.
pub trait Connection {
    /// Closes the connection. Later calls fail with the sticky error.
    fn close(&self) -> ConnResult<()>;

    /// Returns the sticky error, or `None` while the connection is healthy.
    fn err(&self) -> Option<ConnError>;

    /// Sends a command, flushes, and returns its reply.
    fn do_command(&self, name: &str, args: &[Arg<'_>]) -> ConnResult<Reply>;

    /// Buffers a command without flushing it.
    fn send(&self, name: &str, args: &[Arg<'_>]) -> ConnResult<()>;

    /// Writes buffered commands to the stream.
    fn flush(&self) -> ConnResult<()>;

    /// Reads the next reply.
    fn receive(&self) -> ConnResult<Reply>;
}

struct ReadHalf<T: Transport> {
    reader: BufReader<T>,
    line_buf: Vec<u8>,
}

struct WriteHalf<T: Transport> {
    writer: BufWriter<T>,
    encoder: Encoder,
}

#[derive(Default)]
struct ConnState {
    pending: usize,
    err: Option<ConnError>,
}

/// A connection over a [`Transport`].
pub struct Conn<T: Transport> {
    read: Mutex<ReadHalf<T>>,
    write: Mutex<WriteHalf<T>>,
    control: T,
    state: Mutex<ConnState>,
    max_pending: Option<usize>,
}

impl<T: Transport> Conn<T> {
    /// Wraps an established stream.
    ///
    /// Timeouts in `options` are not applied here; they belong to the
    /// transport and are set by the dial functions.
    pub fn new(stream: T, options: &DialOptions) -> ConnResult<Self> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Conn {
            read: Mutex::new(ReadHalf {
                reader: BufReader::with_capacity(options.read_buffer_size, reader),
                line_buf: Vec::with_capacity(128),
            }),
            write: Mutex::new(WriteHalf {
                writer: BufWriter::with_capacity(options.write_buffer_size, stream),
                encoder: Encoder::new(),
            }),
            control,
            state: Mutex::new(ConnState::default()),
            max_pending: options.max_pending,
        })
    }

    /// Number of commands sent whose replies have not been received.
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// True when no reply is outstanding.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    fn check(&self) -> ConnResult<()> {
        match &self.state.lock().err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Records `err` as sticky unless an earlier error already is, shuts the
    /// stream down, and returns the sticky error.
    fn fatal(&self, err: ConnError) -> ConnError {
        let mut state = self.state.lock();
        if let Some(existing) = &state.err {
            return existing.clone();
        }
        warn!(error = %err, "connection failed");
        state.err = Some(err.clone());
        drop(state);

        // Ignore shutdown failures: the stream is already unusable.
        let _ = self.control.shutdown();
        err
    }

    /// Reads one reply, making I/O and protocol failures sticky.
    fn read_one(&self, half: &mut ReadHalf<T>) -> ConnResult<Reply> {
        let ReadHalf { reader, line_buf } = half;
        read_reply(reader, line_buf).map_err(|err| self.fatal(err))
    }

    fn write_command(
        &self,
        half: &mut WriteHalf<T>,
        name: &str,
        args: &[Arg<'_>],
    ) -> ConnResult<()> {
        let WriteHalf { writer, encoder } = half;
        encoder
            .encode_command(writer, name, args)
            .map_err(|err| self.fatal(err.into()))?;
        trace!(command = name, args = args.len(), "command buffered");
        Ok(())
    }

    fn flush_writer(&self, half: &mut WriteHalf<T>) -> ConnResult<()> {
        half.writer.flush().map_err(|err| self.fatal(err.into()))?;
        trace!("write buffer flushed");
        Ok(())
    }

    fn drain_pending(&self, read: &mut ReadHalf<T>, pending: usize) -> ConnResult<Reply> {
        let mut replies = Vec::with_capacity(pending);
        for _ in 0..pending {
            replies.push(self.read_one(read)?);
        }
        Ok(Reply::Array(replies))
    }
}

impl<T: Transport> Connection for Conn<T> {
    fn close(&self) -> ConnResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        state.err = Some(ConnError::Closed);
        drop(state);

        debug!("closing connection");
        match self.control.shutdown() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn err(&self) -> Option<ConnError> {
        self.state.lock().err.clone()
    }

    fn do_command(&self, name: &str, args: &[Arg<'_>]) -> ConnResult<Reply> {
        let mut write = self.write.lock();
        let mut read = self.read.lock();
        self.check()?;
        if !name.is_empty() {
            validate_command(name, args)?;
        }

        let pending = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending)
        };

        if name.is_empty() {
            if pending == 0 {
                return Ok(Reply::Nil);
            }
            self.flush_writer(&mut write)?;
            drop(write);
            return self.drain_pending(&mut read, pending);
        }

        self.write_command(&mut write, name, args)?;
        self.flush_writer(&mut write)?;
        drop(write);

        // Replies to earlier pipelined sends arrive first; the last one is ours.
        let mut server_err = None;
        let mut reply = Reply::Nil;
        for _ in 0..=pending {
            reply = self.read_one(&mut read)?;
            if let Reply::Error(message) = &reply {
                server_err.get_or_insert_with(|| message.clone());
            }
        }
        trace!(command = name, drained = pending, "reply received");

        match server_err {
            Some(message) => Err(ConnError::Server(message)),
            None => Ok(reply),
        }
    }

    fn send(&self, name: &str, args: &[Arg<'_>]) -> ConnResult<()> {
        let mut write = self.write.lock();
        self.check()?;
        if let Some(max) = self.max_pending {
            if self.pending() >= max {
                return Err(ConnError::PipelineFull(max));
            }
        }
        validate_command(name, args)?;

        self.write_command(&mut write, name, args)?;
        self.state.lock().pending += 1;
        Ok(())
    }

    fn flush(&self) -> ConnResult<()> {
        let mut write = self.write.lock();
        self.check()?;
        self.flush_writer(&mut write)
    }

    fn receive(&self) -> ConnResult<Reply> {
        let mut read = self.read.lock();

        // Every receive settles one pending command, even when it fails early.
        let result = self.check().and_then(|()| self.read_one(&mut read));
        {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
        }

        match result? {
            Reply::Error(message) => Err(ConnError::Server(message)),
            reply => {
                trace!("reply received");
                Ok(reply)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory transport: replies are scripted up front, writes are
    /// captured and counted.
    #[derive(Clone, Default)]
    struct MemStream {
        input: Arc<parking_lot::Mutex<VecDeque<u8>>>,
        output: Arc<parking_lot::Mutex<Vec<u8>>>,
        writes: Arc<AtomicUsize>,
        reads: Arc<AtomicUsize>,
        shut: Arc<AtomicBool>,
        broken: Arc<AtomicBool>,
    }

    impl MemStream {
        fn with_replies(replies: &[u8]) -> Self {
            let stream = MemStream::default();
            stream.input.lock().extend(replies.iter().copied());
            stream
        }

        fn written(&self) -> Vec<u8> {
            self.output.lock().clone()
        }

        fn io_counts(&self) -> (usize, usize) {
            (self.writes.load(Ordering::SeqCst), self.reads.load(Ordering::SeqCst))
        }
    }

    impl Read for MemStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.shut.load(Ordering::SeqCst) {
                return Ok(0);
            }
            let mut input = self.input.lock();
            let n = buf.len().min(input.len());
            for (slot, byte) in buf.iter_mut().zip(input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MemStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.shut.load(Ordering::SeqCst) || self.broken.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.output.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MemStream {
        fn try_clone(&self) -> io::Result<Self> {
            Ok(self.clone())
        }

        fn shutdown(&self) -> io::Result<()> {
            self.shut.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn conn(replies: &[u8]) -> (Conn<MemStream>, MemStream) {
        let stream = MemStream::with_replies(replies);
        let conn = Conn::new(stream.clone(), &DialOptions::default()).unwrap();
        (conn, stream)
    }

    #[test]
    fn do_command_writes_request_and_returns_reply() {
        let (conn, stream) = conn(b"+OK\r\n$1\r\nv\r\n");
        assert_eq!(
            conn.do_command("SET", &["k".into(), "v".into()]).unwrap(),
            Reply::Status("OK".into())
        );
        assert_eq!(conn.do_command("GET", &["k".into()]).unwrap(), Reply::Bulk(b"v".to_vec()));
        assert_eq!(
            stream.written(),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec()
        );
        assert!(conn.is_idle());
    }

    #[test]
    fn send_buffers_until_flush() {
        let (conn, stream) = conn(b":1\r\n:2\r\n");
        conn.send("INCR", &["a".into()]).unwrap();
        conn.send("INCR", &["b".into()]).unwrap();
        assert!(stream.written().is_empty());
        assert_eq!(conn.pending(), 2);

        conn.flush().unwrap();
        assert!(!stream.written().is_empty());
        assert_eq!(conn.receive().unwrap(), Reply::Integer(1));
        assert_eq!(conn.receive().unwrap(), Reply::Integer(2));
        assert!(conn.is_idle());
    }

    #[test]
    fn server_error_is_not_sticky() {
        let (conn, _stream) = conn(b"-ERR wrong number of arguments\r\n+PONG\r\n");
        let err = conn.do_command("GET", &[]).unwrap_err();
        assert!(matches!(err, ConnError::Server(ref msg) if msg.starts_with("ERR wrong")));
        assert!(conn.err().is_none());
        assert_eq!(conn.do_command("PING", &[]).unwrap(), Reply::Status("PONG".into()));
    }

    #[test]
    fn encode_error_is_not_sticky_and_writes_nothing() {
        let (conn, stream) = conn(b"+OK\r\n");
        assert!(matches!(
            conn.send("SET", &["k".into(), f64::NAN.into()]),
            Err(ConnError::Encode(_))
        ));
        assert!(matches!(conn.send("", &[]), Err(ConnError::Encode(_))));
        assert_eq!(conn.pending(), 0);
        assert!(conn.err().is_none());

        conn.flush().unwrap();
        assert!(stream.written().is_empty());
        assert_eq!(conn.do_command("PING", &[]).unwrap(), Reply::Status("OK".into()));
    }

    #[test]
    fn protocol_error_is_sticky_without_further_io() {
        let (conn, stream) = conn(b"?garbage\r\n+OK\r\n");
        let first = conn.do_command("PING", &[]).unwrap_err();
        assert!(matches!(first, ConnError::Protocol(_)));
        assert!(matches!(conn.err(), Some(ConnError::Protocol(_))));

        let writes = stream.writes.load(Ordering::SeqCst);
        let reads = stream.reads.load(Ordering::SeqCst);
        for err in [
            conn.do_command("PING", &[]).unwrap_err(),
            conn.send("PING", &[]).unwrap_err(),
            conn.flush().unwrap_err(),
            conn.receive().unwrap_err(),
        ] {
            assert_eq!(err.to_string(), first.to_string());
        }
        assert_eq!(stream.writes.load(Ordering::SeqCst), writes);
        assert_eq!(stream.reads.load(Ordering::SeqCst), reads);
        assert!(stream.shut.load(Ordering::SeqCst));
    }

    #[test]
    fn receive_decrements_pending_on_error() {
        let (conn, _stream) = conn(b"");
        conn.send("PING", &[]).unwrap();
        conn.flush().unwrap();
        assert!(matches!(conn.receive(), Err(ConnError::Io(_))));
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn do_command_drains_earlier_pipelined_replies() {
        let (conn, _stream) = conn(b"+OK\r\n:5\r\n$3\r\nbar\r\n");
        conn.send("SET", &["a".into(), "1".into()]).unwrap();
        conn.send("INCRBY", &["b".into(), 5.into()]).unwrap();
        assert_eq!(conn.do_command("GET", &["c".into()]).unwrap(), Reply::Bulk(b"bar".to_vec()));
        assert!(conn.is_idle());
    }

    #[test]
    fn do_command_reports_first_drained_server_error() {
        let (conn, _stream) = conn(b"-WRONGTYPE first\r\n+OK\r\n");
        conn.send("INCR", &["list".into()]).unwrap();
        let err = conn.do_command("SET", &["a".into(), "b".into()]).unwrap_err();
        assert!(matches!(err, ConnError::Server(msg) if msg == "WRONGTYPE first"));
        assert!(conn.err().is_none());
        assert!(conn.is_idle());
    }

    #[test]
    fn empty_do_command_flushes_and_collects_pending() {
        let (conn, stream) = conn(b"+OK\r\n-ERR no\r\n");
        assert_eq!(conn.do_command("", &[]).unwrap(), Reply::Nil);
        assert_eq!(stream.writes.load(Ordering::SeqCst), 0);

        conn.send("SET", &["a".into(), "b".into()]).unwrap();
        conn.send("BAD", &[]).unwrap();
        assert_eq!(
            conn.do_command("", &[]).unwrap(),
            Reply::Array(vec![Reply::Status("OK".into()), Reply::Error("ERR no".into())])
        );
        assert!(conn.is_idle());
    }

    #[test]
    fn max_pending_bounds_the_pipeline() {
        let stream = MemStream::with_replies(b"+OK\r\n");
        let options = DialOptions {
            max_pending: Some(1),
            ..DialOptions::default()
        };
        let conn = Conn::new(stream, &options).unwrap();
        conn.send("PING", &[]).unwrap();
        assert!(matches!(conn.send("PING", &[]), Err(ConnError::PipelineFull(1))));
        assert!(conn.err().is_none());

        conn.flush().unwrap();
        conn.receive().unwrap();
        conn.send("PING", &[]).unwrap();
    }

    #[test]
    fn close_is_sticky_and_repeatable() {
        let (conn, stream) = conn(b"+OK\r\n");
        conn.close().unwrap();
        assert!(stream.shut.load(Ordering::SeqCst));
        assert!(matches!(conn.err(), Some(ConnError::Closed)));
        assert!(matches!(conn.do_command("PING", &[]), Err(ConnError::Closed)));
        assert!(matches!(conn.send("PING", &[]), Err(ConnError::Closed)));
        assert!(matches!(conn.flush(), Err(ConnError::Closed)));
        assert!(matches!(conn.receive(), Err(ConnError::Closed)));
        assert!(matches!(conn.close(), Err(ConnError::Closed)));
    }

    fn assert_broken_pipe(err: &ConnError) {
        match err {
            ConnError::Io(io_err) => assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn flush_failure_is_sticky_without_further_io() {
        let (conn, stream) = conn(b"+OK\r\n");
        stream.broken.store(true, Ordering::SeqCst);

        conn.send("PING", &[]).unwrap();
        let first = conn.flush().unwrap_err();
        assert_broken_pipe(&first);
        assert_broken_pipe(&conn.err().unwrap());
        assert!(stream.shut.load(Ordering::SeqCst));

        let counts = stream.io_counts();
        for err in [
            conn.send("PING", &[]).unwrap_err(),
            conn.flush().unwrap_err(),
            conn.receive().unwrap_err(),
            conn.do_command("PING", &[]).unwrap_err(),
        ] {
            assert_broken_pipe(&err);
            assert_eq!(err.to_string(), first.to_string());
        }
        assert_eq!(stream.io_counts(), counts);
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn do_command_write_failure_is_sticky() {
        let (conn, stream) = conn(b"+OK\r\n");
        stream.broken.store(true, Ordering::SeqCst);

        let first = conn.do_command("SET", &["k".into(), "v".into()]).unwrap_err();
        assert_broken_pipe(&first);
        assert_broken_pipe(&conn.err().unwrap());
        assert_eq!(stream.reads.load(Ordering::SeqCst), 0);

        let counts = stream.io_counts();
        for err in [
            conn.do_command("GET", &["k".into()]).unwrap_err(),
            conn.send("GET", &["k".into()]).unwrap_err(),
            conn.receive().unwrap_err(),
        ] {
            assert_eq!(err.to_string(), first.to_string());
        }
        assert_eq!(stream.io_counts(), counts);
    }

    #[test]
    fn receive_on_poisoned_connection_still_settles_pending() {
        let (conn, _stream) = conn(b"+OK\r\n");
        conn.send("PING", &[]).unwrap();
        conn.send("PING", &[]).unwrap();
        conn.close().unwrap();

        assert!(matches!(conn.receive(), Err(ConnError::Closed)));
        assert_eq!(conn.pending(), 1);
        assert!(matches!(conn.receive(), Err(ConnError::Closed)));
        assert!(conn.is_idle());
    }

    #[test]
    fn connection_trait_is_object_safe() {
        let (conn, _stream) = conn(b":1\r\n");
        let boxed: Box<dyn Connection> = Box::new(conn);
        assert_eq!(boxed.do_command("EXISTS", &["k".into()]).unwrap(), Reply::Integer(1));
    }
}
