//! Byte-stream and acceptor abstractions for control channels.
//!
//! A [`Stream`] is a connection-oriented, bidirectional, non-blocking byte
//! stream; a [`PassiveStream`] accepts inbound connections and produces
//! streams. Both are driven by an external single-threaded poll loop: any
//! operation that cannot make progress returns `WouldBlock`, and the caller
//! re-arms interest through the wait methods before blocking on a
//! [`PollSet`].
//!
//! Streams are named `<scheme>:<suffix>`; [`open`] and [`open_passive`]
//! dispatch on the scheme prefix the way the surrounding stream framework
//! does, so a transport plugs in by name.

use crate::poll::PollSet;
use crate::tls::{TlsListener, TlsStream};
use std::io;
use std::net::SocketAddr;

/// Default TCP port for OpenFlow-over-TLS connections.
pub const OFP_SSL_PORT: u16 = 6633;

/// Which readiness condition a caller intends to block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitType {
    /// Wake when `connect()` may be able to make progress.
    Connect,
    /// Wake when `recv()` may be able to make progress.
    Recv,
    /// Wake when `send()` may be able to accept new data.
    Send,
}

/// A connection-oriented, bidirectional, non-blocking byte stream.
///
/// # Contracts
///
/// - [`connect`](Self::connect) is edge-triggered and idempotent: callers
///   invoke it until it returns `Ok` or a hard error; `WouldBlock` means
///   "arm [`wait`](Self::wait) with [`WaitType::Connect`] and retry".
/// - [`recv`](Self::recv) returns `Ok(0)` on peer EOF, never an error.
/// - [`send`](Self::send) accepts the entire buffer atomically: `Ok(())`
///   means every byte will reach the peer (possibly drained in the
///   background by [`run`](Self::run)); `Err(WouldBlock)` means a previous
///   send is still in flight and nothing was consumed.
/// - [`run`](Self::run) performs background maintenance (draining a queued
///   send); [`run_wait`](Self::run_wait) arms whatever that maintenance is
///   blocked on.
/// - Dropping the stream closes it; a clean transport-level shutdown is
///   attempted once, best-effort.
pub trait Stream: std::fmt::Debug {
    /// The stream's name, `<scheme>:<suffix>`.
    fn name(&self) -> &str;

    /// Drives connection establishment one step.
    fn connect(&mut self) -> io::Result<()>;

    /// Receives up to `buf.len()` bytes; `buf` must not be empty.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queues `data` for transmission.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Performs deferred maintenance work.
    fn run(&mut self);

    /// Arms the poll set for whatever [`run`](Self::run) is waiting on.
    fn run_wait(&mut self, set: &mut PollSet);

    /// Arms the poll set for the given readiness condition.
    fn wait(&mut self, wait: WaitType, set: &mut PollSet);

    /// The local address, when the socket is bound.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// The remote address.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// A passive acceptor producing connected [`Stream`]s.
pub trait PassiveStream: std::fmt::Debug {
    /// The listener's name, `<scheme>:<suffix>`.
    fn name(&self) -> &str;

    /// Accepts a pending connection, or `WouldBlock` if none is queued.
    fn accept(&mut self) -> io::Result<Box<dyn Stream>>;

    /// Arms the poll set for incoming connections.
    fn wait(&self, set: &mut PollSet);
}

/// Opens the active stream named `<scheme>:<suffix>`.
///
/// Unknown schemes fail with `EAFNOSUPPORT`, matching the surrounding
/// framework's dispatch behavior.
pub fn open(name: &str) -> io::Result<Box<dyn Stream>> {
    match name.split_once(':') {
        Some(("ssl", suffix)) => Ok(Box::new(TlsStream::open(suffix)?)),
        _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
    }
}

/// Opens the passive stream named `<scheme>:<suffix>`.
pub fn open_passive(name: &str) -> io::Result<Box<dyn PassiveStream>> {
    match name.split_once(':') {
        Some(("pssl", suffix)) => Ok(Box::new(TlsListener::open(suffix)?)),
        _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_schemes_are_rejected() {
        let err = open("tcp:127.0.0.1").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAFNOSUPPORT));
        let err = open("no-colon-at-all").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAFNOSUPPORT));
        let err = open_passive("ptcp:").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAFNOSUPPORT));
    }
}
