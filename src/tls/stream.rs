//! Active TLS stream: the per-connection state machine.
//!
//! A stream moves through `TcpConnecting → TlsHandshake → Open → Closed`,
//! never backwards. The interesting machinery is the pair of directional
//! wants, `rx_want` and `tx_want`, which record what the engine's last read
//! and write attempt were blocked on so the wait methods can arm the poll
//! loop correctly; see the field documentation on [`TlsStream`].

use crate::poll::{Interest, PollSet};
use crate::ratelimit::rate_limited;
use crate::socket::{check_connection_completion, inet_open_active};
use crate::stream::{Stream, WaitType, OFP_SSL_PORT};
use crate::tls::bootstrap;
use crate::tls::config::{self, TlsContext};
use crate::tls::error::{
    again, config_unavailable, interpret_ssl_error, proto_error, ssl_rate_limit, Want,
};
use openssl::ssl::{ErrorCode, Ssl, SslStream, SslVerifyMode};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use tracing::error;

/// Connection lifecycle position. Advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// The non-blocking TCP connect has not completed yet.
    TcpConnecting,
    /// TCP is up; the TLS handshake is in progress.
    TlsHandshake,
    /// The handshake completed; encrypted I/O may flow.
    Open,
    /// The connection failed or was rejected; only close remains.
    Closed,
}

/// Which side of the handshake this stream drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Pending transmit data with a head offset: the engine may accept fewer
/// bytes than offered, and retries resume from the first unconsumed byte.
#[derive(Debug)]
struct SendBuf {
    data: Vec<u8>,
    offset: usize,
}

impl SendBuf {
    fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            offset: 0,
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn consume(&mut self, n: usize) {
        self.offset += n;
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }
}

fn want_interest(want: Want) -> Option<Interest> {
    match want {
        Want::Nothing => None,
        Want::Reading => Some(Interest::readable()),
        Want::Writing => Some(Interest::writable()),
    }
}

/// An active TLS connection over a non-blocking TCP socket.
///
/// # The want discipline
///
/// `rx_want` and `tx_want` record the result of the last engine read and
/// write, because there is no way to ask the engine what a data read or
/// write would require without actually attempting one, and a renegotiation
/// means either primitive can need the socket in either direction.
///
/// A single engine call can perform both reading and writing and thus
/// invalidate not just its own want but the other direction's too:
///
/// - A write blocks on a read, so `tx_want` records reading. A later read
///   succeeds and drains the whole receive buffer, recording reading in
///   `rx_want` as well. If the caller now waits on both directions, it
///   sleeps until the peer sends more data even though a write retry would
///   succeed immediately: deadlock.
/// - Clearing the other direction's want on every call fails the other way.
///   A blocked write records `tx_want`; a subsequent blocked read clears it
///   while recording `rx_want`. A caller waiting on both directions wakes
///   instantly because `tx_want` claims no blocking is needed, retries,
///   reblocks, and spins: livelock.
///
/// The rule adopted here is to clear the opposite direction's want only
/// when the engine's handshake state changed across the call, which is
/// evidence that a renegotiation made progress and the stored want is
/// stale. The current direction's want is unconditionally rewritten on
/// every attempt.
pub struct TlsStream {
    name: String,
    session: SslStream<TcpStream>,
    context: TlsContext,
    phase: Phase,
    role: Role,
    rx_want: Want,
    tx_want: Want,
    /// Directional want from the last handshake step, consulted by
    /// `wait(Connect)` after `connect()` reported `WouldBlock`.
    hs_want: Want,
    txbuf: Option<SendBuf>,
    /// True when this session was created in bootstrap mode and therefore
    /// accepted the peer without verification.
    insecure_bootstrap: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
}

impl TlsStream {
    /// Opens an active TLS connection to `suffix` (`host[:port]`, the port
    /// defaulting to the OpenFlow TLS port) using the process-global
    /// configuration.
    pub fn open(suffix: &str) -> io::Result<Self> {
        let context = config::global_handle().map_err(|err| {
            error!(error = %err, "cannot open TLS stream");
            config_unavailable()
        })?;
        Self::open_with(&context, suffix)
    }

    /// Opens an active TLS connection using an explicit configuration
    /// handle.
    pub fn open_with(context: &TlsContext, suffix: &str) -> io::Result<Self> {
        let (tcp, addr, connected) = inet_open_active(suffix, OFP_SSL_PORT)?;
        let phase = if connected {
            Phase::TlsHandshake
        } else {
            Phase::TcpConnecting
        };
        Self::new(
            format!("ssl:{suffix}"),
            context.clone(),
            tcp,
            Role::Client,
            phase,
            addr,
        )
    }

    /// Wraps an established or connecting TCP socket in a TLS session.
    pub(crate) fn new(
        name: String,
        context: TlsContext,
        tcp: TcpStream,
        role: Role,
        phase: Phase,
        peer_addr: SocketAddr,
    ) -> io::Result<Self> {
        let setup = context.session_setup()?;
        let local_addr = tcp.local_addr().ok();
        tcp.set_nodelay(true)?;

        let mut ssl = Ssl::new(&setup.ctx).map_err(|err| {
            error!(stream = %name, error = %err, "failed to create TLS session");
            config_unavailable()
        })?;
        let insecure_bootstrap = setup.bootstrap && role == Role::Client;
        if insecure_bootstrap {
            // The peer's root is not trusted yet; accept anything, capture
            // the chain after the handshake, and kill the connection.
            ssl.set_verify(SslVerifyMode::NONE);
        }
        let session = SslStream::new(ssl, tcp).map_err(|err| {
            error!(stream = %name, error = %err, "failed to bind TLS session to socket");
            config_unavailable()
        })?;

        Ok(Self {
            name,
            session,
            context,
            phase,
            role,
            rx_want: Want::Nothing,
            tx_want: Want::Nothing,
            hs_want: Want::Nothing,
            txbuf: None,
            insecure_bootstrap,
            local_addr,
            peer_addr,
        })
    }

    /// Returns true once the stream reached the open phase.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    /// Returns true once the stream failed or was rejected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    fn fd(&self) -> RawFd {
        self.session.get_ref().as_raw_fd()
    }

    fn do_handshake(&mut self) -> io::Result<()> {
        let function = match self.role {
            Role::Client => "SSL_connect",
            Role::Server => "SSL_accept",
        };
        let result = match self.role {
            Role::Client => self.session.connect(),
            Role::Server => self.session.accept(),
        };
        match result {
            Ok(()) => {
                self.hs_want = Want::Nothing;
                self.finish_handshake()
            }
            Err(err)
                if err.code() == ErrorCode::WANT_READ || err.code() == ErrorCode::WANT_WRITE =>
            {
                let (io_err, want) = interpret_ssl_error(function, &err);
                self.hs_want = want;
                Err(io_err)
            }
            Err(err) => {
                // Diagnostic only; a failed handshake is a protocol error
                // regardless of what the engine reported.
                let _ = interpret_ssl_error(function, &err);
                self.hs_want = Want::Nothing;
                let _ = self.session.get_ref().shutdown(Shutdown::Both);
                self.phase = Phase::Closed;
                Err(proto_error())
            }
        }
    }

    fn finish_handshake(&mut self) -> io::Result<()> {
        if self.insecure_bootstrap {
            self.phase = Phase::Closed;
            if let Some(path) = self.context.bootstrap_pending() {
                return Err(bootstrap::bootstrap_ca_cert(
                    &self.context,
                    &path,
                    self.session.ssl(),
                ));
            }
            // Two or more connections completed while we were in bootstrap
            // mode and another one finished the bootstrap first. This
            // session was accepted without verification, so reject it; the
            // retry will be checked against the bootstrapped CA.
            rate_limited!(
                ssl_rate_limit(),
                error,
                stream = %self.name,
                "rejecting TLS connection that raced a CA bootstrap"
            );
            return Err(proto_error());
        }
        self.phase = Phase::Open;
        Ok(())
    }

    /// Drains `txbuf` until it empties, the engine blocks, or a fatal error.
    fn do_tx(&mut self) -> io::Result<()> {
        loop {
            let old_state = self.session.ssl().state_string();
            let result = match self.txbuf.as_ref() {
                Some(buf) => self.session.ssl_write(buf.remaining()),
                None => return Ok(()),
            };
            if self.session.ssl().state_string() != old_state {
                self.rx_want = Want::Nothing;
            }
            self.tx_want = Want::Nothing;
            match result {
                Ok(n) => {
                    if let Some(buf) = self.txbuf.as_mut() {
                        buf.consume(n);
                        if buf.is_empty() {
                            return Ok(());
                        }
                    }
                }
                Err(err) if err.code() == ErrorCode::ZERO_RETURN => {
                    rate_limited!(ssl_rate_limit(), warn, "SSL_write: connection closed");
                    return Err(io::Error::from_raw_os_error(libc::EPIPE));
                }
                Err(err) => {
                    let (io_err, want) = interpret_ssl_error("SSL_write", &err);
                    self.tx_want = want;
                    return Err(io_err);
                }
            }
        }
    }
}

impl Stream for TlsStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> io::Result<()> {
        match self.phase {
            Phase::TcpConnecting => {
                match check_connection_completion(self.session.get_ref()) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Err(err),
                    Err(err) => {
                        self.phase = Phase::Closed;
                        return Err(err);
                    }
                }
                self.phase = Phase::TlsHandshake;
                self.do_handshake()
            }
            Phase::TlsHandshake => self.do_handshake(),
            Phase::Open => Ok(()),
            Phase::Closed => Err(proto_error()),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        debug_assert!(!buf.is_empty(), "zero-length TLS reads are undefined");

        let old_state = self.session.ssl().state_string();
        let result = self.session.ssl_read(buf);
        // A read that advanced a renegotiation may have unblocked the
        // writer; its stored want is stale in that case.
        if self.session.ssl().state_string() != old_state {
            self.tx_want = Want::Nothing;
        }
        self.rx_want = Want::Nothing;

        match result {
            Ok(n) => Ok(n),
            Err(err) if err.code() == ErrorCode::ZERO_RETURN => Ok(0),
            Err(err) => {
                let (io_err, want) = interpret_ssl_error("SSL_read", &err);
                self.rx_want = want;
                Err(io_err)
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if self.txbuf.is_some() {
            return Err(again());
        }
        if data.is_empty() {
            return Ok(());
        }
        self.txbuf = Some(SendBuf::new(data));
        match self.do_tx() {
            Ok(()) => {
                self.txbuf = None;
                Ok(())
            }
            // The clone is retained; `run()` finishes the transfer in the
            // background and the caller sees the whole send as accepted.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => {
                self.txbuf = None;
                Err(err)
            }
        }
    }

    fn run(&mut self) {
        if self.txbuf.is_some() {
            match self.do_tx() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                _ => self.txbuf = None,
            }
        }
    }

    fn run_wait(&mut self, set: &mut PollSet) {
        if let Some(interest) = want_interest(self.tx_want) {
            set.fd_wait(self.fd(), interest);
        }
    }

    fn wait(&mut self, wait: WaitType, set: &mut PollSet) {
        match wait {
            WaitType::Connect => match self.connect() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => match self.phase {
                    Phase::TcpConnecting => set.fd_wait(self.fd(), Interest::writable()),
                    Phase::TlsHandshake => {
                        // `connect()` just ran the handshake step that
                        // recorded this want.
                        if let Some(interest) = want_interest(self.hs_want) {
                            set.fd_wait(self.fd(), interest);
                        } else {
                            set.immediate_wake();
                        }
                    }
                    Phase::Open | Phase::Closed => set.immediate_wake(),
                },
                _ => set.immediate_wake(),
            },
            WaitType::Recv => {
                if let Some(interest) = want_interest(self.rx_want) {
                    set.fd_wait(self.fd(), interest);
                } else {
                    // Plaintext may already be buffered in the engine, or
                    // the next read will report EOF; either way a read
                    // attempt can make progress now.
                    set.immediate_wake();
                }
            }
            WaitType::Send => {
                if self.txbuf.is_none() {
                    // Room in the tx queue.
                    set.immediate_wake();
                }
                // Otherwise run_wait() arms the drain's direction; no need
                // for redundancy here.
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }
}

impl Drop for TlsStream {
    fn drop(&mut self) {
        self.txbuf = None;
        // One best-effort clean shutdown attempt. It works as long as the
        // kernel send buffer has space and no renegotiation is in flight;
        // there is no way to continue the close in the background.
        let _ = self.session.shutdown();
    }
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("rx_want", &self.rx_want)
            .field("tx_want", &self.tx_want)
            .field("queued_tx", &self.txbuf.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_buf_drains_from_the_head() {
        let mut buf = SendBuf::new(b"abcdef");
        assert_eq!(buf.remaining(), b"abcdef");
        buf.consume(2);
        assert_eq!(buf.remaining(), b"cdef");
        buf.consume(4);
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), b"");
    }

    #[test]
    fn want_maps_to_poll_interest() {
        assert_eq!(want_interest(Want::Nothing), None);
        assert_eq!(want_interest(Want::Reading), Some(Interest::readable()));
        assert_eq!(want_interest(Want::Writing), Some(Interest::writable()));
    }
}
