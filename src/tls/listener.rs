//! Passive TLS listener.

use super::config::{self, TlsContext};
use super::error::{config_unavailable, ssl_rate_limit};
use super::stream::{Phase, Role, TlsStream};
use crate::poll::{Interest, PollSet};
use crate::ratelimit::rate_limited;
use crate::socket::inet_open_passive;
use crate::stream::{PassiveStream, Stream, OFP_SSL_PORT};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use tracing::error;

/// A listening socket producing server-side [`TlsStream`]s.
pub struct TlsListener {
    name: String,
    listener: TcpListener,
    context: TlsContext,
}

impl TlsListener {
    /// Binds a listener for `[port][:bind-ip]` (the port defaulting to the
    /// OpenFlow TLS port) using the process-global configuration.
    pub fn open(suffix: &str) -> io::Result<Self> {
        let context = config::global_handle().map_err(|err| {
            error!(error = %err, "cannot open TLS listener");
            config_unavailable()
        })?;
        Self::open_with(&context, suffix)
    }

    /// Binds a listener using an explicit configuration handle.
    pub fn open_with(context: &TlsContext, suffix: &str) -> io::Result<Self> {
        let listener = inet_open_passive(suffix, OFP_SSL_PORT)?;
        let bound = listener.local_addr()?;
        Ok(Self {
            name: format!("pssl:{}:{}", bound.port(), bound.ip()),
            listener,
            context: context.clone(),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts a pending connection as a server-side TLS stream in the
    /// handshake phase.
    pub fn accept(&mut self) -> io::Result<TlsStream> {
        let (tcp, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if err.kind() != io::ErrorKind::WouldBlock {
                    rate_limited!(ssl_rate_limit(), debug, error = %err, "accept failed");
                }
                return Err(err);
            }
        };
        tcp.set_nonblocking(true)?;

        let name = if peer.port() == OFP_SSL_PORT {
            format!("ssl:{}", peer.ip())
        } else {
            format!("ssl:{}:{}", peer.ip(), peer.port())
        };
        TlsStream::new(
            name,
            self.context.clone(),
            tcp,
            Role::Server,
            Phase::TlsHandshake,
            peer,
        )
    }
}

impl PassiveStream for TlsListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&mut self) -> io::Result<Box<dyn Stream>> {
        TlsListener::accept(self).map(|stream| Box::new(stream) as Box<dyn Stream>)
    }

    fn wait(&self, set: &mut PollSet) {
        set.fd_wait(self.listener.as_raw_fd(), Interest::readable());
    }
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
