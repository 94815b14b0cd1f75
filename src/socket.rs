//! Non-blocking TCP socket helpers.
//!
//! Address suffixes follow the control-channel conventions: active targets
//! are `host[:port]`, passive bind points are `[port][:bind-ip]`. All
//! sockets are placed in non-blocking mode before any connect or accept.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

/// Splits an active-connection suffix `host[:port]` into its parts.
pub(crate) fn parse_active(suffix: &str, default_port: u16) -> io::Result<(String, u16)> {
    if suffix.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty connection target",
        ));
    }
    match suffix.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("missing host in {suffix:?}"),
                ));
            }
            let port = port.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad port number in {suffix:?}"),
                )
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((suffix.to_string(), default_port)),
    }
}

/// Splits a passive-bind suffix `[port][:bind-ip]` into a bind address.
pub(crate) fn parse_passive(suffix: &str, default_port: u16) -> io::Result<SocketAddr> {
    let (port_part, ip_part) = match suffix.split_once(':') {
        Some((port, ip)) => (port, Some(ip)),
        None => (suffix, None),
    };
    let port = if port_part.is_empty() {
        default_port
    } else {
        port_part.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad port number in {suffix:?}"),
            )
        })?
    };
    let ip = match ip_part {
        Some(ip) if !ip.is_empty() => ip.parse::<IpAddr>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad bind address in {suffix:?}"),
            )
        })?,
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    Ok(SocketAddr::new(ip, port))
}

fn lookup_one<A: ToSocketAddrs>(addr: A) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "no socket addresses found")
    })
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Resolves `host[:port]` and starts a non-blocking connect.
///
/// Returns the stream, the resolved remote address, and whether the connect
/// completed synchronously (a local or already-reachable target can).
pub(crate) fn inet_open_active(
    suffix: &str,
    default_port: u16,
) -> io::Result<(TcpStream, SocketAddr, bool)> {
    let (host, port) = parse_active(suffix, default_port)?;
    let addr = lookup_one((host.as_str(), port))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    let connected = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(err) if connect_in_progress(&err) => false,
        Err(err) => return Err(err),
    };

    Ok((socket.into(), addr, connected))
}

/// Reports whether a non-blocking connect has completed.
///
/// Any deferred connect error surfaces here; a connect still in flight is
/// `WouldBlock`.
pub(crate) fn check_connection_completion(stream: &TcpStream) -> io::Result<()> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => {
            Err(io::ErrorKind::WouldBlock.into())
        }
        Err(err) => Err(err),
    }
}

/// Binds a non-blocking listener for `[port][:bind-ip]`.
pub(crate) fn inet_open_passive(suffix: &str, default_port: u16) -> io::Result<TcpListener> {
    let addr = parse_passive(suffix, default_port)?;
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
