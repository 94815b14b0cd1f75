//! TLS transport: active streams, passive listeners, process-wide
//! configuration, and trust-on-first-use CA bootstrap.
//!
//! The transport drives an engine whose non-blocking read and write
//! primitives can each internally require traffic in either socket
//! direction (renegotiation), so every data-path operation maintains
//! per-direction wants used by the wait computation; the discipline is
//! documented on [`TlsStream`].
//!
//! Configuration is process-wide by default: a private key, a certificate
//! chain, and a CA for peer verification, set through the free functions in
//! this module. Peers are verified and required to present a certificate.
//! When no CA is available yet, [`set_ca_cert_file`] with `bootstrap` set
//! arranges for the first connection to capture, verify, and persist the
//! peer's root instead.
//!
//! # Client Example
//!
//! ```ignore
//! use ofwire::stream::{Stream, WaitType};
//! use ofwire::poll::PollSet;
//!
//! ofwire::tls::set_private_key_file("sc-privkey.pem")?;
//! ofwire::tls::set_certificate_file("sc-cert.pem")?;
//! ofwire::tls::set_ca_cert_file("cacert.pem", false)?;
//!
//! let mut stream = ofwire::stream::open("ssl:10.0.0.2:6633")?;
//! let mut set = PollSet::new();
//! loop {
//!     match stream.connect() {
//!         Ok(()) => break,
//!         Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
//!             stream.wait(WaitType::Connect, &mut set);
//!             set.block(None)?;
//!         }
//!         Err(err) => return Err(err.into()),
//!     }
//! }
//! ```

mod bootstrap;
mod certs;
mod config;
mod error;
mod listener;
mod stream;

pub use config::{
    init, is_configured, set_ca_cert_file, set_certificate_file, set_peer_ca_cert_file,
    set_private_key_file, TlsContext,
};
pub use error::TlsError;
pub use listener::TlsListener;
pub use stream::TlsStream;
