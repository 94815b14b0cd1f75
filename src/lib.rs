//! ofwire: non-blocking TLS stream transport for OpenFlow control channels.
//!
//! # Overview
//!
//! This crate provides the TLS transport that an OpenFlow control channel
//! plugs into its generic stream framework: an active (`ssl:`) stream that
//! dials out, a passive (`pssl:`) listener that accepts switches, and a
//! process-wide configuration of credentials and peer-verification policy.
//!
//! Everything is non-blocking and single-threaded. Operations that cannot
//! make progress return `WouldBlock` and register interest with the driving
//! poll loop via [`poll::PollSet`]; the hard part of the crate is computing
//! that interest correctly while the TLS engine's read and write primitives
//! may each internally require traffic in *either* socket direction (see
//! [`tls`]).
//!
//! # Core Guarantees
//!
//! - **No deadlock, no livelock**: per-direction want tracking follows the
//!   engine's handshake state machine, so a renegotiation can neither strand
//!   a writer behind a stale read-wait nor spin the poll loop.
//! - **Atomic sends**: a send is accepted in full or not at all; at most one
//!   send is in flight per stream.
//! - **Verified by default**: peers must present a certificate chaining to
//!   the configured CA; the one exception is the explicit trust-on-first-use
//!   bootstrap, which persists the peer's root and then forces a verified
//!   reconnect.
//!
//! # Module Structure
//!
//! - [`stream`]: the byte-stream and acceptor abstractions (`Stream`,
//!   `PassiveStream`) plus scheme-based dispatch
//! - [`tls`]: the TLS transport itself (streams, listener, configuration,
//!   bootstrap)
//! - [`poll`]: one-shot readiness sets bridging streams to the poll loop
//! - [`ratelimit`]: diagnostic throttling

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

mod socket;

pub mod poll;
pub mod ratelimit;
pub mod stream;
pub mod tls;

pub use stream::{open, open_passive, PassiveStream, Stream, WaitType, OFP_SSL_PORT};
pub use tls::{TlsContext, TlsError, TlsListener, TlsStream};
