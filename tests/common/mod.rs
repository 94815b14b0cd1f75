#![allow(dead_code)]
//! Shared integration test utilities: throwaway certificate authorities on
//! disk and poll-loop pumps that drive both ends of a connection from one
//! thread.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use ofwire::poll::PollSet;
use ofwire::stream::{Stream, WaitType};
use ofwire::tls::{TlsListener, TlsStream};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509NameRef, X509};
use std::io;
use std::path::PathBuf;
use std::sync::Once;
use std::time::{Duration, Instant};
use tempfile::TempDir;

static INIT_LOGGING: Once = Once::new();

/// Initializes test logging once per process; controlled by `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// How long the pumps drive a handshake or transfer before declaring the
/// test stuck.
pub const PUMP_TIMEOUT: Duration = Duration::from_secs(10);

fn new_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).expect("RSA key generation")).expect("PKey wrap")
}

fn name(cn: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().expect("name builder");
    builder.append_entry_by_text("CN", cn).expect("CN entry");
    builder.build()
}

fn base_cert(subject: &X509NameRef, issuer: &X509NameRef, key: &PKey<Private>) -> X509Builder {
    let mut builder = X509::builder().expect("X509 builder");
    builder.set_version(2).expect("version");
    builder.set_subject_name(subject).expect("subject");
    builder.set_issuer_name(issuer).expect("issuer");
    builder.set_pubkey(key).expect("pubkey");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not-before"))
        .expect("set not-before");
    builder
        .set_not_after(&Asn1Time::days_from_now(30).expect("not-after"))
        .expect("set not-after");
    let mut serial = BigNum::new().expect("serial");
    serial
        .rand(64, MsbOption::MAYBE_ZERO, false)
        .expect("serial rand");
    builder
        .set_serial_number(&serial.to_asn1_integer().expect("serial asn1"))
        .expect("set serial");
    builder
}

/// Mints a self-signed CA certificate.
pub fn make_ca(cn: &str) -> (PKey<Private>, X509) {
    let key = new_key();
    let subject = name(cn);
    let mut builder = base_cert(&subject, &subject, &key);
    builder
        .append_extension(
            BasicConstraints::new()
                .critical()
                .ca()
                .build()
                .expect("basic constraints"),
        )
        .expect("append extension");
    builder.sign(&key, MessageDigest::sha256()).expect("sign");
    (key, builder.build())
}

/// Mints a leaf certificate signed by `ca`.
pub fn make_leaf(cn: &str, ca_key: &PKey<Private>, ca: &X509) -> (PKey<Private>, X509) {
    let key = new_key();
    let subject = name(cn);
    let mut builder = base_cert(&subject, ca.subject_name(), &key);
    builder.sign(ca_key, MessageDigest::sha256()).expect("sign");
    (key, builder.build())
}

/// On-disk PEM material for one CA plus a server and a client identity.
pub struct Material {
    pub dir: TempDir,
    pub ca_cert: PathBuf,
    pub server_key: PathBuf,
    pub server_cert: PathBuf,
    pub client_key: PathBuf,
    pub client_cert: PathBuf,
}

/// Mints a CA and two leaf identities and writes them all as PEM files.
pub fn mint_material() -> Material {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ca_key, ca) = make_ca("ofwire-test-ca");
    let (server_key, server_cert) = make_leaf("ofwire-test-server", &ca_key, &ca);
    let (client_key, client_cert) = make_leaf("ofwire-test-client", &ca_key, &ca);

    let write = |file: &str, bytes: Vec<u8>| {
        let path = dir.path().join(file);
        std::fs::write(&path, bytes).expect("write PEM");
        path
    };

    Material {
        ca_cert: write("cacert.pem", ca.to_pem().expect("CA PEM")),
        server_key: write(
            "server-key.pem",
            server_key
                .private_key_to_pem_pkcs8()
                .expect("server key PEM"),
        ),
        server_cert: write("server-cert.pem", server_cert.to_pem().expect("server PEM")),
        client_key: write(
            "client-key.pem",
            client_key
                .private_key_to_pem_pkcs8()
                .expect("client key PEM"),
        ),
        client_cert: write("client-cert.pem", client_cert.to_pem().expect("client PEM")),
        dir,
    }
}

/// Accepts one connection, pumping until the listener produces it.
pub fn accept_one<C: Stream + ?Sized>(listener: &mut TlsListener, client: &mut C) -> TlsStream {
    let deadline = Instant::now() + PUMP_TIMEOUT;
    loop {
        // Keep the client's connect moving so the TCP handshake completes.
        let _ = client.connect();
        match listener.accept() {
            Ok(stream) => return stream,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "accept timed out");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => panic!("accept failed: {err}"),
        }
    }
}

fn pending(result: &io::Result<()>) -> bool {
    matches!(result, Err(err) if err.kind() == io::ErrorKind::WouldBlock)
}

/// Drives `connect()` on both ends until neither reports `WouldBlock`,
/// blocking on the armed poll set between rounds.
pub fn pump_handshake<C, S>(client: &mut C, server: &mut S) -> (io::Result<()>, io::Result<()>)
where
    C: Stream + ?Sized,
    S: Stream + ?Sized,
{
    let deadline = Instant::now() + PUMP_TIMEOUT;
    loop {
        let client_result = client.connect();
        let server_result = server.connect();
        if !pending(&client_result) && !pending(&server_result) {
            return (client_result, server_result);
        }
        assert!(Instant::now() < deadline, "handshake pump timed out");

        let mut set = PollSet::new();
        if pending(&client_result) {
            client.wait(WaitType::Connect, &mut set);
        }
        if pending(&server_result) {
            server.wait(WaitType::Connect, &mut set);
        }
        set.block(Some(Duration::from_millis(20))).expect("poll");
    }
}

/// Receives exactly `want` bytes on `stream`, running `peer` between
/// attempts so its queued transmissions keep draining.
pub fn recv_exact<R, P>(stream: &mut R, peer: &mut P, want: usize) -> Vec<u8>
where
    R: Stream + ?Sized,
    P: Stream + ?Sized,
{
    let deadline = Instant::now() + PUMP_TIMEOUT;
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 4096];
    while out.len() < want {
        assert!(Instant::now() < deadline, "receive pump timed out");
        peer.run();
        match stream.recv(&mut buf) {
            Ok(0) => panic!("peer closed after {} of {want} bytes", out.len()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                let mut set = PollSet::new();
                stream.wait(WaitType::Recv, &mut set);
                peer.run_wait(&mut set);
                set.block(Some(Duration::from_millis(20))).expect("poll");
            }
            Err(err) => panic!("recv failed: {err}"),
        }
    }
    out
}
