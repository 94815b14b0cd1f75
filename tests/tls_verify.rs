//! Peer verification and configuration gating.
//!
//! Test coverage:
//! - TLS-VERIFY-001: a server certificate from the wrong CA fails the
//!   handshake with `EPROTO` and no plaintext is exchanged
//! - TLS-VERIFY-002: streams cannot be constructed without credentials
//! - TLS-VERIFY-003: a key that does not match the certificate is rejected

mod common;

use common::*;
use ofwire::tls::{TlsContext, TlsListener, TlsStream};

/// TLS-VERIFY-001
#[test]
fn mismatched_ca_fails_with_proto_error() {
    init_test_logging();
    let material = mint_material();
    let unrelated = mint_material();

    let server_context = TlsContext::new().expect("server context");
    server_context
        .set_private_key_file(&material.server_key)
        .expect("server key");
    server_context
        .set_certificate_file(&material.server_cert)
        .expect("server cert");
    server_context
        .set_ca_cert_file(&material.ca_cert, false)
        .expect("server CA");

    // The client's own identity is fine, but it trusts a different root, so
    // the server's certificate must be rejected.
    let client_context = TlsContext::new().expect("client context");
    client_context
        .set_private_key_file(&material.client_key)
        .expect("client key");
    client_context
        .set_certificate_file(&material.client_cert)
        .expect("client cert");
    client_context
        .set_ca_cert_file(&unrelated.ca_cert, false)
        .expect("client CA");

    let mut listener = TlsListener::open_with(&server_context, "0:127.0.0.1").expect("listener");
    let port = listener.local_addr().expect("local addr").port();
    let mut client = TlsStream::open_with(&client_context, &format!("127.0.0.1:{port}"))
        .expect("client stream");
    let mut server = accept_one(&mut listener, &mut client);

    let (client_result, server_result) = pump_handshake(&mut client, &mut server);
    let client_err = client_result.expect_err("verification must fail");
    assert_eq!(client_err.raw_os_error(), Some(libc::EPROTO));
    assert!(client.is_closed());
    assert!(server_result.is_err(), "server must see the aborted handshake");
}

/// TLS-VERIFY-002
#[test]
fn unconfigured_context_rejects_streams() {
    init_test_logging();
    let context = TlsContext::new().expect("context");
    let err = TlsStream::open_with(&context, "127.0.0.1:9").expect_err("no credentials");
    assert_eq!(err.raw_os_error(), Some(libc::ENOPROTOOPT));

    // Key and certificate alone are not enough: trust must be configured or
    // bootstrapped.
    let material = mint_material();
    context
        .set_private_key_file(&material.server_key)
        .expect("key");
    context
        .set_certificate_file(&material.server_cert)
        .expect("cert");
    let err = TlsStream::open_with(&context, "127.0.0.1:9").expect_err("no CA");
    assert_eq!(err.raw_os_error(), Some(libc::ENOPROTOOPT));

    // A pending bootstrap satisfies the trust requirement.
    let missing = material.dir.path().join("bootstrap-ca.pem");
    context
        .set_ca_cert_file(&missing, true)
        .expect("bootstrap mode");
    TlsStream::open_with(&context, "127.0.0.1:9").expect("constructible with bootstrap pending");
}

/// TLS-VERIFY-003
#[test]
fn mismatched_key_and_certificate_are_rejected() {
    init_test_logging();
    let material = mint_material();
    let context = TlsContext::new().expect("context");
    let missing = material.dir.path().join("bootstrap-ca.pem");
    context
        .set_ca_cert_file(&missing, true)
        .expect("bootstrap mode");
    context
        .set_private_key_file(&material.client_key)
        .expect("key");
    // The certificate belongs to a different key; whether the engine
    // rejects it at load time or the consistency check fails afterwards,
    // no stream may be constructed from the pair.
    let _ = context.set_certificate_file(&material.server_cert);
    let err = TlsStream::open_with(&context, "127.0.0.1:9").expect_err("key/cert mismatch");
    assert_eq!(err.raw_os_error(), Some(libc::ENOPROTOOPT));
}
