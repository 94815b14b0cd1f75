//! Trust-on-first-use CA bootstrap.
//!
//! When no CA certificate is available locally, the first client connection
//! may capture the peer's root certificate instead: the session runs with
//! verification disabled, the last certificate of the peer's chain is
//! checked to be self-signed, persisted atomically, and installed as the
//! trust anchor. The connection that carried the bootstrap is then killed so
//! the caller reconnects and verifies against the freshly installed CA.
//!
//! The persisted file is created with `O_CREAT|O_EXCL` and mode `0444`, so
//! at most one of any number of concurrent bootstrap attempts can win; the
//! winner is the only one to flip the shared configuration.

use super::certs::log_ca_cert;
use super::config::TlsContext;
use super::error::proto_error;
use openssl::ssl::SslRef;
use openssl::x509::{X509Ref, X509VerifyResult};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{error, info};

/// Runs the bootstrap against the peer chain of a completed handshake.
///
/// Always returns the error the in-flight connection must fail with: a
/// successful bootstrap deliberately reports a protocol error so the caller
/// reconnects under the new CA, and failures report why the CA could not be
/// captured.
pub(crate) fn bootstrap_ca_cert(context: &TlsContext, path: &Path, ssl: &SslRef) -> io::Error {
    // The chain runs leaf first; the root candidate is the last entry.
    let candidate = ssl
        .peer_cert_chain()
        .and_then(|chain| chain.iter().last().map(|cert| (cert, chain.len())));
    let Some((ca_cert, chain_len)) = candidate else {
        error!("could not bootstrap CA certificate: no certificate presented by peer");
        return proto_error();
    };

    if let Err(err) = check_self_signed(ca_cert, chain_len) {
        return err;
    }

    let pem = match ca_cert.to_pem() {
        Ok(pem) => pem,
        Err(err) => {
            error!(error = %err, "could not bootstrap CA certificate: PEM encoding failed");
            return proto_error();
        }
    };
    if let Err(err) = persist(path, &pem) {
        error!(
            file = %path.display(),
            error = %err,
            "could not bootstrap CA certificate"
        );
        return err;
    }

    info!(file = %path.display(), "successfully bootstrapped CA certificate");
    log_ca_cert(path, ca_cert);

    if let Err(err) = context.complete_bootstrap(path, ca_cert) {
        return err;
    }

    // This session was accepted without verification; force the caller to
    // reconnect and verify against the certificate just installed.
    info!("killing successful connection to retry using CA certificate");
    proto_error()
}

/// A certificate that did not issue itself, or whose self-signature does
/// not verify, is not a CA root and must not be trusted as one.
fn check_self_signed(ca_cert: &X509Ref, chain_len: usize) -> Result<(), io::Error> {
    let issued = ca_cert.issued(ca_cert);
    let self_signed = issued == X509VerifyResult::OK
        && ca_cert
            .public_key()
            .and_then(|key| ca_cert.verify(&key))
            .unwrap_or(false);
    if !self_signed {
        error!(
            reason = issued.error_string(),
            "could not bootstrap CA certificate: obtained certificate is not self-signed"
        );
        if chain_len < 2 {
            error!(
                "only one certificate was received, so probably the peer is not \
                 configured to send its CA certificate"
            );
        }
        return Err(proto_error());
    }
    Ok(())
}

/// Creates `path` exclusively with mode `0444` and writes the PEM body; on
/// any failure the file is removed so a retry can run the race again.
fn persist(path: &Path, pem: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o444)
        .open(path)?;
    if let Err(err) = file.write_all(pem) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}
