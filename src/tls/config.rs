//! Process-wide TLS configuration.
//!
//! Credentials, trust anchors, and bootstrap state are shared by every
//! stream in the process. The state lives behind a [`TlsContext`] handle;
//! the module-level free functions operate on a lazily created process
//! global, which is what the `ssl:`/`pssl:` name dispatch uses.
//!
//! The underlying engine context is immutable once built, so every
//! configuration change rebuilds it from the retained material under the
//! handle's lock. Streams snapshot the built context at construction;
//! configuration applied later affects only subsequent streams, and the
//! bootstrap flip is atomic with respect to every later handshake.

use super::certs::{log_ca_cert, read_cert_file};
use super::error::{config_unavailable, ssl_rate_limit, TlsError};
use crate::ratelimit::rate_limited;
use openssl::dh::Dh;
use openssl::error::ErrorStack;
use openssl::pkey::Params;
use openssl::ssl::{
    SslContext, SslContextBuilder, SslFiletype, SslMethod, SslMode, SslOptions, SslVerifyMode,
};
use openssl::x509::{X509, X509Ref};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{error, info};

/// Generator used for on-demand Diffie-Hellman parameter construction.
const DH_GENERATOR: u32 = 2;

/// Shared handle to a TLS configuration: credentials, trust anchors, and
/// bootstrap state.
///
/// Cloning is cheap and clones observe the same state. Most programs use
/// the process-global handle through the module-level free functions; tests
/// and embedders that need isolation can construct their own with
/// [`TlsContext::new`] and open streams through
/// [`TlsStream::open_with`](super::TlsStream::open_with).
#[derive(Clone)]
pub struct TlsContext {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    ctx: SslContext,
    private_key_file: Option<PathBuf>,
    certificate_file: Option<PathBuf>,
    /// CA certificates advertised to clients as acceptable issuers.
    ca_certs: Vec<X509>,
    /// File holding the trust anchors for peer verification.
    ca_file: Option<PathBuf>,
    /// Extra certificates sent to the peer along with our own chain.
    peer_ca_certs: Vec<X509>,
    /// When set, the CA will be bootstrapped from the peer into this file.
    bootstrap: Option<PathBuf>,
    /// Whether the engine confirmed the key matches the certificate.
    key_cert_checked: bool,
}

/// Everything a stream needs from the configuration at construction time.
#[derive(Debug)]
pub(crate) struct SessionSetup {
    pub(crate) ctx: SslContext,
    pub(crate) bootstrap: bool,
}

impl TlsContext {
    /// Creates an empty configuration with the baseline engine settings.
    pub fn new() -> Result<Self, TlsError> {
        let inner = Inner {
            ctx: base_builder()?.build(),
            private_key_file: None,
            certificate_file: None,
            ca_certs: Vec::new(),
            ca_file: None,
            peer_ca_certs: Vec::new(),
            bootstrap: None,
            key_cert_checked: false,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("TLS context lock poisoned")
    }

    /// Applies a material change and rebuilds the engine context, rolling
    /// the material back if the rebuild rejects it.
    fn with_update(&self, apply: impl FnOnce(&mut Inner)) -> Result<(), TlsError> {
        let mut inner = self.lock();
        let saved = Snapshot::of(&inner);
        apply(&mut inner);
        match rebuild(&mut inner) {
            Ok(()) => Ok(()),
            Err(err) => {
                saved.restore(&mut inner);
                // The previous material built once already; a rollback
                // rebuild failing would mean the engine itself is wedged.
                if let Err(rollback_err) = rebuild(&mut inner) {
                    error!(error = %rollback_err, "TLS context rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Sets the PEM file holding this end's private key.
    pub fn set_private_key_file(&self, path: impl AsRef<Path>) -> Result<(), TlsError> {
        let path = path.as_ref().to_path_buf();
        self.with_update(|inner| inner.private_key_file = Some(path))
    }

    /// Sets the PEM file holding this end's certificate chain, leaf first.
    pub fn set_certificate_file(&self, path: impl AsRef<Path>) -> Result<(), TlsError> {
        let path = path.as_ref().to_path_buf();
        self.with_update(|inner| inner.certificate_file = Some(path))
    }

    /// Sets the PEM file holding the CA certificate(s) used to verify peers.
    ///
    /// With `bootstrap` set and the file absent, no trust is installed yet;
    /// instead the CA certificate will be obtained from the peer on the
    /// first connection, written to `path`, and used for every connection
    /// after that.
    pub fn set_ca_cert_file(&self, path: impl AsRef<Path>, bootstrap: bool) -> Result<(), TlsError> {
        let path = path.as_ref();
        if bootstrap && !path.exists() {
            let mut inner = self.lock();
            inner.bootstrap = Some(path.to_path_buf());
            info!(
                file = %path.display(),
                "will bootstrap CA certificate from peer on first connection"
            );
            return Ok(());
        }

        let certs = read_cert_file(path)?;
        self.with_update(|inner| {
            for cert in &certs {
                log_ca_cert(path, cert);
            }
            inner.ca_certs = certs;
            inner.ca_file = Some(path.to_path_buf());
            inner.bootstrap = None;
        })
    }

    /// Adds certificates from `path` to the chain sent to the peer.
    ///
    /// The usual use is sending our CA certificate along with the leaf, so
    /// a bootstrapping peer can pick it up on its first connection.
    pub fn set_peer_ca_cert_file(&self, path: impl AsRef<Path>) -> Result<(), TlsError> {
        let certs = read_cert_file(path.as_ref())?;
        self.with_update(|inner| inner.peer_ca_certs.extend(certs))
    }

    /// Returns true if any of key, certificate, or CA has been configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        let inner = self.lock();
        inner.private_key_file.is_some()
            || inner.certificate_file.is_some()
            || inner.ca_file.is_some()
    }

    /// Gate for stream construction: all required material must be present
    /// and consistent. Failures are `ENOPROTOOPT`.
    pub(crate) fn session_setup(&self) -> io::Result<SessionSetup> {
        let inner = self.lock();
        let mut missing = false;
        if inner.private_key_file.is_none() {
            error!("private key must be configured to use TLS");
            missing = true;
        }
        if inner.certificate_file.is_none() {
            error!("certificate must be configured to use TLS");
            missing = true;
        }
        if inner.ca_file.is_none() && inner.bootstrap.is_none() {
            error!("CA certificate must be configured to use TLS");
            missing = true;
        }
        if inner.private_key_file.is_some()
            && inner.certificate_file.is_some()
            && !inner.key_cert_checked
        {
            error!("private key does not match certificate public key");
            missing = true;
        }
        if missing {
            return Err(config_unavailable());
        }
        Ok(SessionSetup {
            ctx: inner.ctx.clone(),
            bootstrap: inner.bootstrap.is_some(),
        })
    }

    /// The pending bootstrap target, if any.
    pub(crate) fn bootstrap_pending(&self) -> Option<PathBuf> {
        self.lock().bootstrap.clone()
    }

    /// Installs a bootstrapped CA certificate that has already been
    /// persisted to `path`: trust it, advertise it to clients, and leave
    /// bootstrap mode. Later handshakes observe the flip atomically.
    pub(crate) fn complete_bootstrap(&self, path: &Path, cert: &X509Ref) -> io::Result<()> {
        let mut inner = self.lock();
        inner.ca_certs.push(cert.to_owned());
        inner.ca_file = Some(path.to_path_buf());
        inner.bootstrap = None;
        if let Err(err) = rebuild(&mut inner) {
            error!(error = %err, "failed to reload verify locations after bootstrap");
            return Err(super::error::proto_error());
        }
        Ok(())
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("TlsContext")
            .field("private_key_file", &inner.private_key_file)
            .field("certificate_file", &inner.certificate_file)
            .field("ca_file", &inner.ca_file)
            .field("bootstrap", &inner.bootstrap)
            .finish_non_exhaustive()
    }
}

/// Saved material for rolling back a rejected configuration change.
struct Snapshot {
    private_key_file: Option<PathBuf>,
    certificate_file: Option<PathBuf>,
    ca_certs: Vec<X509>,
    ca_file: Option<PathBuf>,
    peer_ca_certs: Vec<X509>,
    bootstrap: Option<PathBuf>,
}

impl Snapshot {
    fn of(inner: &Inner) -> Self {
        Self {
            private_key_file: inner.private_key_file.clone(),
            certificate_file: inner.certificate_file.clone(),
            ca_certs: inner.ca_certs.clone(),
            ca_file: inner.ca_file.clone(),
            peer_ca_certs: inner.peer_ca_certs.clone(),
            bootstrap: inner.bootstrap.clone(),
        }
    }

    fn restore(self, inner: &mut Inner) {
        inner.private_key_file = self.private_key_file;
        inner.certificate_file = self.certificate_file;
        inner.ca_certs = self.ca_certs;
        inner.ca_file = self.ca_file;
        inner.peer_ca_certs = self.peer_ca_certs;
        inner.bootstrap = self.bootstrap;
    }
}

fn base_builder() -> Result<SslContextBuilder, ErrorStack> {
    let mut builder = SslContextBuilder::new(SslMethod::tls())?;
    // TLS only; the writer additionally assumes short writes are legal and
    // that the caller's buffer address may move between retries.
    builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
    builder.set_mode(SslMode::ENABLE_PARTIAL_WRITE | SslMode::ACCEPT_MOVING_WRITE_BUFFER);
    builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    builder.set_tmp_dh_callback(|_, _, keylength| tmp_dh(keylength));
    Ok(builder)
}

/// Rebuilds the engine context from the retained material.
fn rebuild(inner: &mut Inner) -> Result<(), TlsError> {
    let mut builder = base_builder()?;
    if let Some(path) = &inner.private_key_file {
        builder
            .set_private_key_file(path, SslFiletype::PEM)
            .map_err(|err| {
                TlsError::Certificate(format!("loading private key {}: {err}", path.display()))
            })?;
    }
    if let Some(path) = &inner.certificate_file {
        builder.set_certificate_chain_file(path).map_err(|err| {
            TlsError::Certificate(format!("loading certificate {}: {err}", path.display()))
        })?;
    }
    if let Some(path) = &inner.ca_file {
        builder.set_ca_file(path).map_err(|err| {
            TlsError::Certificate(format!("loading verify locations {}: {err}", path.display()))
        })?;
    }
    for cert in &inner.ca_certs {
        builder.add_client_ca(cert)?;
    }
    for cert in &inner.peer_ca_certs {
        builder.add_extra_chain_cert(cert.clone())?;
    }

    inner.key_cert_checked = inner.private_key_file.is_some()
        && inner.certificate_file.is_some()
        && match builder.check_private_key() {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "private key does not match certificate public key");
                false
            }
        };

    inner.ctx = builder.build();
    Ok(())
}

/// On-demand Diffie-Hellman parameters, generated once per key length and
/// cached for the life of the process.
fn tmp_dh(keylength: u32) -> Result<Dh<Params>, ErrorStack> {
    static SLOTS: OnceLock<Vec<(u32, Mutex<Option<Vec<u8>>>)>> = OnceLock::new();
    let slots = SLOTS.get_or_init(|| {
        [1024, 2048, 4096]
            .into_iter()
            .map(|keylength| (keylength, Mutex::new(None)))
            .collect()
    });

    let Some((_, slot)) = slots.iter().find(|(k, _)| *k == keylength) else {
        rate_limited!(
            ssl_rate_limit(),
            error,
            keylength,
            "no Diffie-Hellman parameters for key length"
        );
        return Err(ErrorStack::get());
    };

    let mut cached = slot.lock().expect("DH cache lock poisoned");
    if cached.is_none() {
        info!(keylength, "generating Diffie-Hellman parameters");
        match Dh::generate_params(keylength, DH_GENERATOR).and_then(|dh| dh.params_to_pem()) {
            Ok(pem) => *cached = Some(pem),
            Err(err) => panic!("out of memory constructing Diffie-Hellman parameters: {err}"),
        }
    }
    let pem = cached.as_ref().expect("DH slot filled above");
    Dh::params_from_pem(pem)
}

fn global() -> Result<&'static TlsContext, TlsError> {
    static GLOBAL: OnceLock<Option<TlsContext>> = OnceLock::new();
    let slot = GLOBAL.get_or_init(|| match TlsContext::new() {
        Ok(context) => Some(context),
        Err(err) => {
            error!(error = %err, "TLS context initialization failed");
            None
        }
    });
    slot.as_ref()
        .ok_or_else(|| TlsError::Configuration("TLS context initialization failed".into()))
}

/// A clone of the process-global context handle for stream construction.
pub(crate) fn global_handle() -> Result<TlsContext, TlsError> {
    global().cloned()
}

/// Initializes the process-global TLS context.
///
/// Initialization runs exactly once; every later call (from here or from
/// any configuration function) returns the cached status.
pub fn init() -> Result<(), TlsError> {
    global().map(|_| ())
}

/// Sets the process-global private key file. See
/// [`TlsContext::set_private_key_file`].
pub fn set_private_key_file(path: impl AsRef<Path>) -> Result<(), TlsError> {
    global()?.set_private_key_file(path)
}

/// Sets the process-global certificate chain file. See
/// [`TlsContext::set_certificate_file`].
pub fn set_certificate_file(path: impl AsRef<Path>) -> Result<(), TlsError> {
    global()?.set_certificate_file(path)
}

/// Sets the process-global CA certificate file, optionally in bootstrap
/// mode. See [`TlsContext::set_ca_cert_file`].
pub fn set_ca_cert_file(path: impl AsRef<Path>, bootstrap: bool) -> Result<(), TlsError> {
    global()?.set_ca_cert_file(path, bootstrap)
}

/// Adds process-global extra peer-chain certificates. See
/// [`TlsContext::set_peer_ca_cert_file`].
pub fn set_peer_ca_cert_file(path: impl AsRef<Path>) -> Result<(), TlsError> {
    global()?.set_peer_ca_cert_file(path)
}

/// Returns true if the process-global configuration has any of key,
/// certificate, or CA set.
#[must_use]
pub fn is_configured() -> bool {
    global().is_ok_and(TlsContext::is_configured)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_is_unconfigured() {
        let context = TlsContext::new().expect("context");
        assert!(!context.is_configured());
        let err = context.session_setup().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOPROTOOPT));
    }

    #[test]
    fn missing_credential_files_are_rejected_and_rolled_back() {
        let context = TlsContext::new().expect("context");
        assert!(context.set_private_key_file("/nonexistent/key.pem").is_err());
        assert!(context
            .set_certificate_file("/nonexistent/cert.pem")
            .is_err());
        assert!(context
            .set_ca_cert_file("/nonexistent/ca.pem", false)
            .is_err());
        // Failed setters must not advance the configured flags.
        assert!(!context.is_configured());
    }

    #[test]
    fn bootstrap_mode_requires_an_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cacert.pem");
        let context = TlsContext::new().expect("context");
        context
            .set_ca_cert_file(&path, true)
            .expect("bootstrap mode");
        assert_eq!(context.bootstrap_pending(), Some(path));
        // Bootstrap alone does not count as configured trust.
        assert!(!context.is_configured());
    }

    #[test]
    fn global_init_is_idempotent() {
        let first = init().is_ok();
        for _ in 0..3 {
            assert_eq!(init().is_ok(), first);
        }
    }

    #[test]
    fn dh_parameters_are_cached_per_key_length() {
        let first = tmp_dh(1024).expect("generate");
        let second = tmp_dh(1024).expect("cached");
        assert_eq!(
            first.params_to_pem().unwrap(),
            second.params_to_pem().unwrap()
        );
        assert!(tmp_dh(1536).is_err());
    }
}
