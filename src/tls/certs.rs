//! Credential loading helpers.

use super::error::TlsError;
use openssl::hash::MessageDigest;
use openssl::x509::{X509, X509Ref};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// Reads every PEM certificate in `path`, in file order.
pub(crate) fn read_cert_file(path: &Path) -> Result<Vec<X509>, TlsError> {
    let pem = std::fs::read(path).map_err(|err| {
        TlsError::Certificate(format!(
            "failed to open {} for reading: {err}",
            path.display()
        ))
    })?;
    let certs = X509::stack_from_pem(&pem)
        .map_err(|err| TlsError::Certificate(format!("reading {}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Colon-separated SHA-1 fingerprint of `cert`.
pub(crate) fn fingerprint(cert: &X509Ref) -> String {
    match cert.digest(MessageDigest::sha1()) {
        Ok(digest) => {
            let mut out = String::with_capacity(digest.len() * 3);
            for (i, byte) in digest.iter().enumerate() {
                if i > 0 {
                    out.push(':');
                }
                let _ = write!(out, "{byte:02x}");
            }
            out
        }
        Err(_) => "<digest unavailable>".to_string(),
    }
}

/// One-line subject name in `CN=..., O=...` form.
pub(crate) fn subject_name(cert: &X509Ref) -> String {
    let mut out = String::new();
    for entry in cert.subject_name().entries() {
        if !out.is_empty() {
            out.push_str(", ");
        }
        let key = entry.object().nid().short_name().unwrap_or("?");
        match entry.data().as_utf8() {
            Ok(value) => {
                let _ = write!(out, "{key}={value}");
            }
            Err(_) => {
                let _ = write!(out, "{key}=<unprintable>");
            }
        }
    }
    out
}

/// Logs the identity of a newly trusted CA certificate.
pub(crate) fn log_ca_cert(path: &Path, cert: &X509Ref) {
    info!(
        file = %path.display(),
        subject = %subject_name(cert),
        fingerprint = %fingerprint(cert),
        "trusting CA certificate"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    fn self_signed(cn: &str) -> X509 {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    #[test]
    fn fingerprint_is_colon_separated_sha1() {
        let cert = self_signed("fingerprint-test");
        let fp = fingerprint(&cert);
        // 20 digest bytes, two hex digits each, 19 separators.
        assert_eq!(fp.len(), 59);
        assert!(fp
            .split(':')
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn subject_includes_common_name() {
        let cert = self_signed("subject-test");
        assert_eq!(subject_name(&cert), "CN=subject-test");
    }

    #[test]
    fn read_cert_file_reports_missing_files() {
        let err = read_cert_file(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn read_cert_file_reads_multiple_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cacert.pem");
        let mut pem = self_signed("first").to_pem().unwrap();
        pem.extend(self_signed("second").to_pem().unwrap());
        std::fs::write(&path, pem).unwrap();
        let certs = read_cert_file(&path).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(subject_name(&certs[0]), "CN=first");
        assert_eq!(subject_name(&certs[1]), "CN=second");
    }
}
