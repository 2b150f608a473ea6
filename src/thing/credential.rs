//! TLS client credential for mutual authentication with AWS IoT
//!
//! A [`Credential`] holds the PEM material exactly as it was handed in (flags,
//! files or config) and turns it into a rustls [`ClientConfig`] once, when the
//! [`Thing`](super::Thing) is constructed. Everything that can be checked
//! without a network round trip is checked there:
//!
//! 1. the certificate chain parses and is not empty
//! 2. exactly one private key parses and rustls supports its type
//! 3. the key belongs to the leaf certificate
//!
//! The last check signs a fixed probe with the private key and verifies the
//! signature against the public key inside the certificate.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, SignatureVerificationAlgorithm};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use std::fmt;
use tracing::{debug, warn};

use super::error::ThingError;

const KEY_MATCH_PROBE: &[u8] = b"sprk-iot credential key match probe";

// One scheme per key type; RSA keys pick the first offered RSA scheme.
const PROBE_SCHEMES: [SignatureScheme; 4] = [
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PKCS1_SHA256,
];

/// Private key and certificate of a thing, plus an optional extra CA
#[derive(Clone)]
pub struct Credential {
    private_key: Vec<u8>,
    certificate: Vec<u8>,
    ca_certificate: Option<Vec<u8>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("private_key", &"<redacted>")
            .field("certificate_len", &self.certificate.len())
            .field("ca_certificate", &self.ca_certificate.is_some())
            .finish()
    }
}

impl Credential {
    /// Creates a credential from PEM encoded key and certificate bytes
    pub fn new(private_key: impl Into<Vec<u8>>, certificate: impl Into<Vec<u8>>) -> Self {
        Self {
            private_key: private_key.into(),
            certificate: certificate.into(),
            ca_certificate: None,
        }
    }

    /// Trusts an additional CA (e.g. AmazonRootCA1) next to the system roots
    pub fn with_ca_certificate(mut self, ca_certificate: impl Into<Vec<u8>>) -> Self {
        self.ca_certificate = Some(ca_certificate.into());
        self
    }

    /// Builds the rustls client configuration
    ///
    /// # Errors
    ///
    /// [`ThingError::InvalidCredential`] if the key or certificate do not parse,
    /// the key type is unsupported, or the key does not match the certificate.
    pub fn client_config(&self) -> Result<ClientConfig, ThingError> {
        let certs = parse_certificates(&self.certificate)?;
        let key = parse_private_key(&self.private_key)?;
        verify_key_pair(&certs[0], &key)?;

        let roots = self.root_store()?;
        debug!(
            "Building TLS client config with {} root certificates",
            roots.len()
        );

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ThingError::InvalidCredential(e.to_string()))
    }

    fn root_store(&self) -> Result<RootCertStore, ThingError> {
        let mut roots = RootCertStore::empty();

        // An empty store only fails later, at handshake time.
        match rustls_native_certs::load_native_certs() {
            Ok(native) => {
                let (added, ignored) = roots.add_parsable_certificates(native);
                debug!("Loaded {} system root certificates ({} ignored)", added, ignored);
            }
            Err(e) => warn!("Unable to load system root certificates: {}", e),
        }

        if let Some(ca) = &self.ca_certificate {
            for cert in parse_certificates(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| ThingError::InvalidCredential(format!("Invalid CA: {}", e)))?;
            }
        }

        Ok(roots)
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ThingError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ThingError::InvalidCredential(format!("Failed to read certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(ThingError::InvalidCredential(
            "No certificate found in PEM input".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ThingError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| ThingError::InvalidCredential(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ThingError::InvalidCredential("No private key found in PEM input".to_string()))
}

fn verify_key_pair(
    leaf: &CertificateDer<'_>,
    key: &PrivateKeyDer<'_>,
) -> Result<(), ThingError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key).map_err(|e| {
        ThingError::InvalidCredential(format!("Unsupported private key: {}", e))
    })?;
    let signer = signing_key.choose_scheme(&PROBE_SCHEMES).ok_or_else(|| {
        ThingError::InvalidCredential(format!(
            "No usable signature scheme for {:?} key",
            signing_key.algorithm()
        ))
    })?;
    let signature = signer
        .sign(KEY_MATCH_PROBE)
        .map_err(|e| ThingError::InvalidCredential(format!("Signing with key failed: {}", e)))?;

    let algorithm = verification_algorithm(signer.scheme()).ok_or_else(|| {
        ThingError::InvalidCredential(format!(
            "Unsupported signature scheme {:?}",
            signer.scheme()
        ))
    })?;
    let cert = webpki::EndEntityCert::try_from(leaf)
        .map_err(|e| ThingError::InvalidCredential(format!("Invalid certificate: {}", e)))?;

    cert.verify_signature(algorithm, KEY_MATCH_PROBE, &signature)
        .map_err(|_| {
            ThingError::InvalidCredential(
                "Private key does not match the certificate".to_string(),
            )
        })
}

fn verification_algorithm(
    scheme: SignatureScheme,
) -> Option<&'static dyn SignatureVerificationAlgorithm> {
    match scheme {
        SignatureScheme::ECDSA_NISTP256_SHA256 => Some(webpki::ring::ECDSA_P256_SHA256),
        SignatureScheme::ECDSA_NISTP384_SHA384 => Some(webpki::ring::ECDSA_P384_SHA384),
        SignatureScheme::ED25519 => Some(webpki::ring::ED25519),
        SignatureScheme::RSA_PKCS1_SHA256 => Some(webpki::ring::RSA_PKCS1_2048_8192_SHA256),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const RSA_KEY: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/rsa_key.pem"));
    pub const RSA_CERT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/rsa_cert.pem"));
    pub const EC_KEY: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/ec_key.pem"));
    pub const EC_CERT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/ec_cert.pem"));
    pub const OTHER_RSA_KEY: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/other_rsa_key.pem"));
}
