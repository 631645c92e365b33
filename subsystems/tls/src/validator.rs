//! Certificate validation hook.
//!
//! The handshake hands the presented chain to the installed validator and
//! blocks (counts a pending operation) until the job completes. The
//! platform installs a real validator; the built-in fallback only extracts
//! the leaf public key and accepts, loudly.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_crypto::asn1::{self, Cursor};
use cinder_crypto::rsa::RsaPublicKey;

/// An asynchronous validation in flight
pub struct ValidationJob {
    result: Mutex<Option<Result<()>>>,
}

impl ValidationJob {
    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
        })
    }

    pub fn completed(rc: Result<()>) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(Some(rc)),
        })
    }

    /// Report the verdict (first writer wins)
    pub fn complete(&self, rc: Result<()>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(rc);
        }
    }

    pub fn result(&self) -> Option<Result<()>> {
        *self.result.lock()
    }
}

impl core::fmt::Debug for ValidationJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ValidationJob")
            .field("done", &self.result.lock().is_some())
            .finish()
    }
}

/// A certificate chain validator
pub trait CertificateValidator: Send + Sync {
    /// Begin validating `chain` (leaf first, DER) for `server_name`
    fn validate(&self, chain: &[Vec<u8>], server_name: &str) -> Arc<ValidationJob>;
}

/// Fallback validator: accepts any syntactically valid chain
struct PermissiveValidator;

impl CertificateValidator for PermissiveValidator {
    fn validate(&self, chain: &[Vec<u8>], server_name: &str) -> Arc<ValidationJob> {
        let rc = match chain.first() {
            Some(leaf) if extract_public_key(leaf).is_ok() => {
                log::warn!("no certificate validator installed; trusting {server_name}");
                Ok(())
            }
            _ => Err(Error::Protocol),
        };
        ValidationJob::completed(rc)
    }
}

static VALIDATOR: RwLock<Option<Arc<dyn CertificateValidator>>> = RwLock::new(None);

/// Install the platform certificate validator
pub fn set_validator(validator: Arc<dyn CertificateValidator>) {
    *VALIDATOR.write() = Some(validator);
}

/// Validate a chain through the installed (or fallback) validator
pub fn validate(chain: &[Vec<u8>], server_name: &str) -> Arc<ValidationJob> {
    match VALIDATOR.read().clone() {
        Some(validator) => validator.validate(chain, server_name),
        None => PermissiveValidator.validate(chain, server_name),
    }
}

/// Extract the RSA public key from an X.509 certificate
///
/// Walks Certificate -> tbsCertificate -> subjectPublicKeyInfo without
/// interpreting anything else; full chain semantics belong to the
/// validator.
pub fn extract_public_key(cert_der: &[u8]) -> Result<RsaPublicKey> {
    let mut outer = Cursor::new(cert_der);
    let mut cert = outer.enter(asn1::ASN1_SEQUENCE)?;
    let mut tbs = cert.enter(asn1::ASN1_SEQUENCE)?;
    // [0] version (optional), serialNumber, signature, issuer, validity,
    // subject, subjectPublicKeyInfo
    tbs.skip_if(asn1::asn1_explicit(0))?;
    tbs.skip()?; // serial
    tbs.skip()?; // signature algorithm
    tbs.skip()?; // issuer
    tbs.skip()?; // validity
    tbs.skip()?; // subject
    let spki = tbs.raw_next()?;
    RsaPublicKey::from_spki(spki)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal DER certificate skeleton around an RSA SPKI
    fn fake_cert(spki: &[u8]) -> Vec<u8> {
        fn wrap(tag: u8, contents: &[u8]) -> Vec<u8> {
            let mut out = alloc::vec![tag];
            if contents.len() < 128 {
                out.push(contents.len() as u8);
            } else {
                out.push(0x82);
                out.extend_from_slice(&(contents.len() as u16).to_be_bytes());
            }
            out.extend_from_slice(contents);
            out
        }
        let serial = wrap(0x02, &[1]);
        let alg = wrap(0x30, &[]);
        let issuer = wrap(0x30, &[]);
        let validity = wrap(0x30, &[]);
        let subject = wrap(0x30, &[]);
        let mut tbs_contents = Vec::new();
        for part in [&serial, &alg, &issuer, &validity, &subject] {
            tbs_contents.extend_from_slice(part);
        }
        tbs_contents.extend_from_slice(spki);
        let tbs = wrap(0x30, &tbs_contents);
        let mut cert_contents = tbs;
        cert_contents.extend_from_slice(&wrap(0x30, &[]));
        cert_contents.extend_from_slice(&wrap(0x03, &[0]));
        wrap(0x30, &cert_contents)
    }

    fn fake_spki() -> Vec<u8> {
        // AlgorithmIdentifier (empty) + BIT STRING wrapping RSAPublicKey
        // SEQUENCE { INTEGER 3233, INTEGER 17 }
        let rsa_key = [0x30, 0x08, 0x02, 0x03, 0x00, 0x0c, 0xa1, 0x02, 0x01, 0x11];
        let mut bit_string = alloc::vec![0x03, (rsa_key.len() + 1) as u8, 0x00];
        bit_string.extend_from_slice(&rsa_key);
        let alg = [0x30, 0x00];
        let mut contents = alg.to_vec();
        contents.extend_from_slice(&bit_string);
        let mut out = alloc::vec![0x30, contents.len() as u8];
        out.extend_from_slice(&contents);
        out
    }

    #[test]
    fn extracts_leaf_public_key() {
        let cert = fake_cert(&fake_spki());
        let key = extract_public_key(&cert).unwrap();
        assert_eq!(key.modulus_len(), 2);
    }

    #[test]
    fn garbage_certificate_rejected() {
        assert!(extract_public_key(&[0x30, 0x01, 0x00]).is_err());
    }

    #[test]
    fn fallback_validator_accepts_valid_chain() {
        let cert = fake_cert(&fake_spki());
        let job = validate(&[cert], "example.com");
        assert_eq!(job.result(), Some(Ok(())));
        let job = validate(&[], "example.com");
        assert_eq!(job.result(), Some(Err(Error::Protocol)));
    }
}
