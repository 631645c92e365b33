//! AWS Signature Version 4 request signing.
//!
//! Boot artifacts increasingly live in private object stores; this module
//! derives the `Authorization: AWS4-HMAC-SHA256` header for a GET against
//! one. The canonical request, string-to-sign and signing-key derivation
//! follow the published algorithm exactly.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use cinder_kernel::hex;
use cinder_kernel::uri::{percent_encode, Uri};
use cinder_crypto::hmac::hmac;
use cinder_crypto::sha256::{sha256, Sha256};
use cinder_crypto::digest::Digest;

/// Credentials for signing
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub service: String,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut ctx = Sha256::new();
    ctx.update(data);
    hex::encode(&ctx.finalize(), "")
}

/// Canonical URI path: each segment percent-encoded
fn canonical_path(uri: &Uri) -> String {
    let path = uri.path.as_deref().unwrap_or("/");
    let encoded: Vec<String> = path.split('/').map(percent_encode).collect();
    let joined = encoded.join("/");
    if joined.is_empty() {
        "/".into()
    } else {
        joined
    }
}

/// Build the canonical request (step 1)
///
/// `timestamp` is the ISO8601 basic form `YYYYMMDDTHHMMSSZ`. Signed
/// headers are fixed as `host;x-amz-date`.
pub fn canonical_request(method: &str, uri: &Uri, timestamp: &str, payload: &[u8]) -> String {
    let host = uri.host.as_deref().unwrap_or("");
    let query = uri.query.as_deref().unwrap_or("");
    format!(
        "{method}\n{path}\n{query}\nhost:{host}\nx-amz-date:{timestamp}\n\nhost;x-amz-date\n{payload_hash}",
        path = canonical_path(uri),
        payload_hash = sha256_hex(payload),
    )
}

/// Build the string to sign (step 2)
pub fn string_to_sign(timestamp: &str, credentials: &AwsCredentials, creq: &str) -> String {
    let date = &timestamp[..8];
    format!(
        "AWS4-HMAC-SHA256\n{timestamp}\n{date}/{region}/{service}/aws4_request\n{creq_hash}",
        region = credentials.region,
        service = credentials.service,
        creq_hash = sha256_hex(creq.as_bytes()),
    )
}

/// Derive the signing key (step 3)
pub fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac(sha256, k_secret.as_bytes(), date.as_bytes());
    let k_region = hmac(sha256, &k_date, region.as_bytes());
    let k_service = hmac(sha256, &k_region, service.as_bytes());
    hmac(sha256, &k_service, b"aws4_request")
}

/// Produce the full `Authorization` header value (step 4)
pub fn authorization_header(
    method: &str,
    uri: &Uri,
    timestamp: &str,
    payload: &[u8],
    credentials: &AwsCredentials,
) -> String {
    let creq = canonical_request(method, uri, timestamp, payload);
    let sts = string_to_sign(timestamp, credentials, &creq);
    let date = &timestamp[..8];
    let key = signing_key(
        &credentials.secret_key,
        date,
        &credentials.region,
        &credentials.service,
    );
    let signature = hex::encode(&hmac(sha256, &key, sts.as_bytes()), "");
    format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{date}/{region}/{service}/aws4_request, \
         SignedHeaders=host;x-amz-date, Signature={signature}",
        access_key = credentials.access_key,
        region = credentials.region,
        service = credentials.service,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_key_derivation_example() {
        // The published derivation example: secret, 20150830, us-east-1, iam
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(&key, ""),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn canonical_request_shape() {
        let uri = Uri::parse("https://bucket.s3.amazonaws.com/boot/image.img");
        let creq = canonical_request("GET", &uri, "20260801T000000Z", b"");
        let mut lines = creq.split('\n');
        assert_eq!(lines.next(), Some("GET"));
        assert_eq!(lines.next(), Some("/boot/image.img"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("host:bucket.s3.amazonaws.com"));
        assert_eq!(lines.next(), Some("x-amz-date:20260801T000000Z"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("host;x-amz-date"));
        // Empty-payload hash is a fixed constant
        assert_eq!(
            lines.next(),
            Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn authorization_header_format() {
        let uri = Uri::parse("https://bucket.s3.amazonaws.com/x");
        let credentials = AwsCredentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "secret".into(),
            region: "us-east-1".into(),
            service: "s3".into(),
        };
        let header = authorization_header("GET", &uri, "20260801T000000Z", b"", &credentials);
        assert!(header.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260801/us-east-1/s3/aws4_request"
        ));
        assert!(header.contains("SignedHeaders=host;x-amz-date"));
        assert!(header.contains("Signature="));
    }
}
