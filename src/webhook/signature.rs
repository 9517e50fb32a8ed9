//! HMAC signatures on hub notifications
//!
//! The hub signs each notification body with the subscription secret and
//! sends it as `X-Hub-Signature: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the notification signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

const ALGORITHM: &str = "sha256";

/// Compute the signature header value for `body`
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::InvalidParameter(format!("Invalid HMAC key: {e}")))?;
    mac.update(body);
    Ok(format!("{ALGORITHM}={}", hex::encode(mac.finalize().into_bytes())))
}

/// Verify a signature header against `body`.
///
/// Only `sha256` is accepted. The digest comparison is constant-time.
pub fn verify(header: &str, secret: &str, body: &[u8]) -> bool {
    let Some((algorithm, digest)) = header.trim().split_once('=') else {
        return false;
    };
    if !algorithm.eq_ignore_ascii_case(ALGORITHM) {
        return false;
    }
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_known_vector() {
        // RFC 4231 test case 2
        let signature = sign("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_accepts_own_signature() {
        let body = br#"{"data":[{"id":"1"}]}"#;
        let header = sign("secret", body).unwrap();
        assert!(verify(&header, "secret", body));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let body = br#"{"data":[{"id":"1"}]}"#;
        let header = sign("secret", body).unwrap();
        assert!(!verify(&header, "other", body));
        assert!(!verify(&header, "secret", b"{}"));
    }

    #[test]
    fn test_verify_rejects_malformed_headers() {
        let body = b"payload";
        let digest = sign("secret", body)
            .unwrap()
            .trim_start_matches("sha256=").to_string();
        assert!(!verify(&format!("sha1={digest}"), "secret", body));
        assert!(!verify(&digest, "secret", body));
        assert!(!verify("sha256=zz", "secret", body));
        assert!(!verify("", "secret", body));
    }
}
