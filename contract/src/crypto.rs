//! Signature and hash helpers.
//!
//! Markers and validation tickets are signed with secp256k1 ECDSA over the
//! SHA-256 digest of the SCALE encoding of the record without its signature
//! field. Public keys are hex-encoded SEC1 points, signatures hex-encoded
//! fixed-size `r || s`.

use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Lowercase hex SHA-256 over the concatenation of `parts`.
pub fn hash_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Raw SHA-256 over the concatenation of `parts`, for RNG seeding.
pub fn hash_raw(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Verifies an ECDSA signature over `message`. Any failure, malformed key
/// or signature included, is an `auth` error.
pub fn verify_signature(
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), Error> {
    let key_bytes = hex::decode(public_key_hex)
        .map_err(|_| Error::Auth("public key is not valid hex".into()))?;
    let key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|_| Error::Auth("public key is not a valid secp256k1 point".into()))?;
    let sig_bytes =
        hex::decode(signature_hex).map_err(|_| Error::Auth("signature is not valid hex".into()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| Error::Auth("signature has invalid length".into()))?;
    key.verify(message, &signature)
        .map_err(|_| Error::Auth("signature verification failed".into()))
}

#[cfg(test)]
pub mod testing {
    //! Key material helpers shared by signature tests.

    use k256::ecdsa::signature::Signer;
    use k256::ecdsa::{Signature, SigningKey};

    /// A deterministic keypair derived from a one-byte seed.
    pub fn keypair(seed: u8) -> (SigningKey, String) {
        let mut bytes = [seed; 32];
        bytes[0] = 1; // keep the scalar non-zero and in range
        let key = SigningKey::from_slice(&bytes).unwrap();
        let public_hex = hex::encode(key.verifying_key().to_sec1_bytes());
        (key, public_hex)
    }

    pub fn sign(key: &SigningKey, message: &[u8]) -> String {
        let signature: Signature = key.sign(message);
        hex::encode(signature.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_is_stable() {
        let a = hash_hex(&[b"alloc", b"42"]);
        let b = hash_hex(&[b"alloc", b"42"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_hex(&[b"alloc", b"43"]));
    }

    #[test]
    fn valid_signature_verifies() {
        let (key, public_hex) = testing::keypair(7);
        let sig = testing::sign(&key, b"marker");
        assert!(verify_signature(&public_hex, b"marker", &sig).is_ok());
    }

    #[test]
    fn tampered_message_is_rejected() {
        let (key, public_hex) = testing::keypair(7);
        let sig = testing::sign(&key, b"marker");
        let err = verify_signature(&public_hex, b"other", &sig).unwrap_err();
        assert!(err.to_string().starts_with("auth"));
    }

    #[test]
    fn foreign_key_is_rejected() {
        let (key, _) = testing::keypair(7);
        let (_, other_public) = testing::keypair(9);
        let sig = testing::sign(&key, b"marker");
        assert!(verify_signature(&other_public, b"marker", &sig).is_err());
    }

    #[test]
    fn malformed_inputs_are_auth_errors() {
        assert!(verify_signature("zz", b"m", "00").is_err());
        let (_, public_hex) = testing::keypair(3);
        assert!(verify_signature(&public_hex, b"m", "not-hex").is_err());
        assert!(verify_signature(&public_hex, b"m", "0011").is_err());
    }
}
