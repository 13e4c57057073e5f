//! Hashing, wire-message signing, and protocol math

use crate::{Error, Result};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

/// Minimum cooperating-party count minus one: `⌈2N/3⌉ − 1`.
///
/// The protocol needs `threshold + 1` shares to sign.
pub fn get_threshold(value: i64) -> Result<usize> {
    if value < 0 {
        return Err(Error::InvalidArgument("negative input".into()));
    }
    let threshold = ((value as f64) * 2.0 / 3.0).ceil() as i64 - 1;
    Ok(threshold.max(0) as usize)
}

/// SHA-256 of a message, hex encoded lowercase. Rejects empty input; every
/// message id and payload hash in the protocol goes through this.
pub fn msg_to_hash_string(msg: &[u8]) -> Result<String> {
    if msg.is_empty() {
        return Err(Error::InvalidArgument("empty message".into()));
    }
    Ok(hex::encode(Sha256::digest(msg)))
}

/// SHA-256 of a payload, hex encoded. Unlike [`msg_to_hash_string`] this
/// accepts empty payloads; used for hashing wire-message bodies.
pub fn bytes_to_hash_string(msg: &[u8]) -> String {
    hex::encode(Sha256::digest(msg))
}

/// Sign `message ‖ msg_id` with the node key. The signer digests the input;
/// no additional hashing happens here.
pub fn generate_signature(msg: &[u8], msg_id: &str, key: &SigningKey) -> Vec<u8> {
    let mut data = Vec::with_capacity(msg.len() + msg_id.len());
    data.extend_from_slice(msg);
    data.extend_from_slice(msg_id.as_bytes());
    let sig: Signature = key.sign(&data);
    sig.to_bytes().to_vec()
}

/// Verify a wire-message signature over `message ‖ msg_id` under the
/// sender's committee public key.
pub fn verify_signature(pub_key: &[u8], message: &[u8], sig: &[u8], msg_id: &str) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(pub_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(sig) else {
        return false;
    };
    let mut data = Vec::with_capacity(message.len() + msg_id.len());
    data.extend_from_slice(message);
    data.extend_from_slice(msg_id.as_bytes());
    key.verify(&data, &signature).is_ok()
}

/// Raw ECDSA verification for notifier payloads: the message is respected
/// as-is and is NOT hashed again — whoever submitted it for signing already
/// digested it.
pub fn verify_raw_signature(pub_key: &[u8], message: &[u8], r: &[u8], s: &[u8]) -> Result<bool> {
    let key = VerifyingKey::from_sec1_bytes(pub_key)
        .map_err(|e| Error::Crypto(format!("invalid pool public key: {e}")))?;
    if r.len() > 32 || s.len() > 32 {
        return Ok(false);
    }
    let mut r_buf = [0u8; 32];
    let mut s_buf = [0u8; 32];
    r_buf[32 - r.len()..].copy_from_slice(r);
    s_buf[32 - s.len()..].copy_from_slice(s);
    let Ok(signature) = Signature::from_scalars(r_buf, s_buf) else {
        return Ok(false);
    };
    Ok(key.verify_prehash(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use rand::rngs::OsRng;

    #[test]
    fn test_get_threshold() {
        assert!(get_threshold(-2).is_err());
        assert_eq!(get_threshold(4).unwrap(), 2);
        assert_eq!(get_threshold(9).unwrap(), 5);
        assert_eq!(get_threshold(10).unwrap(), 6);
        assert_eq!(get_threshold(99).unwrap(), 65);
    }

    #[test]
    fn test_msg_to_hash_string() {
        let out = msg_to_hash_string(b"hello").unwrap();
        assert_eq!(
            out,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(msg_to_hash_string(b"").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let sk = SigningKey::random(&mut OsRng);
        let pk = sk.verifying_key().to_encoded_point(true);
        let sig = generate_signature(b"hello", "123", &sk);
        assert!(verify_signature(pk.as_bytes(), b"hello", &sig, "123"));
        // tampered message
        assert!(!verify_signature(pk.as_bytes(), b"hellx", &sig, "123"));
        // wrong message id
        assert!(!verify_signature(pk.as_bytes(), b"hello", &sig, "124"));
    }

    #[test]
    fn test_verify_raw_signature() {
        let sk = SigningKey::random(&mut OsRng);
        let pk = sk.verifying_key().to_encoded_point(true);
        let digest = Sha256::digest(b"payload");
        let sig: Signature = sk.sign_prehash(&digest).unwrap();
        let r = sig.r().to_bytes().to_vec();
        let s = sig.s().to_bytes().to_vec();
        assert!(verify_raw_signature(pk.as_bytes(), &digest, &r, &s).unwrap());
        // a different message must not verify
        let other = Sha256::digest(b"other");
        assert!(!verify_raw_signature(pk.as_bytes(), &other, &r, &s).unwrap());
    }
}
