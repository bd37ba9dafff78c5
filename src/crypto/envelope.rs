//! Record envelope format
//!
//! Every encrypted record is a single self-contained blob:
//!
//! ```text
//! [ version: u8 ][ wrapped DEK length: u16 BE ][ wrapped DEK ]
//! [ nonce: 24 bytes ][ XChaCha20-Poly1305 ciphertext + 16-byte tag ]
//! ```
//!
//! The DEK is 32 random bytes, fresh per call, wrapped under the topic KEK
//! with its own 24-byte nonce (wrapped DEK = nonce || ciphertext). Because a
//! DEK encrypts exactly one record, data nonces can be random without reuse
//! risk.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use super::{CryptoError, CryptoResult};

/// Current envelope version byte
pub const ENVELOPE_VERSION: u8 = 1;

/// XChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

/// DEK length
const DEK_LEN: usize = 32;

/// Wrapped DEK length: nonce || ciphertext(DEK) || tag
const WRAPPED_DEK_LEN: usize = NONCE_LEN + DEK_LEN + TAG_LEN;

fn cipher_for(key: &[u8]) -> CryptoResult<XChaCha20Poly1305> {
    XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidFormat("key must be 32 bytes".to_string()))
}

/// Encrypt a plaintext under a fresh DEK wrapped by the topic KEK.
pub fn seal_envelope(plaintext: &[u8], kek: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut dek = Zeroizing::new([0u8; DEK_LEN]);
    OsRng.fill_bytes(dek.as_mut());

    // Wrap the DEK under the topic KEK
    let mut kek_nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut kek_nonce);
    let wrapped = cipher_for(kek)?
        .encrypt(XNonce::from_slice(&kek_nonce), dek.as_ref())
        .map_err(|_| CryptoError::InvalidFormat("DEK wrap failed".to_string()))?;

    // Encrypt the payload under the DEK
    let mut data_nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut data_nonce);
    let ciphertext = cipher_for(dek.as_ref())?
        .encrypt(XNonce::from_slice(&data_nonce), plaintext)
        .map_err(|_| CryptoError::InvalidFormat("payload encryption failed".to_string()))?;

    let wrapped_len = NONCE_LEN + wrapped.len();
    debug_assert_eq!(wrapped_len, WRAPPED_DEK_LEN);

    let mut blob = Vec::with_capacity(1 + 2 + wrapped_len + NONCE_LEN + ciphertext.len());
    blob.push(ENVELOPE_VERSION);
    blob.extend_from_slice(&(wrapped_len as u16).to_be_bytes());
    blob.extend_from_slice(&kek_nonce);
    blob.extend_from_slice(&wrapped);
    blob.extend_from_slice(&data_nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt an envelope blob with the topic KEK it was sealed under.
pub fn open_envelope(blob: &[u8], kek: &[u8]) -> CryptoResult<Vec<u8>> {
    if blob.is_empty() {
        return Err(CryptoError::InvalidFormat("empty blob".to_string()));
    }
    let version = blob[0];
    if version != ENVELOPE_VERSION {
        return Err(CryptoError::VersionUnsupported(version));
    }
    if blob.len() < 3 {
        return Err(CryptoError::InvalidFormat("truncated header".to_string()));
    }
    let wrapped_len = u16::from_be_bytes([blob[1], blob[2]]) as usize;
    let body = &blob[3..];
    if wrapped_len != WRAPPED_DEK_LEN || body.len() < wrapped_len + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat("truncated envelope".to_string()));
    }

    let (wrapped, rest) = body.split_at(wrapped_len);
    let (kek_nonce, wrapped_dek) = wrapped.split_at(NONCE_LEN);
    let (data_nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let dek_bytes = cipher_for(kek)?
        .decrypt(XNonce::from_slice(kek_nonce), wrapped_dek)
        .map_err(|_| CryptoError::IntegrityFailure("DEK unwrap failed".to_string()))?;
    let dek = Zeroizing::new(dek_bytes);

    cipher_for(dek.as_ref())?
        .decrypt(XNonce::from_slice(data_nonce), ciphertext)
        .map_err(|_| CryptoError::IntegrityFailure("payload tag mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kek() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_round_trip() {
        let kek = kek();
        let blob = seal_envelope(b"the quick brown fox", &kek).unwrap();
        assert_eq!(blob[0], ENVELOPE_VERSION);
        let plaintext = open_envelope(&blob, &kek).unwrap();
        assert_eq!(plaintext, b"the quick brown fox");
    }

    #[test]
    fn test_empty_plaintext_round_trip() {
        let kek = kek();
        let blob = seal_envelope(b"", &kek).unwrap();
        assert_eq!(open_envelope(&blob, &kek).unwrap(), b"");
    }

    #[test]
    fn test_fresh_dek_per_call() {
        let kek = kek();
        let a = seal_envelope(b"same input", &kek).unwrap();
        let b = seal_envelope(b"same input", &kek).unwrap();
        // Random DEKs and nonces: identical plaintexts never produce
        // identical blobs.
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampering_any_byte_fails_integrity() {
        let kek = kek();
        let blob = seal_envelope(b"sensitive", &kek).unwrap();
        // Skip byte 0 (version) and bytes 1-2 (length): those fail as
        // version/format errors, which is also a rejection.
        for i in 3..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            let err = open_envelope(&tampered, &kek).unwrap_err();
            assert!(
                matches!(err, CryptoError::IntegrityFailure(_)),
                "byte {i} tampering produced {err:?}"
            );
        }
    }

    #[test]
    fn test_wrong_version_rejected() {
        let kek = kek();
        let mut blob = seal_envelope(b"x", &kek).unwrap();
        blob[0] = 9;
        assert!(matches!(
            open_envelope(&blob, &kek),
            Err(CryptoError::VersionUnsupported(9))
        ));
    }

    #[test]
    fn test_wrong_kek_fails() {
        let blob = seal_envelope(b"x", &kek()).unwrap();
        assert!(matches!(
            open_envelope(&blob, &kek()),
            Err(CryptoError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let kek = kek();
        let blob = seal_envelope(b"hello", &kek).unwrap();
        for len in [0, 1, 2, 10, 40] {
            let err = open_envelope(&blob[..len.min(blob.len())], &kek).unwrap_err();
            assert!(matches!(
                err,
                CryptoError::InvalidFormat(_) | CryptoError::IntegrityFailure(_)
            ));
        }
    }
}
