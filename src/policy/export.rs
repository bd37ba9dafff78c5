//! Export bundles
//!
//! A self-describing document of everything a user owns: profile, memory
//! items (plaintext in the bundle), and audit trail. The JSON document is
//! gzip-compressed and then sealed to the user's X25519 public key (ECIES:
//! ephemeral key agreement + HKDF-SHA256 + XChaCha20-Poly1305), so only the
//! holder of the user's export secret can open it.
//!
//! The same format drives re-import: an opened bundle reproduces the items
//! up to encryption metadata.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::{Read, Write};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};

use crate::audit::AuditEvent;
use crate::config::CrsConfig;
use crate::crypto::{CryptoError, CryptoResult};
use crate::model::{OutcomeEvent, PiiFlags, Tier, TopicId};

const ECIES_SALT: &[u8] = b"ECIES-v1";
const ECIES_INFO: &[u8] = b"acms_export";
const ECIES_NONCE_LEN: usize = 24;

/// Export format version recorded in the bundle metadata
pub const EXPORT_FORMAT_VERSION: u8 = 1;

/// Bundle header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    /// Unique export id
    pub export_id: Uuid,
    /// Exporting user
    pub user_id: String,
    /// Generation time
    pub generated_at: DateTime<Utc>,
    /// Bundle format version
    pub format_version: u8,
    /// Item schema version at export time
    pub schema_version: u16,
}

/// Exported user profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedProfile {
    /// User id
    pub user_id: String,
    /// Account creation time
    pub created_at: DateTime<Utc>,
    /// CRS configuration in force at export time
    pub crs: CrsConfig,
}

/// One exported memory item, plaintext
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedItem {
    /// Item id
    pub id: Uuid,
    /// Topic
    pub topic: TopicId,
    /// Decrypted text
    pub text: String,
    /// Decrypted embedding
    pub vector: Vec<f32>,
    /// Tier at export time
    pub tier: Tier,
    /// Retention score
    pub score: f32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Last-used time
    pub last_used_at: DateTime<Utc>,
    /// Access counter
    pub access_count: u64,
    /// PII flags
    pub pii_flags: PiiFlags,
    /// Outcome log
    pub outcomes: Vec<OutcomeEvent>,
    /// Pinned flag
    pub pinned: bool,
    /// Archived flag
    pub archived: bool,
    /// Consolidation sources, if any
    pub source_items: Option<Vec<Uuid>>,
    /// Embedding backend that produced the vector
    pub embedding_backend: String,
}

/// The complete, self-describing export document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBundle {
    /// Human-readable schema description
    pub readme: String,
    /// Header
    pub metadata: ExportMetadata,
    /// Profile
    pub profile: ExportedProfile,
    /// All items, including archived ones
    pub items: Vec<ExportedItem>,
    /// Full audit trail
    pub audit_trail: Vec<AuditEvent>,
}

impl ExportBundle {
    /// Assemble a bundle with a generated README
    pub fn new(
        user_id: &str,
        profile: ExportedProfile,
        items: Vec<ExportedItem>,
        audit_trail: Vec<AuditEvent>,
    ) -> Self {
        let metadata = ExportMetadata {
            export_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            generated_at: Utc::now(),
            format_version: EXPORT_FORMAT_VERSION,
            schema_version: crate::model::SCHEMA_VERSION,
        };
        let readme = format!(
            "ACMS memory export, format v{} (item schema v{}).\n\
             Sections: metadata, profile (CRS configuration), items \
             (plaintext text and vectors with tier/score/usage attributes), \
             audit_trail (chain-hashed events).\n\
             The bundle file is gzip-compressed JSON sealed to the user's \
             X25519 export key.",
            metadata.format_version, metadata.schema_version,
        );
        Self {
            readme,
            metadata,
            profile,
            items,
            audit_trail,
        }
    }

    /// Compress and seal the bundle to a recipient public key
    pub fn seal(&self, recipient: &[u8; 32]) -> CryptoResult<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| CryptoError::InvalidFormat(format!("bundle encode: {e}")))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| CryptoError::InvalidFormat(format!("bundle compress: {e}")))
            .and_then(|compressed| ecies_seal(recipient, &compressed))
    }

    /// Open a sealed bundle with the recipient's secret
    pub fn open(sealed: &[u8], secret: &StaticSecret) -> CryptoResult<Self> {
        let compressed = ecies_open(secret, sealed)?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| CryptoError::InvalidFormat(format!("bundle decompress: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| CryptoError::InvalidFormat(format!("bundle decode: {e}")))
    }
}

fn ecies_key(shared_secret: &[u8]) -> CryptoResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(ECIES_SALT), shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(ECIES_INFO, &mut okm)
        .map_err(|_| CryptoError::InvalidFormat("HKDF expansion failed".to_string()))?;
    Ok(okm)
}

/// Seal bytes to an X25519 public key: `ephemeral_pk || nonce || ciphertext`
pub fn ecies_seal(recipient: &[u8; 32], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&PublicKey::from(*recipient));
    let key = ecies_key(shared.as_bytes())?;

    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| CryptoError::InvalidFormat("bad derived key".to_string()))?;
    let mut nonce = [0u8; ECIES_NONCE_LEN];
    use rand::RngCore;
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::InvalidFormat("ECIES encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(32 + ECIES_NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open an ECIES blob with the recipient's secret key
pub fn ecies_open(secret: &StaticSecret, blob: &[u8]) -> CryptoResult<Vec<u8>> {
    if blob.len() < 32 + ECIES_NONCE_LEN + 16 {
        return Err(CryptoError::InvalidFormat("ECIES blob too short".to_string()));
    }
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&blob[..32]);
    let (nonce, ciphertext) = blob[32..].split_at(ECIES_NONCE_LEN);

    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral));
    let key = ecies_key(shared.as_bytes())?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| CryptoError::InvalidFormat("bad derived key".to_string()))?;
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::IntegrityFailure("ECIES tag mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle() -> ExportBundle {
        let profile = ExportedProfile {
            user_id: "u1".to_string(),
            created_at: Utc::now(),
            crs: CrsConfig::default(),
        };
        let items = vec![ExportedItem {
            id: Uuid::new_v4(),
            topic: TopicId::new("work").unwrap(),
            text: "Security audit Q3 2024 recommended enabling HSTS.".to_string(),
            vector: vec![0.1, 0.2, 0.3],
            tier: Tier::Mid,
            score: 0.7,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_used_at: Utc::now(),
            access_count: 4,
            pii_flags: PiiFlags::none(),
            outcomes: Vec::new(),
            pinned: false,
            archived: false,
            source_items: None,
            embedding_backend: "test".to_string(),
        }];
        ExportBundle::new("u1", profile, items, Vec::new())
    }

    #[test]
    fn test_seal_open_round_trip() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let bundle = sample_bundle();
        let sealed = bundle.seal(public.as_bytes()).unwrap();
        let opened = ExportBundle::open(&sealed, &secret).unwrap();

        assert_eq!(opened.metadata.export_id, bundle.metadata.export_id);
        assert_eq!(opened.items.len(), 1);
        assert_eq!(opened.items[0].text, bundle.items[0].text);
        assert_eq!(opened.items[0].vector, bundle.items[0].vector);
    }

    #[test]
    fn test_wrong_secret_cannot_open() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let other = StaticSecret::random_from_rng(OsRng);

        let sealed = sample_bundle().seal(public.as_bytes()).unwrap();
        assert!(ExportBundle::open(&sealed, &other).is_err());
    }

    #[test]
    fn test_tampered_bundle_fails_integrity() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let mut sealed = sample_bundle().seal(public.as_bytes()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            ExportBundle::open(&sealed, &secret),
            Err(CryptoError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_readme_describes_schema_version() {
        let bundle = sample_bundle();
        assert!(bundle.readme.contains("format v1"));
        assert!(bundle
            .readme
            .contains(&format!("schema v{}", crate::model::SCHEMA_VERSION)));
    }

    #[test]
    fn test_ecies_rejects_truncated_blob() {
        let secret = StaticSecret::random_from_rng(OsRng);
        assert!(ecies_open(&secret, &[0u8; 10]).is_err());
    }
}
