//! Topic key manager
//!
//! Maintains per-`(user, topic)` key versions. Each version has a random
//! 32-byte seed sealed in the custody backend; the topic KEK is derived
//! from that seed with HKDF-SHA256, salt `acms_topic_kek_v1`, info = topic
//! identifier. Rotation mints a new version; records encrypted under older
//! versions stay readable via their recorded key id and are re-encrypted
//! lazily on their next write. Destroying a user's topic removes every
//! seed, making all of that topic's records unrecoverable.
//!
//! Keys are partitioned per user: identical topic names under different
//! users derive unrelated KEKs, and destroying one user's topic never
//! touches another's.
//!
//! Unwrapped KEKs are cached in memory with a short TTL; cache entries hold
//! the only long-lived references, so eviction drops and zeroizes them.

use hkdf::Hkdf;
use moka::sync::Cache;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use super::backend::{HardwareBackend, SecretBytes};
use super::envelope;
use super::{CryptoError, CryptoResult};
use crate::model::TopicId;

const TOPIC_KEK_SALT: &[u8] = b"acms_topic_kek_v1";
const SEED_LEN: usize = 32;
const KEY_CACHE_TTL: Duration = Duration::from_secs(120);
const KEY_CACHE_CAPACITY: u64 = 256;

/// Identifier of a topic key version, recorded on every encrypted record.
/// The owning user is implicit in the record; key ids only name the topic
/// and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId {
    /// Topic the key belongs to
    pub topic: TopicId,
    /// Key version, starting at 1
    pub version: u32,
}

impl KeyId {
    /// Render as the stable `topic/vN` form stored on records
    pub fn encode(&self) -> String {
        format!("{}/v{}", self.topic, self.version)
    }

    /// Parse the `topic/vN` form
    pub fn decode(raw: &str) -> CryptoResult<Self> {
        let (topic_raw, version_raw) = raw
            .rsplit_once("/v")
            .ok_or_else(|| CryptoError::InvalidFormat(format!("bad key id '{raw}'")))?;
        let topic = TopicId::new(topic_raw)
            .map_err(|_| CryptoError::InvalidFormat(format!("bad key id topic '{topic_raw}'")))?;
        let version: u32 = version_raw
            .parse()
            .map_err(|_| CryptoError::InvalidFormat(format!("bad key id version '{version_raw}'")))?;
        Ok(Self { topic, version })
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/v{}", self.topic, self.version)
    }
}

/// Per-user, per-topic envelope key manager
pub struct KeyManager {
    backend: Arc<dyn HardwareBackend>,
    /// `user \x00 topic/vN` → unwrapped KEK; entries zeroize when evicted
    cache: Cache<String, Arc<SecretBytes>>,
}

impl KeyManager {
    /// Create a manager over the given custody backend
    pub fn new(backend: Arc<dyn HardwareBackend>) -> Self {
        Self {
            backend,
            cache: Cache::builder()
                .max_capacity(KEY_CACHE_CAPACITY)
                .time_to_live(KEY_CACHE_TTL)
                .support_invalidation_closures()
                .build(),
        }
    }

    /// Name of the underlying custody backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn seed_handle(user_id: &str, topic: &TopicId, version: u32) -> String {
        format!("topic_seed/{user_id}/{topic}/v{version}")
    }

    fn seed_prefix(user_id: &str, topic: &TopicId) -> String {
        format!("topic_seed/{user_id}/{topic}/v")
    }

    fn cache_key(user_id: &str, key_id: &KeyId) -> String {
        format!("{user_id}\x00{}", key_id.encode())
    }

    /// Current key version for a user's topic, 0 if none exists yet
    fn current_version(&self, user_id: &str, topic: &TopicId) -> CryptoResult<u32> {
        let prefix = Self::seed_prefix(user_id, topic);
        let handles = self.backend.list_handles(&prefix)?;
        Ok(handles
            .iter()
            .filter_map(|h| h.strip_prefix(&prefix).and_then(|v| v.parse::<u32>().ok()))
            .max()
            .unwrap_or(0))
    }

    /// The current key id for a user's topic, creating version 1 if none
    /// exists
    pub fn current_key_id(&self, user_id: &str, topic: &TopicId) -> CryptoResult<KeyId> {
        let version = self.current_version(user_id, topic)?;
        if version > 0 {
            return Ok(KeyId {
                topic: topic.clone(),
                version,
            });
        }
        let seed = SecretBytes::random(SEED_LEN);
        self.backend
            .seal(&Self::seed_handle(user_id, topic, 1), seed.expose())?;
        tracing::debug!(user_id, topic = %topic, "created initial topic key");
        Ok(KeyId {
            topic: topic.clone(),
            version: 1,
        })
    }

    /// Derive (or fetch from cache) the KEK for a key id
    fn topic_kek(&self, user_id: &str, key_id: &KeyId) -> CryptoResult<Arc<SecretBytes>> {
        let cache_key = Self::cache_key(user_id, key_id);
        if let Some(kek) = self.cache.get(&cache_key) {
            return Ok(kek);
        }
        let seed = self
            .backend
            .unseal(&Self::seed_handle(user_id, &key_id.topic, key_id.version))?;
        let hk = Hkdf::<Sha256>::new(Some(TOPIC_KEK_SALT), seed.expose());
        let mut okm = [0u8; 32];
        hk.expand(key_id.topic.as_str().as_bytes(), &mut okm)
            .map_err(|_| CryptoError::KeyUnavailable("HKDF expansion failed".to_string()))?;
        let kek = Arc::new(SecretBytes::new(okm.to_vec()));
        self.cache.insert(cache_key, kek.clone());
        Ok(kek)
    }

    /// Encrypt a plaintext under the topic's current key.
    ///
    /// Returns the envelope blob and the key id to record on the item.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        user_id: &str,
        topic: &TopicId,
    ) -> CryptoResult<(Vec<u8>, KeyId)> {
        let key_id = self.current_key_id(user_id, topic)?;
        let kek = self.topic_kek(user_id, &key_id)?;
        let blob = envelope::seal_envelope(plaintext, kek.expose())?;
        Ok((blob, key_id))
    }

    /// Decrypt an envelope blob under its recorded key id
    pub fn decrypt(&self, blob: &[u8], user_id: &str, key_id: &KeyId) -> CryptoResult<Vec<u8>> {
        let kek = self.topic_kek(user_id, key_id)?;
        envelope::open_envelope(blob, kek.expose())
    }

    /// Whether a record under `key_id` should be re-encrypted on its next
    /// write (an older version than current)
    pub fn is_stale(&self, user_id: &str, key_id: &KeyId) -> CryptoResult<bool> {
        Ok(key_id.version < self.current_version(user_id, &key_id.topic)?)
    }

    /// Mint a new key version for a user's topic. Existing records stay
    /// readable under their recorded key ids.
    pub fn rotate_topic(&self, user_id: &str, topic: &TopicId) -> CryptoResult<u32> {
        let next = self.current_version(user_id, topic)? + 1;
        let seed = SecretBytes::random(SEED_LEN);
        self.backend
            .seal(&Self::seed_handle(user_id, topic, next), seed.expose())?;
        tracing::info!(user_id, topic = %topic, version = next, "rotated topic key");
        Ok(next)
    }

    /// Unrecoverably remove every key version for a user's topic
    pub fn destroy_topic_keys(&self, user_id: &str, topic: &TopicId) -> CryptoResult<()> {
        for handle in self.backend.list_handles(&Self::seed_prefix(user_id, topic))? {
            self.backend.destroy(&handle)?;
        }
        // Drop any cached KEKs for this user's topic immediately
        let cache_prefix = format!("{user_id}\x00{topic}/v");
        self.cache
            .invalidate_entries_if(move |k, _| k.starts_with(&cache_prefix))
            .map_err(|e| CryptoError::Backend {
                backend: "key_cache".to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!(user_id, topic = %topic, "destroyed all topic keys");
        Ok(())
    }

    /// Every `(user, topic)` pair that currently has at least one key
    /// version
    pub fn keyed_topics(&self) -> CryptoResult<Vec<(String, TopicId)>> {
        let handles = self.backend.list_handles("topic_seed/")?;
        let mut topics: Vec<(String, TopicId)> = handles
            .iter()
            .filter_map(|h| h.strip_prefix("topic_seed/"))
            .filter_map(|rest| {
                let (user_and_topic, _) = rest.rsplit_once("/v")?;
                let (user, topic) = user_and_topic.split_once('/')?;
                Some((user.to_string(), TopicId::new(topic).ok()?))
            })
            .collect();
        topics.sort();
        topics.dedup();
        Ok(topics)
    }
}
