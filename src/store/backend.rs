//! Persistent record storage
//!
//! Closed set of storage backends behind the [`StoreBackend`] trait:
//! [`SledBackend`] (embedded, durable) and [`MemoryBackend`] (process-local,
//! used by tests and ephemeral cores). Records are `bincode`-encoded; event
//! families are append-only with backend-assigned sequence numbers that
//! define the per-user commit order.
//!
//! Key layout: `user_id \x00 suffix`, where the suffix is the item uuid,
//! the big-endian sequence number, or the record-specific id. Scanning a
//! user is a prefix scan.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::model::{MemoryItem, QueryLogRecord, UserProfile};

/// Append-only event families kept per user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    /// Tier transition events
    TierTransition,
    /// Consolidation events
    Consolidation,
    /// Audit events
    Audit,
    /// Outcome events (also embedded in items; this family is the export
    /// and audit trail)
    Outcome,
}

impl EventFamily {
    fn tree_name(&self) -> &'static str {
        match self {
            EventFamily::TierTransition => "events_transitions",
            EventFamily::Consolidation => "events_consolidations",
            EventFamily::Audit => "events_audit",
            EventFamily::Outcome => "events_outcomes",
        }
    }

    /// All families, used by erasure cascades
    pub fn all() -> [EventFamily; 4] {
        [
            EventFamily::TierTransition,
            EventFamily::Consolidation,
            EventFamily::Audit,
            EventFamily::Outcome,
        ]
    }
}

/// A registered user account
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct UserAccount {
    /// Opaque user id
    pub user_id: String,
    /// Login email, unique
    pub email: String,
    /// Argon2id credential hash
    pub credential_hash: String,
    /// X25519 public key exports are encrypted to
    pub export_public_key: [u8; 32],
    /// Registration time
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A recorded consent token for promoting PII-flagged items
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ConsentRecord {
    /// Consenting user
    pub user_id: String,
    /// Topic the consent covers
    pub topic: crate::model::TopicId,
    /// PII kinds the consent covers
    pub pii_kinds: Vec<String>,
    /// When consent was recorded
    pub granted_at: chrono::DateTime<chrono::Utc>,
}

/// Storage backend interface. The set of implementations is closed.
pub trait StoreBackend: Send + Sync {
    /// Backend name for errors and audit
    fn name(&self) -> &'static str;

    /// Insert or overwrite an item record
    fn put_item(&self, item: &MemoryItem) -> StoreResult<()>;
    /// Write an updated item only if the stored record still carries
    /// `expected_version`; returns whether the swap happened
    fn swap_item(&self, updated: &MemoryItem, expected_version: u64) -> StoreResult<bool>;
    /// Fetch an item in the user's scope
    fn get_item(&self, user_id: &str, item_id: Uuid) -> StoreResult<Option<MemoryItem>>;
    /// Physically remove an item; returns whether it existed
    fn delete_item(&self, user_id: &str, item_id: Uuid) -> StoreResult<bool>;
    /// All items for a user
    fn scan_items(&self, user_id: &str) -> StoreResult<Vec<MemoryItem>>;
    /// All user ids with at least one item
    fn item_user_ids(&self) -> StoreResult<Vec<String>>;

    /// Atomically persist a consolidation: the consolidated item plus the
    /// archived source records commit together or not at all.
    fn apply_consolidation(
        &self,
        consolidated: &MemoryItem,
        archived_sources: &[MemoryItem],
    ) -> StoreResult<()>;

    /// Insert or overwrite a user profile
    fn put_profile(&self, profile: &UserProfile) -> StoreResult<()>;
    /// Fetch a user profile
    fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>>;
    /// Remove a user profile
    fn delete_profile(&self, user_id: &str) -> StoreResult<()>;

    /// Insert or overwrite a user account
    fn put_user(&self, account: &UserAccount) -> StoreResult<()>;
    /// Look up an account by email
    fn get_user_by_email(&self, email: &str) -> StoreResult<Option<UserAccount>>;
    /// Look up an account by user id
    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>>;
    /// Remove a user account
    fn delete_user(&self, user_id: &str) -> StoreResult<()>;

    /// Record a consent token
    fn put_consent(&self, consent: &ConsentRecord) -> StoreResult<()>;
    /// All consents a user has recorded for a topic
    fn consents_for(&self, user_id: &str, topic: &crate::model::TopicId)
        -> StoreResult<Vec<ConsentRecord>>;

    /// Append an event, returning its assigned sequence number
    fn append_event(&self, family: EventFamily, user_id: &str, payload: &[u8]) -> StoreResult<u64>;
    /// Write an item and append an event in one atomic commit (tier
    /// transitions pair the moved item with its transition event)
    fn put_item_with_event(
        &self,
        item: &MemoryItem,
        family: EventFamily,
        payload: &[u8],
    ) -> StoreResult<u64>;
    /// Read a user's events in sequence order
    fn read_events(&self, family: EventFamily, user_id: &str) -> StoreResult<Vec<(u64, Vec<u8>)>>;
    /// The most recently appended event, if any
    fn last_event(&self, family: EventFamily, user_id: &str) -> StoreResult<Option<(u64, Vec<u8>)>>;
    /// Drop all of a user's events in a family (erasure cascade)
    fn delete_user_events(&self, family: EventFamily, user_id: &str) -> StoreResult<()>;

    /// Insert a query log record
    fn put_query_log(&self, record: &QueryLogRecord) -> StoreResult<()>;
    /// Fetch a query log record by id
    fn get_query_log(&self, user_id: &str, query_id: Uuid)
        -> StoreResult<Option<QueryLogRecord>>;
    /// Drop all of a user's query logs (erasure cascade)
    fn delete_user_query_logs(&self, user_id: &str) -> StoreResult<()>;
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn user_key(user_id: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 1 + suffix.len());
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    key.extend_from_slice(suffix);
    key
}

fn user_prefix(user_id: &str) -> Vec<u8> {
    user_key(user_id, &[])
}

// ============================================================================
// Sled backend
// ============================================================================

/// Durable embedded backend over sled
pub struct SledBackend {
    db: sled::Db,
    items: sled::Tree,
    profiles: sled::Tree,
    users: sled::Tree,
    users_by_email: sled::Tree,
    consents: sled::Tree,
    query_logs: sled::Tree,
}

impl SledBackend {
    /// Open the store under the platform data directory
    /// (`<data_dir>/acms/store`)
    pub fn open_default() -> StoreResult<Self> {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        Self::open(&base.join("acms").join("store"))
    }

    /// Open (or create) the store at the given directory
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            items: db.open_tree("items")?,
            profiles: db.open_tree("profiles")?,
            users: db.open_tree("users")?,
            users_by_email: db.open_tree("users_by_email")?,
            consents: db.open_tree("consents")?,
            query_logs: db.open_tree("query_logs")?,
            db,
        })
    }

    fn event_tree(&self, family: EventFamily) -> StoreResult<sled::Tree> {
        Ok(self.db.open_tree(family.tree_name())?)
    }
}

impl StoreBackend for SledBackend {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn put_item(&self, item: &MemoryItem) -> StoreResult<()> {
        let key = user_key(&item.user_id, item.id.as_bytes());
        self.items.insert(key, encode(item)?)?;
        Ok(())
    }

    fn swap_item(&self, updated: &MemoryItem, expected_version: u64) -> StoreResult<bool> {
        let key = user_key(&updated.user_id, updated.id.as_bytes());
        let Some(current) = self.items.get(&key)? else {
            return Ok(false);
        };
        let stored: MemoryItem = decode(&current)?;
        if stored.record_version != expected_version {
            return Ok(false);
        }
        let swapped = self
            .items
            .compare_and_swap(&key, Some(current), Some(encode(updated)?))?
            .is_ok();
        Ok(swapped)
    }

    fn get_item(&self, user_id: &str, item_id: Uuid) -> StoreResult<Option<MemoryItem>> {
        let key = user_key(user_id, item_id.as_bytes());
        match self.items.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_item(&self, user_id: &str, item_id: Uuid) -> StoreResult<bool> {
        let key = user_key(user_id, item_id.as_bytes());
        Ok(self.items.remove(key)?.is_some())
    }

    fn scan_items(&self, user_id: &str) -> StoreResult<Vec<MemoryItem>> {
        let mut items = Vec::new();
        for entry in self.items.scan_prefix(user_prefix(user_id)) {
            let (_, bytes) = entry?;
            items.push(decode(&bytes)?);
        }
        Ok(items)
    }

    fn item_user_ids(&self) -> StoreResult<Vec<String>> {
        let mut users = Vec::new();
        for entry in self.items.iter() {
            let (key, _) = entry?;
            if let Some(pos) = key.iter().position(|b| *b == 0) {
                if let Ok(user) = std::str::from_utf8(&key[..pos]) {
                    if users.last().map(String::as_str) != Some(user) {
                        users.push(user.to_string());
                    }
                }
            }
        }
        users.sort();
        users.dedup();
        Ok(users)
    }

    fn apply_consolidation(
        &self,
        consolidated: &MemoryItem,
        archived_sources: &[MemoryItem],
    ) -> StoreResult<()> {
        let mut writes: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(archived_sources.len() + 1);
        writes.push((
            user_key(&consolidated.user_id, consolidated.id.as_bytes()),
            encode(consolidated)?,
        ));
        for source in archived_sources {
            writes.push((user_key(&source.user_id, source.id.as_bytes()), encode(source)?));
        }

        let result: Result<(), sled::transaction::TransactionError<()>> =
            self.items.transaction(|tx| {
                for (key, value) in &writes {
                    tx.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            });
        result.map_err(|e| StoreError::Backend(format!("consolidation commit failed: {e:?}")))
    }

    fn put_profile(&self, profile: &UserProfile) -> StoreResult<()> {
        self.profiles
            .insert(profile.user_id.as_bytes(), encode(profile)?)?;
        Ok(())
    }

    fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        match self.profiles.get(user_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_profile(&self, user_id: &str) -> StoreResult<()> {
        self.profiles.remove(user_id.as_bytes())?;
        Ok(())
    }

    fn put_user(&self, account: &UserAccount) -> StoreResult<()> {
        self.users.insert(account.user_id.as_bytes(), encode(account)?)?;
        self.users_by_email
            .insert(account.email.as_bytes(), account.user_id.as_bytes())?;
        Ok(())
    }

    fn get_user_by_email(&self, email: &str) -> StoreResult<Option<UserAccount>> {
        match self.users_by_email.get(email.as_bytes())? {
            Some(user_id_bytes) => {
                let user_id = std::str::from_utf8(&user_id_bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.get_user(user_id)
            }
            None => Ok(None),
        }
    }

    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        match self.users.get(user_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_user(&self, user_id: &str) -> StoreResult<()> {
        if let Some(account) = self.get_user(user_id)? {
            self.users_by_email.remove(account.email.as_bytes())?;
        }
        self.users.remove(user_id.as_bytes())?;
        Ok(())
    }

    fn put_consent(&self, consent: &ConsentRecord) -> StoreResult<()> {
        let suffix = format!("{}\x00{}", consent.topic, consent.granted_at.timestamp_nanos_opt().unwrap_or(0));
        let key = user_key(&consent.user_id, suffix.as_bytes());
        self.consents.insert(key, encode(consent)?)?;
        Ok(())
    }

    fn consents_for(
        &self,
        user_id: &str,
        topic: &crate::model::TopicId,
    ) -> StoreResult<Vec<ConsentRecord>> {
        let prefix = user_key(user_id, format!("{topic}\x00").as_bytes());
        let mut consents = Vec::new();
        for entry in self.consents.scan_prefix(prefix) {
            let (_, bytes) = entry?;
            consents.push(decode(&bytes)?);
        }
        Ok(consents)
    }

    fn append_event(&self, family: EventFamily, user_id: &str, payload: &[u8]) -> StoreResult<u64> {
        let sequence = self.db.generate_id()?;
        let tree = self.event_tree(family)?;
        tree.insert(user_key(user_id, &sequence.to_be_bytes()), payload)?;
        Ok(sequence)
    }

    fn put_item_with_event(
        &self,
        item: &MemoryItem,
        family: EventFamily,
        payload: &[u8],
    ) -> StoreResult<u64> {
        let sequence = self.db.generate_id()?;
        let item_key = user_key(&item.user_id, item.id.as_bytes());
        let item_bytes = encode(item)?;
        let event_key = user_key(&item.user_id, &sequence.to_be_bytes());
        let event_tree = self.event_tree(family)?;

        use sled::Transactional;
        let result: Result<(), sled::transaction::TransactionError<()>> =
            (&self.items, &event_tree).transaction(|(items, events)| {
                items.insert(item_key.as_slice(), item_bytes.as_slice())?;
                events.insert(event_key.as_slice(), payload)?;
                Ok(())
            });
        result.map_err(|e| StoreError::Backend(format!("item+event commit failed: {e:?}")))?;
        Ok(sequence)
    }

    fn read_events(&self, family: EventFamily, user_id: &str) -> StoreResult<Vec<(u64, Vec<u8>)>> {
        let tree = self.event_tree(family)?;
        let prefix = user_prefix(user_id);
        let mut events = Vec::new();
        for entry in tree.scan_prefix(&prefix) {
            let (key, value) = entry?;
            let seq_bytes = &key[prefix.len()..];
            if seq_bytes.len() == 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(seq_bytes);
                events.push((u64::from_be_bytes(buf), value.to_vec()));
            }
        }
        Ok(events)
    }

    fn last_event(&self, family: EventFamily, user_id: &str) -> StoreResult<Option<(u64, Vec<u8>)>> {
        Ok(self.read_events(family, user_id)?.pop())
    }

    fn delete_user_events(&self, family: EventFamily, user_id: &str) -> StoreResult<()> {
        let tree = self.event_tree(family)?;
        let keys: Vec<_> = tree
            .scan_prefix(user_prefix(user_id))
            .filter_map(|e| e.ok().map(|(k, _)| k))
            .collect();
        for key in keys {
            tree.remove(key)?;
        }
        Ok(())
    }

    fn put_query_log(&self, record: &QueryLogRecord) -> StoreResult<()> {
        let key = user_key(&record.user_id, record.query_id.as_bytes());
        self.query_logs.insert(key, encode(record)?)?;
        Ok(())
    }

    fn get_query_log(
        &self,
        user_id: &str,
        query_id: Uuid,
    ) -> StoreResult<Option<QueryLogRecord>> {
        match self.query_logs.get(user_key(user_id, query_id.as_bytes()))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_user_query_logs(&self, user_id: &str) -> StoreResult<()> {
        let keys: Vec<_> = self
            .query_logs
            .scan_prefix(user_prefix(user_id))
            .filter_map(|e| e.ok().map(|(k, _)| k))
            .collect();
        for key in keys {
            self.query_logs.remove(key)?;
        }
        Ok(())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<Vec<u8>, Vec<u8>>,
    profiles: BTreeMap<String, Vec<u8>>,
    users: BTreeMap<String, Vec<u8>>,
    users_by_email: BTreeMap<String, String>,
    consents: BTreeMap<Vec<u8>, Vec<u8>>,
    query_logs: BTreeMap<Vec<u8>, Vec<u8>>,
    events: BTreeMap<(&'static str, Vec<u8>), Vec<u8>>,
}

/// Process-local backend with the same semantics as [`SledBackend`]
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    sequence: AtomicU64,
}

impl MemoryBackend {
    /// Fresh empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

fn range_with_prefix<'a, V: Clone>(
    map: &'a BTreeMap<Vec<u8>, V>,
    prefix: &[u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a V)> {
    let prefix = prefix.to_vec();
    map.range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
}

impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put_item(&self, item: &MemoryItem) -> StoreResult<()> {
        let key = user_key(&item.user_id, item.id.as_bytes());
        self.state.lock().items.insert(key, encode(item)?);
        Ok(())
    }

    fn swap_item(&self, updated: &MemoryItem, expected_version: u64) -> StoreResult<bool> {
        let key = user_key(&updated.user_id, updated.id.as_bytes());
        let encoded = encode(updated)?;
        let mut state = self.state.lock();
        let Some(current) = state.items.get(&key) else {
            return Ok(false);
        };
        let stored: MemoryItem = decode(current)?;
        if stored.record_version != expected_version {
            return Ok(false);
        }
        state.items.insert(key, encoded);
        Ok(true)
    }

    fn get_item(&self, user_id: &str, item_id: Uuid) -> StoreResult<Option<MemoryItem>> {
        let key = user_key(user_id, item_id.as_bytes());
        match self.state.lock().items.get(&key) {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_item(&self, user_id: &str, item_id: Uuid) -> StoreResult<bool> {
        let key = user_key(user_id, item_id.as_bytes());
        Ok(self.state.lock().items.remove(&key).is_some())
    }

    fn scan_items(&self, user_id: &str) -> StoreResult<Vec<MemoryItem>> {
        let state = self.state.lock();
        range_with_prefix(&state.items, &user_prefix(user_id))
            .map(|(_, bytes)| decode(bytes))
            .collect()
    }

    fn item_user_ids(&self) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        let mut users: Vec<String> = state
            .items
            .keys()
            .filter_map(|key| {
                key.iter()
                    .position(|b| *b == 0)
                    .and_then(|pos| std::str::from_utf8(&key[..pos]).ok())
                    .map(str::to_string)
            })
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    fn apply_consolidation(
        &self,
        consolidated: &MemoryItem,
        archived_sources: &[MemoryItem],
    ) -> StoreResult<()> {
        // Encode everything first so the mutation below cannot fail halfway
        let mut writes = vec![(
            user_key(&consolidated.user_id, consolidated.id.as_bytes()),
            encode(consolidated)?,
        )];
        for source in archived_sources {
            writes.push((user_key(&source.user_id, source.id.as_bytes()), encode(source)?));
        }
        let mut state = self.state.lock();
        for (key, value) in writes {
            state.items.insert(key, value);
        }
        Ok(())
    }

    fn put_profile(&self, profile: &UserProfile) -> StoreResult<()> {
        self.state
            .lock()
            .profiles
            .insert(profile.user_id.clone(), encode(profile)?);
        Ok(())
    }

    fn get_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        match self.state.lock().profiles.get(user_id) {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_profile(&self, user_id: &str) -> StoreResult<()> {
        self.state.lock().profiles.remove(user_id);
        Ok(())
    }

    fn put_user(&self, account: &UserAccount) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.users.insert(account.user_id.clone(), encode(account)?);
        state
            .users_by_email
            .insert(account.email.clone(), account.user_id.clone());
        Ok(())
    }

    fn get_user_by_email(&self, email: &str) -> StoreResult<Option<UserAccount>> {
        let state = self.state.lock();
        match state.users_by_email.get(email) {
            Some(user_id) => match state.users.get(user_id) {
                Some(bytes) => Ok(Some(decode(bytes)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        match self.state.lock().users.get(user_id) {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_user(&self, user_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(bytes) = state.users.remove(user_id) {
            if let Ok(account) = decode::<UserAccount>(&bytes) {
                state.users_by_email.remove(&account.email);
            }
        }
        Ok(())
    }

    fn put_consent(&self, consent: &ConsentRecord) -> StoreResult<()> {
        let suffix = format!(
            "{}\x00{}",
            consent.topic,
            consent.granted_at.timestamp_nanos_opt().unwrap_or(0)
        );
        let key = user_key(&consent.user_id, suffix.as_bytes());
        self.state.lock().consents.insert(key, encode(consent)?);
        Ok(())
    }

    fn consents_for(
        &self,
        user_id: &str,
        topic: &crate::model::TopicId,
    ) -> StoreResult<Vec<ConsentRecord>> {
        let state = self.state.lock();
        let prefix = user_key(user_id, format!("{topic}\x00").as_bytes());
        range_with_prefix(&state.consents, &prefix)
            .map(|(_, bytes)| decode(bytes))
            .collect()
    }

    fn append_event(&self, family: EventFamily, user_id: &str, payload: &[u8]) -> StoreResult<u64> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let key = user_key(user_id, &sequence.to_be_bytes());
        self.state
            .lock()
            .events
            .insert((family.tree_name(), key), payload.to_vec());
        Ok(sequence)
    }

    fn put_item_with_event(
        &self,
        item: &MemoryItem,
        family: EventFamily,
        payload: &[u8],
    ) -> StoreResult<u64> {
        let item_key = user_key(&item.user_id, item.id.as_bytes());
        let item_bytes = encode(item)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event_key = user_key(&item.user_id, &sequence.to_be_bytes());
        let mut state = self.state.lock();
        state.items.insert(item_key, item_bytes);
        state
            .events
            .insert((family.tree_name(), event_key), payload.to_vec());
        Ok(sequence)
    }

    fn read_events(&self, family: EventFamily, user_id: &str) -> StoreResult<Vec<(u64, Vec<u8>)>> {
        let state = self.state.lock();
        let prefix = user_prefix(user_id);
        let tree = family.tree_name();
        let mut events = Vec::new();
        for ((name, key), value) in state.events.iter() {
            if *name != tree || !key.starts_with(&prefix) {
                continue;
            }
            let seq_bytes = &key[prefix.len()..];
            if seq_bytes.len() == 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(seq_bytes);
                events.push((u64::from_be_bytes(buf), value.clone()));
            }
        }
        events.sort_by_key(|(seq, _)| *seq);
        Ok(events)
    }

    fn last_event(&self, family: EventFamily, user_id: &str) -> StoreResult<Option<(u64, Vec<u8>)>> {
        Ok(self.read_events(family, user_id)?.pop())
    }

    fn delete_user_events(&self, family: EventFamily, user_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let prefix = user_prefix(user_id);
        let tree = family.tree_name();
        state
            .events
            .retain(|(name, key), _| !(*name == tree && key.starts_with(&prefix)));
        Ok(())
    }

    fn put_query_log(&self, record: &QueryLogRecord) -> StoreResult<()> {
        let key = user_key(&record.user_id, record.query_id.as_bytes());
        self.state.lock().query_logs.insert(key, encode(record)?);
        Ok(())
    }

    fn get_query_log(
        &self,
        user_id: &str,
        query_id: Uuid,
    ) -> StoreResult<Option<QueryLogRecord>> {
        let key = user_key(user_id, query_id.as_bytes());
        match self.state.lock().query_logs.get(&key) {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_user_query_logs(&self, user_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let prefix = user_prefix(user_id);
        state.query_logs.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
