//! Boundary adapter
//!
//! Maps the external request surface onto core operations: resolves the
//! session principal, applies per-user rate limits, validates inputs, and
//! translates internal errors into the small stable wire taxonomy. No
//! business logic lives here.

use base64::Engine;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::boundary::auth::AuthManager;
use crate::boundary::ratelimit::{OpClass, RateLimiter};
use crate::core::{DeletionReport, IngestReceipt, MemoryCore};
use crate::deadline::{CancelToken, Deadline};
use crate::error::{CoreError, CoreResult};
use crate::model::{DecryptedItem, OutcomeKind, Tier};
use crate::rehydrate::{ContextBundle, Intent};

/// Default deadline for operations whose caller does not supply one
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Token budget bounds for queries
const MIN_TOKEN_BUDGET: usize = 100;
const MAX_TOKEN_BUDGET: usize = 5000;

/// Maximum page size for listings
const MAX_PAGE_LIMIT: usize = 200;

/// Wire-level error: stable code plus a sanitized message
#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    /// Stable taxonomy string
    pub code: &'static str,
    /// Human-readable message (no internal details)
    pub message: String,
    /// Retry hint for `rate_limited`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<CoreError> for WireError {
    fn from(err: CoreError) -> Self {
        let retry_after_secs = match &err {
            CoreError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let message = match &err {
            // Internal details never cross the boundary
            CoreError::Internal { correlation_id } => {
                format!("internal error, reference {correlation_id}")
            }
            other => other.to_string(),
        };
        WireError {
            code: err.wire_code(),
            message,
            retry_after_secs,
        }
    }
}

/// Result type at the wire boundary
pub type WireResult<T> = Result<T, WireError>;

/// Registration response; the export secret crosses the boundary exactly
/// once
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    /// Assigned user id
    pub user_id: String,
    /// Hex-encoded X25519 export secret (save it: exports are sealed to
    /// its public half)
    pub export_secret_hex: String,
}

/// Authentication response
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    /// Authenticated user id
    pub user_id: String,
    /// Opaque session token for subsequent calls
    pub token: String,
}

/// Wire view of one memory item
#[derive(Debug, Clone, Serialize)]
pub struct MemoryView {
    /// Item id
    pub id: Uuid,
    /// Topic
    pub topic: String,
    /// Decrypted text
    pub text: String,
    /// Current tier
    pub tier: Tier,
    /// Retention score
    pub score: f32,
    /// Pinned flag
    pub pinned: bool,
    /// Access counter
    pub access_count: u64,
    /// Detected PII kinds
    pub pii_kinds: Vec<String>,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last-used time
    pub last_used_at: chrono::DateTime<chrono::Utc>,
}

impl From<DecryptedItem> for MemoryView {
    fn from(item: DecryptedItem) -> Self {
        Self {
            id: item.item.id,
            topic: item.item.topic.as_str().to_string(),
            text: item.text,
            tier: item.item.tier,
            score: item.item.score,
            pinned: item.item.pinned,
            access_count: item.item.access_count,
            pii_kinds: item.item.pii_flags.kinds(),
            created_at: item.item.created_at,
            last_used_at: item.item.last_used_at,
        }
    }
}

/// A page of items
#[derive(Debug, Serialize)]
pub struct MemoryPage {
    /// Items in order
    pub items: Vec<MemoryView>,
    /// Total matches before paging
    pub total: usize,
}

/// Export response
#[derive(Debug, Serialize)]
pub struct ExportResponse {
    /// Export id
    pub export_id: Uuid,
    /// Base64 of the sealed bundle
    pub sealed_base64: String,
    /// Handle expiry
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// The typed operation surface
pub struct BoundaryAdapter {
    core: Arc<MemoryCore>,
    auth: AuthManager,
    limits: RateLimiter,
}

impl BoundaryAdapter {
    /// Wire the adapter over a core
    pub fn new(core: Arc<MemoryCore>, auth: AuthManager) -> Self {
        let limits = RateLimiter::new(core.config().rate_limits);
        Self { core, auth, limits }
    }

    /// The session manager (test and tooling access)
    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    fn resolve(&self, token: &str) -> CoreResult<String> {
        self.auth.resolve(token)
    }

    /// Register a new user
    pub fn register_user(&self, email: &str, credential: &str) -> WireResult<RegisterResponse> {
        let registered = self.auth.register(email, credential)?;
        Ok(RegisterResponse {
            user_id: registered.user_id,
            export_secret_hex: hex::encode(registered.export_secret.to_bytes()),
        })
    }

    /// Authenticate and open a session
    pub fn authenticate(
        &self,
        email: &str,
        credential: &str,
        client_ip: Option<&str>,
    ) -> WireResult<SessionResponse> {
        let principal = self.auth.authenticate(email, credential, client_ip)?;
        Ok(SessionResponse {
            user_id: principal.user_id,
            token: principal.token,
        })
    }

    /// Ingest a text artifact
    pub async fn ingest_memory(
        &self,
        token: &str,
        topic: &str,
        text: &str,
    ) -> WireResult<IngestReceipt> {
        let user_id = self.resolve(token)?;
        self.limits.check(&user_id, OpClass::Ingest)?;
        Ok(self
            .core
            .ingest(&user_id, topic, text, Deadline::after(DEFAULT_DEADLINE))
            .await?)
    }

    /// Fetch one item
    pub fn get_memory(&self, token: &str, item_id: Uuid) -> WireResult<MemoryView> {
        let user_id = self.resolve(token)?;
        Ok(self.core.get_memory(&user_id, item_id)?.into())
    }

    /// Ordered page of items
    pub fn list_memories(
        &self,
        token: &str,
        topic: Option<&str>,
        tier: Option<Tier>,
        offset: usize,
        limit: usize,
    ) -> WireResult<MemoryPage> {
        let user_id = self.resolve(token)?;
        if limit > MAX_PAGE_LIMIT {
            return Err(CoreError::Validation(format!(
                "limit must be at most {MAX_PAGE_LIMIT}"
            ))
            .into());
        }
        let (items, total) = self
            .core
            .list_memories(&user_id, topic, tier, offset, limit)?;
        Ok(MemoryPage {
            items: items.into_iter().map(MemoryView::from).collect(),
            total,
        })
    }

    /// Replace an item's text
    pub async fn edit_memory(
        &self,
        token: &str,
        item_id: Uuid,
        new_text: &str,
    ) -> WireResult<MemoryView> {
        let user_id = self.resolve(token)?;
        Ok(self
            .core
            .edit_memory(&user_id, item_id, new_text, Deadline::after(DEFAULT_DEADLINE))
            .await?
            .into())
    }

    /// Pin or unpin an item
    pub async fn pin_memory(
        &self,
        token: &str,
        item_id: Uuid,
        pinned: bool,
    ) -> WireResult<MemoryView> {
        let user_id = self.resolve(token)?;
        Ok(self.core.pin_memory(&user_id, item_id, pinned).await?.into())
    }

    /// Soft-delete an item
    pub async fn delete_memory(&self, token: &str, item_id: Uuid) -> WireResult<()> {
        let user_id = self.resolve(token)?;
        Ok(self.core.delete_memory(&user_id, item_id).await?)
    }

    /// Produce a context bundle
    #[allow(clippy::too_many_arguments)]
    pub async fn query(
        &self,
        token: &str,
        query: &str,
        topic: &str,
        intent: Option<&str>,
        token_budget: usize,
        compliance_mode: Option<bool>,
        deadline: Option<Duration>,
    ) -> WireResult<ContextBundle> {
        let user_id = self.resolve(token)?;
        self.limits.check(&user_id, OpClass::Query)?;
        if query.is_empty() {
            return Err(CoreError::Validation("query must not be empty".to_string()).into());
        }
        if !(MIN_TOKEN_BUDGET..=MAX_TOKEN_BUDGET).contains(&token_budget) {
            return Err(CoreError::Validation(format!(
                "token_budget must be {MIN_TOKEN_BUDGET}-{MAX_TOKEN_BUDGET}"
            ))
            .into());
        }
        let deadline = Deadline::after(deadline.unwrap_or(DEFAULT_DEADLINE));
        Ok(self
            .core
            .query(
                &user_id,
                query,
                topic,
                intent.map(Intent::from_tag),
                token_budget,
                compliance_mode,
                deadline,
                CancelToken::new(),
            )
            .await?)
    }

    /// Record an outcome event for a past query
    pub fn record_outcome(
        &self,
        token: &str,
        query_id: Uuid,
        kind: OutcomeKind,
    ) -> WireResult<usize> {
        let user_id = self.resolve(token)?;
        Ok(self.core.record_outcome(&user_id, query_id, kind)?)
    }

    /// Produce an export bundle sealed to the user's registered public key
    pub async fn export_memory(
        &self,
        token: &str,
        topic: Option<&str>,
    ) -> WireResult<ExportResponse> {
        let user_id = self.resolve(token)?;
        self.limits.check(&user_id, OpClass::Export)?;
        let account = self.auth.account(&user_id)?;
        let handle = self
            .core
            .export_memory(&user_id, topic, &account.export_public_key)
            .await?;
        Ok(ExportResponse {
            export_id: handle.export_id,
            sealed_base64: base64::engine::general_purpose::STANDARD.encode(&handle.sealed),
            expires_at: handle.expires_at,
        })
    }

    /// Irreversibly erase the user's memory, optionally one topic
    pub async fn delete_all_memory(
        &self,
        token: &str,
        topic: Option<&str>,
    ) -> WireResult<DeletionReport> {
        let user_id = self.resolve(token)?;
        let report = self.core.delete_all_memory(&user_id, topic).await?;
        if topic.is_none() {
            self.limits.forget_user(&user_id);
        }
        Ok(report)
    }
}
