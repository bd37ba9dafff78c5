//! Registration, authentication, and sessions
//!
//! Credentials are stored as Argon2id hashes. Authentication issues an
//! opaque session token (32 random bytes, hex) with a sliding TTL; the
//! adapter resolves tokens to user ids on every request. Registration
//! generates the user's X25519 export keypair: the public key is stored
//! for sealing export bundles, the secret is returned exactly once.

use argon2::password_hash::{
    rand_core::OsRng as PasswordRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::audit::{AuditAction, AuditEventBuilder, AuditLogger};
use crate::error::{CoreError, CoreResult};
use crate::store::backend::{StoreBackend, UserAccount};

/// Session lifetime; each successful resolve slides the expiry forward
const SESSION_TTL_HOURS: i64 = 24;

/// The result of registering a user
pub struct RegisteredUser {
    /// Assigned user id
    pub user_id: String,
    /// Export secret key, returned exactly once; the core never stores it
    pub export_secret: StaticSecret,
}

/// An authenticated principal
#[derive(Debug, Clone)]
pub struct Principal {
    /// Authenticated user
    pub user_id: String,
    /// Opaque session token
    pub token: String,
}

#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    expires_at: DateTime<Utc>,
}

/// Registration, login, and session resolution
pub struct AuthManager {
    backend: Arc<dyn StoreBackend>,
    audit: Arc<AuditLogger>,
    sessions: DashMap<String, Session>,
}

impl AuthManager {
    /// Create a manager over the store backend
    pub fn new(backend: Arc<dyn StoreBackend>, audit: Arc<AuditLogger>) -> Self {
        Self {
            backend,
            audit,
            sessions: DashMap::new(),
        }
    }

    fn validate_email(email: &str) -> CoreResult<()> {
        let valid = email.len() <= 254
            && email.split_once('@').is_some_and(|(local, domain)| {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
            });
        if !valid {
            return Err(CoreError::Validation(format!("invalid email '{email}'")));
        }
        Ok(())
    }

    /// Register a new user. The returned export secret is shown once and
    /// never persisted.
    pub fn register(&self, email: &str, credential: &str) -> CoreResult<RegisteredUser> {
        Self::validate_email(email)?;
        if credential.len() < 8 {
            return Err(CoreError::Validation(
                "credential must be at least 8 characters".to_string(),
            ));
        }
        if self.backend.get_user_by_email(email)?.is_some() {
            return Err(CoreError::Validation(format!(
                "email '{email}' already registered"
            )));
        }

        let salt = SaltString::generate(&mut PasswordRng);
        let credential_hash = Argon2::default()
            .hash_password(credential.as_bytes(), &salt)
            .map_err(CoreError::internal)?
            .to_string();

        let export_secret = StaticSecret::random_from_rng(OsRng);
        let export_public = PublicKey::from(&export_secret);

        let user_id = format!("u-{}", Uuid::new_v4());
        let account = UserAccount {
            user_id: user_id.clone(),
            email: email.to_string(),
            credential_hash,
            export_public_key: *export_public.as_bytes(),
            created_at: Utc::now(),
        };
        self.backend.put_user(&account)?;
        tracing::info!(%user_id, "user registered");
        Ok(RegisteredUser {
            user_id,
            export_secret,
        })
    }

    /// Authenticate by email and credential, issuing a session token
    pub fn authenticate(
        &self,
        email: &str,
        credential: &str,
        client_ip: Option<&str>,
    ) -> CoreResult<Principal> {
        let account = self
            .backend
            .get_user_by_email(email)?
            .ok_or_else(|| CoreError::Unauthorized("unknown email or credential".to_string()))?;

        let parsed = PasswordHash::new(&account.credential_hash)
            .map_err(CoreError::internal)?;
        if Argon2::default()
            .verify_password(credential.as_bytes(), &parsed)
            .is_err()
        {
            let mut builder = AuditEventBuilder::new(&account.user_id, AuditAction::Login)
                .detail("success", "false");
            if let Some(ip) = client_ip {
                builder = builder.client_ip(ip);
            }
            self.audit.log(builder)?;
            return Err(CoreError::Unauthorized(
                "unknown email or credential".to_string(),
            ));
        }

        let mut token_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);
        self.sessions.insert(
            token.clone(),
            Session {
                user_id: account.user_id.clone(),
                expires_at: Utc::now() + Duration::hours(SESSION_TTL_HOURS),
            },
        );

        let mut builder = AuditEventBuilder::new(&account.user_id, AuditAction::Login)
            .detail("success", "true");
        if let Some(ip) = client_ip {
            builder = builder.client_ip(ip);
        }
        self.audit.log(builder)?;

        Ok(Principal {
            user_id: account.user_id,
            token,
        })
    }

    /// Resolve a session token to its user, sliding the expiry
    pub fn resolve(&self, token: &str) -> CoreResult<String> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| CoreError::Unauthorized("unknown session".to_string()))?;
        if session.expires_at < Utc::now() {
            drop(session);
            self.sessions.remove(token);
            return Err(CoreError::Unauthorized("session expired".to_string()));
        }
        session.expires_at = Utc::now() + Duration::hours(SESSION_TTL_HOURS);
        Ok(session.user_id.clone())
    }

    /// Invalidate a session token
    pub fn revoke(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Drop every session for a user (account destruction)
    pub fn revoke_user(&self, user_id: &str) {
        self.sessions.retain(|_, session| session.user_id != user_id);
    }

    /// The stored account for a user id
    pub fn account(&self, user_id: &str) -> CoreResult<UserAccount> {
        self.backend
            .get_user(user_id)?
            .ok_or_else(|| CoreError::NotFound(format!("user {user_id}")))
    }
}
