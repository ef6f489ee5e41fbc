//! Session id → tenant UUID mapping with rotation on use.
//!
//! Sessions live in their own encrypted `RecordStore` table. Every successful
//! lookup through [`SessionManager::get_or_create`] invalidates the presented
//! id and issues a fresh one bound to the same tenant.

use crate::config::SessionConfig;
use crate::credentials::{RecordStore, StorageError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;


/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "session_id";

const SESSION_TAG: &str = "session";

/// Bytes of entropy in a session id (before encoding)
const SESSION_ID_BYTES: usize = 32;

/// A session id and the tenant it is bound to.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub tenant_uuid: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &"**redacted**")
            .field("tenant_uuid", &self.tenant_uuid)
            .finish()
    }
}

/// Session verification errors. All of them mean "restart the login flow".
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing session_id cookie")]
    Missing,
    #[error("invalid or expired session")]
    Invalid,
    #[error("mismatched session tenant")]
    Mismatched,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Issues, rotates and verifies sessions.
pub struct SessionManager {
    store: RecordStore,
    cookie_max_age_seconds: u64,
    max_age_seconds: i64,
}

impl SessionManager {
    pub fn new(store: RecordStore, config: &SessionConfig) -> Self {
        Self {
            store,
            cookie_max_age_seconds: config.cookie_max_age_seconds,
            max_age_seconds: i64::try_from(config.max_age_seconds).unwrap_or(i64::MAX),
        }
    }

    /// Resolves the presented session id, rotating it, or starts a new
    /// anonymous tenant.
    ///
    /// An absent, unknown or stale id never fails: it yields a fresh tenant so
    /// the login entry point is always available. Only storage failures are
    /// errors.
    pub fn get_or_create(&self, session_id: Option<&str>) -> Result<Session, StorageError> {
        let existing = match non_empty(session_id) {
            Some(id) => self.lookup(id)?.map(|tenant| (id, tenant)),
            None => None,
        };

        let new_session_id = generate_session_id();

        // Bind the new id before dropping the old one so a failed write never
        // strands the tenant
        let tenant_uuid = match existing {
            Some((old_id, tenant_uuid)) => {
                self.store.put(&new_session_id, &tenant_uuid, SESSION_TAG)?;
                self.store.delete(old_id)?;
                debug!(tenant = %tenant_uuid, "Session rotated");
                tenant_uuid
            }
            None => {
                let tenant_uuid = Uuid::new_v4().to_string();
                self.store.put(&new_session_id, &tenant_uuid, SESSION_TAG)?;
                info!(tenant = %tenant_uuid, "New anonymous tenant");
                tenant_uuid
            }
        };

        Ok(Session {
            session_id: new_session_id,
            tenant_uuid,
        })
    }

    /// Asserts that `session_id` resolves, and that it resolves to
    /// `expected_tenant` when one is given. Does not rotate.
    pub fn verify(
        &self,
        session_id: Option<&str>,
        expected_tenant: Option<&str>,
    ) -> Result<String, SessionError> {
        let session_id = non_empty(session_id).ok_or(SessionError::Missing)?;

        let tenant_uuid = self.lookup(session_id)?.ok_or_else(|| {
            warn!("Session verification failed: unknown or expired session");
            SessionError::Invalid
        })?;

        if let Some(expected) = expected_tenant {
            if tenant_uuid != expected {
                warn!(tenant = %tenant_uuid, expected, "Session verification failed: tenant mismatch");
                return Err(SessionError::Mismatched);
            }
        }

        Ok(tenant_uuid)
    }

    /// `Set-Cookie` header value binding `session_id` to the client.
    pub fn session_cookie(&self, session_id: &str) -> String {
        format!(
            "{}={}; HttpOnly; Max-Age={}; Path=/; SameSite=Lax",
            SESSION_COOKIE, session_id, self.cookie_max_age_seconds
        )
    }

    /// Deletes sessions issued more than `max_age_seconds` ago.
    pub fn sweep_stale(&self) -> Result<usize, StorageError> {
        let cutoff = Utc::now().timestamp().saturating_sub(self.max_age_seconds);
        self.store.delete_created_before(cutoff)
    }

    /// Number of stored sessions (for debugging/monitoring)
    pub fn count(&self) -> Result<usize, StorageError> {
        self.store.count()
    }

    /// Tenant bound to `session_id`, treating sessions past their max age as
    /// absent even before the sweep removes them.
    fn lookup(&self, session_id: &str) -> Result<Option<String>, StorageError> {
        let now = Utc::now().timestamp();
        Ok(self
            .store
            .get_with_timestamp(session_id)?
            .filter(|(_, created_at)| now.saturating_sub(*created_at) <= self.max_age_seconds)
            .map(|(tenant_uuid, _)| tenant_uuid))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// 32 bytes from the OS CSPRNG, URL-safe base64 without padding.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Background task to periodically remove stale sessions
pub async fn run_session_sweep(manager: Arc<SessionManager>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        match manager.sweep_stale() {
            Ok(removed) => match manager.count() {
                Ok(remaining) => debug!(removed, remaining, "Session sweep complete"),
                Err(e) => warn!(removed, error = %e, "Session sweep complete, count unavailable"),
            },
            Err(e) => warn!(error = %e, "Session sweep failed"),
        }
    }
}
