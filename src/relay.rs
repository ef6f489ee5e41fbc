//! Construction of the core components from one `RelayConfig`.

use crate::config::{ConfigError, RelayConfig};
use crate::credentials::{derive_key, CredentialVault, RecordStore, StorageError};
use crate::oauth::StateTokenCodec;
use crate::session::SessionManager;
use crate::sync::FsObjectStore;
use std::sync::Arc;
use tracing::info;

pub const TOKENS_TABLE: &str = "tokens";
pub const SESSIONS_TABLE: &str = "sessions";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The credential vault, session manager, state-token codec and local object
/// store, sharing one derived key and one secret.
#[derive(Clone)]
pub struct Relay {
    pub vault: Arc<CredentialVault>,
    pub sessions: Arc<SessionManager>,
    pub state_tokens: StateTokenCodec,
    pub objects: Arc<FsObjectStore>,
}

impl Relay {
    /// Derives the record key once and opens both record tables.
    pub fn open(config: &RelayConfig) -> Result<Self, RelayError> {
        let secret = config.secret()?;
        let key = derive_key(secret)?;

        let tokens = RecordStore::open(
            &config.storage.tokens_path,
            TOKENS_TABLE,
            key.clone(),
            &config.storage,
        )?;
        let sessions = RecordStore::open(
            &config.storage.sessions_path,
            SESSIONS_TABLE,
            key,
            &config.storage,
        )?;

        info!(
            tokens = %config.storage.tokens_path.display(),
            tokens_table = tokens.table(),
            sessions = %config.storage.sessions_path.display(),
            sessions_table = sessions.table(),
            "Record stores ready"
        );

        Ok(Self {
            vault: Arc::new(CredentialVault::new(tokens)),
            sessions: Arc::new(SessionManager::new(sessions, &config.session)),
            state_tokens: StateTokenCodec::new(secret)?,
            objects: Arc::new(FsObjectStore::new(&config.sync.data_dir)),
        })
    }
}
