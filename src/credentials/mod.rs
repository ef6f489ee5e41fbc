//! Encrypted credential storage for third-party access tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialVault                    │
//! │  - typed records ("token" | "uuid")      │
//! │  - platform key naming scheme            │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       RecordStore (one per table)        │
//! │  - upsert / get / list_by_tag / delete   │
//! │  - retry on lock contention              │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - PBKDF2 key derived from the secret    │
//! │  - AES-256-GCM, record key as AAD        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use relay_core::config::{Secret, StorageConfig};
//! use relay_core::credentials::{derive_key, CredentialVault, Platform, RecordStore};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = derive_key(&Secret::new(std::env::var("STATE_TOKEN_SECRET")?))?;
//! let store = RecordStore::open("tokens.db", "tokens", key, &StorageConfig::default())?;
//! let vault = CredentialVault::new(store);
//!
//! let page = "1234567890";
//! vault.store_token(&Platform::Facebook.access_token_key(page), "EAAB...")?;
//! vault.store_tenant(&Platform::Facebook.tenant_key(page), "tenant-uuid")?;
//!
//! for account in vault.linked_accounts(Platform::Facebook)? {
//!     println!("{} belongs to {}", account.entity_id, account.tenant_uuid);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

mod encryption;
mod storage;

pub use encryption::{decrypt, derive_key, encrypt, CryptoError, DerivedKey, KEY_SIZE};
pub use storage::{RecordStore, StorageError};

/// Record type tag stored alongside each vault entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A third-party access token
    Token,
    /// The tenant UUID owning an entity (page, shop)
    Uuid,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Token => "token",
            RecordKind::Uuid => "uuid",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Third-party platform whose entities (pages, shops) own credentials.
///
/// A token and its owning tenant share the entity id in their keys, so they
/// can be joined without a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Facebook,
    Shopify,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Shopify => "shopify",
        }
    }

    fn token_prefix(&self) -> &'static str {
        match self {
            Platform::Facebook => "FACEBOOK_ACCESS_TOKEN_",
            Platform::Shopify => "SHOPIFY_ACCESS_TOKEN_",
        }
    }

    fn tenant_prefix(&self) -> &'static str {
        match self {
            Platform::Facebook => "PAGE_UUID_",
            Platform::Shopify => "SHOPIFY_UUID_",
        }
    }

    /// `FACEBOOK_ACCESS_TOKEN_<page_id>` / `SHOPIFY_ACCESS_TOKEN_<shop>`
    pub fn access_token_key(&self, entity_id: &str) -> String {
        format!("{}{}", self.token_prefix(), entity_id)
    }

    /// `PAGE_UUID_<page_id>` / `SHOPIFY_UUID_<shop>`
    pub fn tenant_key(&self, entity_id: &str) -> String {
        format!("{}{}", self.tenant_prefix(), entity_id)
    }

    /// Extracts the entity id from an access-token key of this platform.
    pub fn entity_from_token_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.token_prefix())
            .filter(|entity| !entity.is_empty())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity's access token joined with its owning tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct LinkedAccount {
    pub platform: Platform,
    pub entity_id: String,
    pub tenant_uuid: String,
    pub access_token: String,
}

impl fmt::Debug for LinkedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedAccount")
            .field("platform", &self.platform)
            .field("entity_id", &self.entity_id)
            .field("tenant_uuid", &self.tenant_uuid)
            .field("access_token", &"**redacted**")
            .finish()
    }
}

/// Typed façade over the token `RecordStore`.
pub struct CredentialVault {
    store: RecordStore,
}

impl CredentialVault {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    /// Stores `value` under `key` with the given record type (upsert).
    pub fn store(&self, key: &str, value: &str, kind: RecordKind) -> Result<(), StorageError> {
        self.store.put(key, value, kind.as_str())
    }

    /// Stores an access token.
    pub fn store_token(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.store(key, value, RecordKind::Token)
    }

    /// Stores the tenant UUID owning an entity.
    pub fn store_tenant(&self, key: &str, tenant_uuid: &str) -> Result<(), StorageError> {
        self.store(key, tenant_uuid, RecordKind::Uuid)
    }

    /// Retrieves a value of any record type. `Ok(None)` if absent.
    pub fn get_token(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.store.get(key)
    }

    /// Every record of the given type, keyed by record key.
    pub fn all_of_type(&self, kind: RecordKind) -> Result<BTreeMap<String, String>, StorageError> {
        self.store.list_by_tag(kind.as_str())
    }

    /// Deletes a record. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.store.delete(key)
    }

    /// Removes an entity's access token and tenant binding together.
    pub fn unlink(&self, platform: Platform, entity_id: &str) -> Result<bool, StorageError> {
        let token_removed = self.delete(&platform.access_token_key(entity_id))?;
        let tenant_removed = self.delete(&platform.tenant_key(entity_id))?;
        debug!(platform = %platform, entity_id, "Unlinked account");
        Ok(token_removed || tenant_removed)
    }

    /// Joins each stored access token of `platform` with its owning tenant.
    ///
    /// Tokens without a tenant binding are skipped with a warning; they cannot
    /// be attributed to anyone.
    pub fn linked_accounts(&self, platform: Platform) -> Result<Vec<LinkedAccount>, StorageError> {
        let tokens = self.all_of_type(RecordKind::Token)?;
        let tenants = self.all_of_type(RecordKind::Uuid)?;

        let mut accounts = Vec::new();
        for (key, access_token) in tokens {
            let entity_id = match platform.entity_from_token_key(&key) {
                Some(entity_id) => entity_id,
                None => continue,
            };

            match tenants.get(&platform.tenant_key(entity_id)) {
                Some(tenant_uuid) => accounts.push(LinkedAccount {
                    platform,
                    entity_id: entity_id.to_string(),
                    tenant_uuid: tenant_uuid.clone(),
                    access_token,
                }),
                None => {
                    warn!(platform = %platform, entity_id, "Access token has no tenant binding");
                }
            }
        }

        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Secret, StorageConfig};

    fn create_test_vault() -> CredentialVault {
        let key = derive_key(&Secret::new("vault-test-secret")).unwrap();
        let store = RecordStore::open(":memory:", "tokens", key, &StorageConfig::default())
            .expect("Failed to create test store");
        CredentialVault::new(store)
    }

    #[test]
    fn test_key_naming_scheme() {
        assert_eq!(
            Platform::Facebook.access_token_key("123"),
            "FACEBOOK_ACCESS_TOKEN_123"
        );
        assert_eq!(Platform::Facebook.tenant_key("123"), "PAGE_UUID_123");
        assert_eq!(
            Platform::Shopify.access_token_key("demo.myshopify.com"),
            "SHOPIFY_ACCESS_TOKEN_demo.myshopify.com"
        );
        assert_eq!(
            Platform::Shopify.tenant_key("demo.myshopify.com"),
            "SHOPIFY_UUID_demo.myshopify.com"
        );

        assert_eq!(
            Platform::Facebook.entity_from_token_key("FACEBOOK_ACCESS_TOKEN_123"),
            Some("123")
        );
        assert_eq!(
            Platform::Facebook.entity_from_token_key("SHOPIFY_ACCESS_TOKEN_123"),
            None
        );
        assert_eq!(
            Platform::Facebook.entity_from_token_key("FACEBOOK_ACCESS_TOKEN_"),
            None
        );
    }

    #[test]
    fn test_store_and_get_token() {
        let vault = create_test_vault();

        vault.store_token("FACEBOOK_ACCESS_TOKEN_1", "EAAB-1").unwrap();

        assert_eq!(
            vault.get_token("FACEBOOK_ACCESS_TOKEN_1").unwrap().as_deref(),
            Some("EAAB-1")
        );
        assert!(vault.get_token("FACEBOOK_ACCESS_TOKEN_2").unwrap().is_none());
    }

    #[test]
    fn test_all_of_type_separates_tags() {
        let vault = create_test_vault();

        vault.store_token("FACEBOOK_ACCESS_TOKEN_1", "EAAB-1").unwrap();
        vault.store_tenant("PAGE_UUID_1", "tenant-1").unwrap();
        vault
            .store("SHOPIFY_ACCESS_TOKEN_shop", "shpat", RecordKind::Token)
            .unwrap();

        let tokens = vault.all_of_type(RecordKind::Token).unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains_key("FACEBOOK_ACCESS_TOKEN_1"));
        assert!(tokens.contains_key("SHOPIFY_ACCESS_TOKEN_shop"));

        let tenants = vault.all_of_type(RecordKind::Uuid).unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants["PAGE_UUID_1"], "tenant-1");
    }

    #[test]
    fn test_linked_accounts_joins_by_entity_id() {
        let vault = create_test_vault();
        let fb = Platform::Facebook;
        let shop = Platform::Shopify;

        vault.store_token(&fb.access_token_key("1"), "EAAB-1").unwrap();
        vault.store_tenant(&fb.tenant_key("1"), "tenant-a").unwrap();
        vault.store_token(&fb.access_token_key("2"), "EAAB-2").unwrap();
        vault.store_tenant(&fb.tenant_key("2"), "tenant-b").unwrap();
        // Orphan token: no tenant binding
        vault.store_token(&fb.access_token_key("3"), "EAAB-3").unwrap();
        vault.store_token(&shop.access_token_key("demo"), "shpat").unwrap();
        vault.store_tenant(&shop.tenant_key("demo"), "tenant-a").unwrap();

        let accounts = vault.linked_accounts(fb).unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].entity_id, "1");
        assert_eq!(accounts[0].tenant_uuid, "tenant-a");
        assert_eq!(accounts[0].access_token, "EAAB-1");
        assert_eq!(accounts[1].entity_id, "2");
        assert_eq!(accounts[1].tenant_uuid, "tenant-b");

        let shops = vault.linked_accounts(shop).unwrap();
        assert_eq!(shops.len(), 1);
        assert_eq!(shops[0].entity_id, "demo");
        assert!(!format!("{:?}", shops[0]).contains("shpat"));
    }

    #[test]
    fn test_unlink() {
        let vault = create_test_vault();
        let fb = Platform::Facebook;

        vault.store_token(&fb.access_token_key("1"), "EAAB-1").unwrap();
        vault.store_tenant(&fb.tenant_key("1"), "tenant-a").unwrap();

        assert!(vault.unlink(fb, "1").unwrap());
        assert!(vault.get_token(&fb.access_token_key("1")).unwrap().is_none());
        assert!(vault.get_token(&fb.tenant_key("1")).unwrap().is_none());
        assert!(!vault.unlink(fb, "1").unwrap());
    }
}
