//! External collaborators named for interface completeness: the native
//! human-prompt helper and the OS keyring. Neither is consumed by the
//! session engine itself -- the outer system injects a real implementation;
//! the core ships only no-op/in-memory stand-ins used by tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Prompts a human for connection details when the outer system decides an
/// interactive session needs one (new-host confirmation, a passphrase).
/// Out of scope for the core; defined here so the trait boundary is
/// explicit.
#[async_trait]
pub trait HostPrompt: Send + Sync {
    async fn prompt_text(&self, message: &str) -> Option<String>;
    async fn prompt_secret(&self, message: &str) -> Option<String>;
    async fn confirm(&self, message: &str) -> bool;
}

/// A no-op prompt that always declines, used where no human is attached
/// (headless test runs, CI).
#[derive(Debug, Clone, Default)]
pub struct NoopHostPrompt;

#[async_trait]
impl HostPrompt for NoopHostPrompt {
    async fn prompt_text(&self, _message: &str) -> Option<String> {
        None
    }

    async fn prompt_secret(&self, _message: &str) -> Option<String> {
        None
    }

    async fn confirm(&self, _message: &str) -> bool {
        false
    }
}

/// OS keyring adapter, specified only by the set/get/delete operations it
/// must provide. This core never persists credentials (Non-goals); the
/// trait exists so the outer system has a stable seam to store long-lived
/// secrets (e.g. a passphrase-protected key's passphrase) outside of this
/// crate's in-memory caches.
#[async_trait]
pub trait KeyringStore: Send + Sync {
    async fn set(&self, service: &str, account: &str, secret: &str) -> Result<(), String>;
    async fn get(&self, service: &str, account: &str) -> Result<Option<String>, String>;
    async fn delete(&self, service: &str, account: &str) -> Result<(), String>;
}

/// In-memory keyring used by tests; never touches the OS keyring.
#[derive(Default)]
pub struct MemKeyringStore {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl MemKeyringStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyringStore for MemKeyringStore {
    async fn set(&self, service: &str, account: &str, secret: &str) -> Result<(), String> {
        self.entries
            .write()
            .await
            .insert((service.to_string(), account.to_string()), secret.to_string());
        Ok(())
    }

    async fn get(&self, service: &str, account: &str) -> Result<Option<String>, String> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(service.to_string(), account.to_string()))
            .cloned())
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), String> {
        self.entries
            .write()
            .await
            .remove(&(service.to_string(), account.to_string()));
        Ok(())
    }
}

/// Backs onto the platform keyring (Keychain/Credential Manager/Secret
/// Service) via the `keyring` crate, for the outer system to use when it
/// wants durable storage. The session core never constructs this itself.
#[derive(Debug, Clone, Default)]
pub struct OsKeyringStore;

#[async_trait]
impl KeyringStore for OsKeyringStore {
    async fn set(&self, service: &str, account: &str, secret: &str) -> Result<(), String> {
        let service = service.to_string();
        let account = account.to_string();
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || {
            keyring::Entry::new(&service, &account)
                .and_then(|e| e.set_password(&secret))
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn get(&self, service: &str, account: &str) -> Result<Option<String>, String> {
        let service = service.to_string();
        let account = account.to_string();
        tokio::task::spawn_blocking(move || match keyring::Entry::new(&service, &account) {
            Ok(entry) => match entry.get_password() {
                Ok(password) => Ok(Some(password)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), String> {
        let service = service.to_string();
        let account = account.to_string();
        tokio::task::spawn_blocking(move || match keyring::Entry::new(&service, &account) {
            Ok(entry) => match entry.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_host_prompt_always_declines() {
        let prompt = NoopHostPrompt;
        assert_eq!(prompt.prompt_text("continue?").await, None);
        assert!(!prompt.confirm("trust this host?").await);
    }

    #[tokio::test]
    async fn mem_keyring_round_trips_and_deletes() {
        let store = MemKeyringStore::new();
        store.set("agentshell", "deploy@example.com", "s3cr3t").await.unwrap();
        assert_eq!(
            store.get("agentshell", "deploy@example.com").await.unwrap(),
            Some("s3cr3t".to_string())
        );
        store.delete("agentshell", "deploy@example.com").await.unwrap();
        assert_eq!(store.get("agentshell", "deploy@example.com").await.unwrap(), None);
    }
}
