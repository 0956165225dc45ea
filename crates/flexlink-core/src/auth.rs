//! External authentication and credential collaborators.
//!
//! The WAN path needs a bearer token for broker registration. Token
//! acquisition (OAuth flows, refresh, browser interaction) lives outside
//! the engine; flexlink only calls these traits. Likewise the credential
//! store is an opaque keychain-like collaborator.

use async_trait::async_trait;

use crate::error::Result;

/// Provides bearer tokens for SmartLink broker registration.
///
/// `ensure_valid_token` may suspend the caller (interactive login,
/// network refresh). While the radio engine awaits it, local control
/// commands queue behind the single-threaded state discipline.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a currently-valid bearer token, acquiring one if needed.
    async fn ensure_valid_token(&self) -> Result<String>;

    /// Refresh the token if it is close to expiry, returning the current
    /// valid token either way.
    async fn refresh_if_needed(&self) -> Result<String>;
}

/// Scope of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    /// Stored on this device only (OS keychain).
    Device,
    /// Synchronized through the platform's cloud keychain.
    Cloud,
}

/// Opaque credential store collaborator (keychain, keyring...).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store a value under a key.
    async fn set(&self, key: &str, value: &str, scope: CredentialScope) -> Result<()>;

    /// Fetch a value by key, `None` if absent.
    async fn get(&self, key: &str, scope: CredentialScope) -> Result<Option<String>>;

    /// Delete a stored value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str, scope: CredentialScope) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Minimal in-memory store used to exercise the trait object path.
    struct MemoryStore {
        values: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn set(&self, key: &str, value: &str, _scope: CredentialScope) -> Result<()> {
            self.values
                .lock()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn get(&self, key: &str, _scope: CredentialScope) -> Result<Option<String>> {
            Ok(self.values.lock().await.get(key).cloned())
        }

        async fn delete(&self, key: &str, _scope: CredentialScope) -> Result<()> {
            self.values.lock().await.remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_round_trip() {
        let store: Box<dyn CredentialStore> = Box::new(MemoryStore {
            values: Mutex::new(HashMap::new()),
        });

        store
            .set("refresh_token", "r-abc", CredentialScope::Device)
            .await
            .unwrap();
        assert_eq!(
            store
                .get("refresh_token", CredentialScope::Device)
                .await
                .unwrap()
                .as_deref(),
            Some("r-abc")
        );

        store
            .delete("refresh_token", CredentialScope::Device)
            .await
            .unwrap();
        assert!(store
            .get("refresh_token", CredentialScope::Device)
            .await
            .unwrap()
            .is_none());

        // Deleting again is a no-op.
        store
            .delete("refresh_token", CredentialScope::Device)
            .await
            .unwrap();
    }
}
