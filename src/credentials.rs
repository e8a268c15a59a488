use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::domain::{LedgerIntegration, TenantCredential};
use crate::error::CredentialError;
use crate::ledger::LedgerApi;
use crate::secrets::SecretStore;

fn secret_name(tenant_id: &str) -> String {
    format!("token-{tenant_id}")
}

/// Obtains and refreshes per-tenant access tokens, persisting bundles in the
/// secret store. Refreshes are single-flight per tenant so concurrent
/// invocations cannot race to refresh and invalidate each other's token.
pub struct CredentialManager {
    secrets: Arc<dyn SecretStore>,
    ledger: Arc<dyn LedgerApi>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialManager {
    pub fn new(secrets: Arc<dyn SecretStore>, ledger: Arc<dyn LedgerApi>) -> Self {
        CredentialManager {
            secrets,
            ledger,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns a token usable for at least the expiry skew window,
    /// refreshing and persisting a new bundle when the cached one is stale.
    pub async fn access_token(
        &self,
        tenant_id: &str,
        integration: &LedgerIntegration,
    ) -> Result<String, CredentialError> {
        let lock = self.tenant_lock(tenant_id).await;
        let _guard = lock.lock().await;

        let name = secret_name(tenant_id);
        let Some(raw) = self.secrets.get_secret(&name).await? else {
            tracing::warn!("No credential bundle stored for tenant_id={}", tenant_id);
            return Err(CredentialError::Missing);
        };
        let cached: TenantCredential = serde_json::from_str(&raw)?;

        if cached.usable_at(Utc::now()) {
            return Ok(cached.access_token);
        }

        let Some(refresh_token) = cached.refresh_token.as_deref() else {
            tracing::warn!(
                "Credential bundle for tenant_id={} has no refresh token",
                tenant_id
            );
            return Err(CredentialError::Missing);
        };

        tracing::info!("Refreshing access token for tenant_id={}", tenant_id);
        let grant = self
            .ledger
            .refresh_token(
                &integration.client_id,
                &integration.client_secret,
                refresh_token,
            )
            .await
            .map_err(CredentialError::Refresh)?;

        let renewed = TenantCredential {
            tenant_id: tenant_id.to_string(),
            access_token: grant.access_token,
            refresh_token: Some(grant.refresh_token),
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
        };
        self.secrets
            .set_secret(&name, &serde_json::to_string(&renewed)?)
            .await?;

        tracing::info!("Stored refreshed credential bundle for tenant_id={}", tenant_id);
        Ok(renewed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TOKEN_EXPIRY_SKEW_SECS;
    use crate::memory::{FakeLedger, MemorySecretStore};

    fn integration() -> LedgerIntegration {
        LedgerIntegration {
            tenant_id: String::from("t1"),
            ledger_tenant_id: String::from("scope-1"),
            client_id: String::from("client"),
            client_secret: String::from("secret"),
            currency_code: String::from("AUD"),
        }
    }

    fn bundle(expires_in_secs: i64) -> TenantCredential {
        TenantCredential {
            tenant_id: String::from("t1"),
            access_token: String::from("cached-token"),
            refresh_token: Some(String::from("refresh-1")),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    async fn store_bundle(secrets: &MemorySecretStore, credential: &TenantCredential) {
        secrets
            .set_secret(
                &secret_name("t1"),
                &serde_json::to_string(credential).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_tokens_are_returned_without_a_refresh() {
        let secrets = Arc::new(MemorySecretStore::default());
        let ledger = Arc::new(FakeLedger::default());
        store_bundle(&secrets, &bundle(TOKEN_EXPIRY_SKEW_SECS + 600)).await;

        let manager = CredentialManager::new(secrets, ledger.clone());
        let token = manager.access_token("t1", &integration()).await.unwrap();

        assert_eq!(token, "cached-token");
        assert_eq!(ledger.refresh_calls().await, 0);
    }

    #[tokio::test]
    async fn stale_tokens_are_refreshed_and_persisted() {
        let secrets = Arc::new(MemorySecretStore::default());
        let ledger = Arc::new(FakeLedger::default());
        store_bundle(&secrets, &bundle(TOKEN_EXPIRY_SKEW_SECS - 30)).await;

        let manager = CredentialManager::new(secrets.clone(), ledger.clone());
        let token = manager.access_token("t1", &integration()).await.unwrap();

        assert_eq!(token, "fresh-token-1");
        assert_eq!(ledger.refresh_calls().await, 1);

        let stored = secrets
            .get_secret(&secret_name("t1"))
            .await
            .unwrap()
            .unwrap();
        let stored: TenantCredential = serde_json::from_str(&stored).unwrap();
        assert_eq!(stored.access_token, "fresh-token-1");
        assert!(stored.usable_at(Utc::now()));
    }

    #[tokio::test]
    async fn missing_bundle_is_an_auth_failure() {
        let manager = CredentialManager::new(
            Arc::new(MemorySecretStore::default()),
            Arc::new(FakeLedger::default()),
        );
        let result = manager.access_token("t1", &integration()).await;
        assert!(matches!(result, Err(CredentialError::Missing)));
    }

    #[tokio::test]
    async fn missing_refresh_token_is_an_auth_failure() {
        let secrets = Arc::new(MemorySecretStore::default());
        let mut credential = bundle(-60);
        credential.refresh_token = None;
        store_bundle(&secrets, &credential).await;

        let manager = CredentialManager::new(secrets, Arc::new(FakeLedger::default()));
        let result = manager.access_token("t1", &integration()).await;
        assert!(matches!(result, Err(CredentialError::Missing)));
    }

    #[tokio::test]
    async fn rejected_refresh_surfaces_as_refresh_error() {
        let secrets = Arc::new(MemorySecretStore::default());
        let ledger = Arc::new(FakeLedger::default());
        ledger.fail_refresh().await;
        store_bundle(&secrets, &bundle(-60)).await;

        let manager = CredentialManager::new(secrets, ledger);
        let result = manager.access_token("t1", &integration()).await;
        assert!(matches!(result, Err(CredentialError::Refresh(_))));
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_single_refresh() {
        let secrets = Arc::new(MemorySecretStore::default());
        let ledger = Arc::new(FakeLedger::default());
        store_bundle(&secrets, &bundle(-60)).await;

        let manager = Arc::new(CredentialManager::new(secrets, ledger.clone()));
        let integration = integration();
        let (a, b) = tokio::join!(
            manager.access_token("t1", &integration),
            manager.access_token("t1", &integration),
        );

        assert_eq!(a.unwrap(), "fresh-token-1");
        assert_eq!(b.unwrap(), "fresh-token-1");
        assert_eq!(ledger.refresh_calls().await, 1);
    }
}
