use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::StoreError;

/// Key-value store for credentials. Token bundles live here as JSON blobs
/// keyed `token-{tenant_id}`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, StoreError>;

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), StoreError>;
}

pub struct PgSecretStore {
    pool: PgPool,
}

impl PgSecretStore {
    pub fn new(pool: PgPool) -> Self {
        PgSecretStore { pool }
    }
}

#[async_trait]
impl SecretStore for PgSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query_as::<_, (String,)>(
            "
                SELECT value FROM secrets
                WHERE name = $1
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "
                INSERT INTO secrets (
                    name,
                    value,
                    updated_at
                ) VALUES ($1, $2, now())
                ON CONFLICT (name)
                DO UPDATE SET
                    value = EXCLUDED.value,
                    updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
