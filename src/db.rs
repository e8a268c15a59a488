use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::domain::{
    AuditEntry, EmailMapping, LedgerIntegration, LedgerSyncStatus, LineItem, Receipt,
    ReceiptOrigin, ReceiptStatus, Tenant, TenantSettings, TenantUsage,
};
use crate::error::StoreError;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect(database_url).await
}

/// Document store for the per-tenant record sets. Containers map to tables
/// (`tenants`, `receipts`, `integrations`, `email_mappings`, `audit`), all
/// partitioned by `tenant_id`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError>;

    /// Active tenants with processing enabled, for the reconciliation sweep.
    async fn list_processing_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    /// Active tenants with auto-pay enabled, for the auto-pay sweep.
    async fn list_auto_pay_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    async fn record_tenant_usage(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StoreError>;

    async fn get_receipt(&self, tenant_id: &str, id: &str) -> Result<Option<Receipt>, StoreError>;

    async fn list_receipts(&self, tenant_id: &str) -> Result<Vec<Receipt>, StoreError>;

    /// Optimistic write: applies only if the stored version still matches
    /// `receipt.version`, bumping the stored version by one.
    async fn update_receipt(&self, receipt: &Receipt) -> Result<(), StoreError>;

    async fn get_integration(
        &self,
        tenant_id: &str,
    ) -> Result<Option<LedgerIntegration>, StoreError>;

    async fn find_email_mapping(
        &self,
        email_address: &str,
    ) -> Result<Option<EmailMapping>, StoreError>;

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        PgRecordStore { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TenantRow {
    tenant_id: String,
    name: String,
    status: String,
    contact_email: Option<String>,
    settings: Json<TenantSettings>,
    usage: Json<TenantUsage>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            tenant_id: row.tenant_id,
            name: row.name,
            status: row.status,
            contact_email: row.contact_email,
            settings: row.settings.0,
            usage: row.usage.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReceiptRow {
    id: String,
    tenant_id: String,
    source_filename: String,
    origin: String,
    merchant: String,
    transaction_date: NaiveDate,
    total_amount: Decimal,
    tax_amount: Decimal,
    line_items: Json<Vec<LineItem>>,
    status: String,
    ledger_invoice_id: Option<String>,
    ledger_sync_status: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<ReceiptRow> for Receipt {
    type Error = StoreError;

    fn try_from(row: ReceiptRow) -> Result<Self, StoreError> {
        let status = ReceiptStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("receipt status {:?}", row.status)))?;
        let ledger_sync_status = LedgerSyncStatus::parse(&row.ledger_sync_status).ok_or_else(
            || StoreError::Corrupt(format!("ledger sync status {:?}", row.ledger_sync_status)),
        )?;
        let origin = ReceiptOrigin::parse(&row.origin)
            .ok_or_else(|| StoreError::Corrupt(format!("receipt origin {:?}", row.origin)))?;
        Ok(Receipt {
            id: row.id,
            tenant_id: row.tenant_id,
            source_filename: row.source_filename,
            origin,
            merchant: row.merchant,
            transaction_date: row.transaction_date,
            total_amount: row.total_amount,
            tax_amount: row.tax_amount,
            line_items: row.line_items.0,
            status,
            ledger_invoice_id: row.ledger_invoice_id,
            ledger_sync_status,
            created_at: row.created_at,
            processed_at: row.processed_at,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IntegrationRow {
    tenant_id: String,
    ledger_tenant_id: String,
    client_id: String,
    client_secret: String,
    currency_code: String,
}

impl From<IntegrationRow> for LedgerIntegration {
    fn from(row: IntegrationRow) -> Self {
        LedgerIntegration {
            tenant_id: row.tenant_id,
            ledger_tenant_id: row.ledger_tenant_id,
            client_id: row.client_id,
            client_secret: row.client_secret,
            currency_code: row.currency_code,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EmailMappingRow {
    tenant_id: String,
    email_address: String,
    status: String,
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "
                SELECT tenant_id, name, status, contact_email, settings, usage
                FROM tenants
                WHERE tenant_id = $1
            ",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Tenant::from))
    }

    async fn list_processing_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "
                SELECT tenant_id, name, status, contact_email, settings, usage
                FROM tenants
                WHERE status = 'active'
                  AND (settings ->> 'processing_enabled')::boolean
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    async fn list_auto_pay_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "
                SELECT tenant_id, name, status, contact_email, settings, usage
                FROM tenants
                WHERE status = 'active'
                  AND (settings ->> 'auto_pay_enabled')::boolean
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    async fn record_tenant_usage(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let usage = sqlx::query_as::<_, (Json<TenantUsage>,)>(
            "
                SELECT usage FROM tenants
                WHERE tenant_id = $1
            ",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((Json(mut usage),)) = usage else {
            return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
        };
        usage.receipts_processed += 1;
        usage.last_processing = Some(at);

        sqlx::query(
            "
                UPDATE tenants
                SET usage = $2
                WHERE tenant_id = $1
            ",
        )
        .bind(tenant_id)
        .bind(Json(usage))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StoreError> {
        sqlx::query(
            "
                INSERT INTO receipts (
                    id,
                    tenant_id,
                    source_filename,
                    origin,
                    merchant,
                    transaction_date,
                    total_amount,
                    tax_amount,
                    line_items,
                    status,
                    ledger_invoice_id,
                    ledger_sync_status,
                    created_at,
                    processed_at,
                    version
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ",
        )
        .bind(&receipt.id)
        .bind(&receipt.tenant_id)
        .bind(&receipt.source_filename)
        .bind(receipt.origin.as_str())
        .bind(&receipt.merchant)
        .bind(receipt.transaction_date)
        .bind(receipt.total_amount)
        .bind(receipt.tax_amount)
        .bind(Json(&receipt.line_items))
        .bind(receipt.status.as_str())
        .bind(&receipt.ledger_invoice_id)
        .bind(receipt.ledger_sync_status.as_str())
        .bind(receipt.created_at)
        .bind(receipt.processed_at)
        .bind(receipt.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_receipt(&self, tenant_id: &str, id: &str) -> Result<Option<Receipt>, StoreError> {
        let row = sqlx::query_as::<_, ReceiptRow>(
            "
                SELECT * FROM receipts
                WHERE tenant_id = $1 AND id = $2
            ",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Receipt::try_from).transpose()
    }

    async fn list_receipts(&self, tenant_id: &str) -> Result<Vec<Receipt>, StoreError> {
        let rows = sqlx::query_as::<_, ReceiptRow>(
            "
                SELECT * FROM receipts
                WHERE tenant_id = $1
                ORDER BY created_at DESC
            ",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Receipt::try_from).collect()
    }

    async fn update_receipt(&self, receipt: &Receipt) -> Result<(), StoreError> {
        let result = sqlx::query(
            "
                UPDATE receipts
                SET status = $4,
                    ledger_invoice_id = $5,
                    ledger_sync_status = $6,
                    processed_at = $7,
                    version = version + 1
                WHERE tenant_id = $1 AND id = $2 AND version = $3
            ",
        )
        .bind(&receipt.tenant_id)
        .bind(&receipt.id)
        .bind(receipt.version)
        .bind(receipt.status.as_str())
        .bind(&receipt.ledger_invoice_id)
        .bind(receipt.ledger_sync_status.as_str())
        .bind(receipt.processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                id: receipt.id.clone(),
            });
        }
        Ok(())
    }

    async fn get_integration(
        &self,
        tenant_id: &str,
    ) -> Result<Option<LedgerIntegration>, StoreError> {
        let row = sqlx::query_as::<_, IntegrationRow>(
            "
                SELECT tenant_id, ledger_tenant_id, client_id, client_secret, currency_code
                FROM integrations
                WHERE tenant_id = $1
            ",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LedgerIntegration::from))
    }

    async fn find_email_mapping(
        &self,
        email_address: &str,
    ) -> Result<Option<EmailMapping>, StoreError> {
        let row = sqlx::query_as::<_, EmailMappingRow>(
            "
                SELECT tenant_id, email_address, status
                FROM email_mappings
                WHERE lower(email_address) = lower($1) AND status = 'active'
            ",
        )
        .bind(email_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| EmailMapping {
            tenant_id: row.tenant_id,
            email_address: row.email_address,
            status: row.status,
        }))
    }

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            "
                INSERT INTO audit (
                    id,
                    tenant_id,
                    action,
                    details,
                    timestamp
                ) VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(entry.id)
        .bind(&entry.tenant_id)
        .bind(&entry.action)
        .bind(Json(&entry.details))
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
