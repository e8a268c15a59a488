use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Safety margin subtracted from a token's expiry so a token is never used
/// while it could expire mid-call.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Uploaded => "uploaded",
            ReceiptStatus::Processing => "processing",
            ReceiptStatus::Completed => "completed",
            ReceiptStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "uploaded" => Some(ReceiptStatus::Uploaded),
            "processing" => Some(ReceiptStatus::Processing),
            "completed" => Some(ReceiptStatus::Completed),
            "failed" => Some(ReceiptStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReceiptStatus::Completed | ReceiptStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerSyncStatus {
    Pending,
    Success,
    Error,
}

impl LedgerSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSyncStatus::Pending => "pending",
            LedgerSyncStatus::Success => "success",
            LedgerSyncStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(LedgerSyncStatus::Pending),
            "success" => Some(LedgerSyncStatus::Success),
            "error" => Some(LedgerSyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptOrigin {
    Upload,
    Email,
}

impl ReceiptOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptOrigin::Upload => "upload",
            ReceiptOrigin::Email => "email",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "upload" => Some(ReceiptOrigin::Upload),
            "email" => Some(ReceiptOrigin::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
}

/// Receipt-shaped fields produced by extraction, before a record exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptFields {
    pub merchant: String,
    pub transaction_date: NaiveDate,
    pub total_amount: Decimal,
    pub tax_amount: Decimal,
    pub line_items: Vec<LineItem>,
}

/// One ingested document's canonical record. Rows are inserted once and then
/// only move forward through the status enum; nothing deletes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub tenant_id: String,
    pub source_filename: String,
    pub origin: ReceiptOrigin,
    pub merchant: String,
    pub transaction_date: NaiveDate,
    pub total_amount: Decimal,
    pub tax_amount: Decimal,
    pub line_items: Vec<LineItem>,
    pub status: ReceiptStatus,
    pub ledger_invoice_id: Option<String>,
    pub ledger_sync_status: LedgerSyncStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Receipt {
    pub fn from_extraction(
        tenant_id: &str,
        source_filename: &str,
        origin: ReceiptOrigin,
        fields: ReceiptFields,
    ) -> Self {
        Receipt {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            source_filename: source_filename.to_string(),
            origin,
            merchant: fields.merchant,
            transaction_date: fields.transaction_date,
            total_amount: fields.total_amount,
            tax_amount: fields.tax_amount,
            line_items: fields.line_items,
            status: ReceiptStatus::Processing,
            ledger_invoice_id: None,
            ledger_sync_status: LedgerSyncStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            version: 0,
        }
    }

    /// Terminal success transition. Returns whether the transition applied;
    /// a receipt already in a terminal state is left untouched.
    pub fn mark_completed(&mut self, invoice_id: String, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ReceiptStatus::Completed;
        self.ledger_sync_status = LedgerSyncStatus::Success;
        self.ledger_invoice_id = Some(invoice_id);
        self.processed_at = Some(now);
        true
    }

    /// Terminal failure transition. `sync_status` stays `pending` when sync
    /// never ran and becomes `error` when it ran and failed; it is never
    /// allowed to be `success` here.
    pub fn mark_failed(&mut self, sync_status: LedgerSyncStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || sync_status == LedgerSyncStatus::Success {
            return false;
        }
        self.status = ReceiptStatus::Failed;
        self.ledger_sync_status = sync_status;
        self.processed_at = Some(now);
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub processing_enabled: bool,
    pub auto_pay_enabled: bool,
    pub bank_account_id: Option<String>,
    pub authorized_senders: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantUsage {
    pub receipts_processed: i64,
    pub last_processing: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    pub status: String,
    pub contact_email: Option<String>,
    pub settings: TenantSettings,
    pub usage: TenantUsage,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// A tenant's connection to the external ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerIntegration {
    pub tenant_id: String,
    /// Value for the `tenant-scope-id` header on every ledger call.
    pub ledger_tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_currency")]
    pub currency_code: String,
}

fn default_currency() -> String {
    String::from("AUD")
}

/// Cached OAuth-style token bundle, persisted as JSON in the secret store
/// under `token-{tenant_id}`. Superseded in place on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantCredential {
    pub tenant_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TenantCredential {
    pub fn usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::seconds(TOKEN_EXPIRY_SKEW_SECS)
    }
}

/// Immutable record of a ledger-affecting side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub action: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn auto_payment(
        tenant_id: &str,
        invoice_id: &str,
        amount: Decimal,
        payment_date: NaiveDate,
    ) -> Self {
        AuditEntry {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            action: String::from("auto_payment_created"),
            details: serde_json::json!({
                "invoiceId": invoice_id,
                "amount": amount,
                "paymentDate": payment_date,
            }),
            timestamp: Utc::now(),
        }
    }
}

/// Inbound email address registered for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMapping {
    pub tenant_id: String,
    pub email_address: String,
    pub status: String,
}
