#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};

use receiptflow::credentials::CredentialManager;
use receiptflow::db::RecordStore;
use receiptflow::domain::{
    EmailMapping, LedgerIntegration, Tenant, TenantCredential, TenantSettings, TenantUsage,
};
use receiptflow::email::{EmailIngest, Mailer};
use receiptflow::extract::{DocumentExtractor, DocumentFields};
use receiptflow::ledger::LedgerApi;
use receiptflow::memory::{
    FakeLedger, MemoryObjectStore, MemoryRecordStore, MemorySecretStore, RecordingMailer,
};
use receiptflow::pipeline::ReceiptPipeline;
use receiptflow::rate_limit::{RateLimiter, MAX_CALLS_PER_MINUTE};
use receiptflow::secrets::SecretStore;
use receiptflow::storage::ObjectStore;
use receiptflow::sync::LedgerSync;

pub struct TestEnv {
    pub records: Arc<MemoryRecordStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub secrets: Arc<MemorySecretStore>,
    pub ledger: Arc<FakeLedger>,
    pub mailer: Arc<RecordingMailer>,
    pub credentials: Arc<CredentialManager>,
    pub limiter: Arc<RateLimiter>,
    pub pipeline: Arc<ReceiptPipeline>,
    pub email: Arc<EmailIngest>,
}

pub fn test_env(extractor: Arc<dyn DocumentExtractor>) -> TestEnv {
    let records = Arc::new(MemoryRecordStore::default());
    let objects = Arc::new(MemoryObjectStore::default());
    let secrets = Arc::new(MemorySecretStore::default());
    let ledger = Arc::new(FakeLedger::default());
    let mailer = Arc::new(RecordingMailer::default());
    let limiter = Arc::new(RateLimiter::new(MAX_CALLS_PER_MINUTE));

    let records_dyn: Arc<dyn RecordStore> = records.clone();
    let objects_dyn: Arc<dyn ObjectStore> = objects.clone();
    let credentials = Arc::new(CredentialManager::new(
        secrets.clone() as Arc<dyn SecretStore>,
        ledger.clone() as Arc<dyn LedgerApi>,
    ));
    let sync = LedgerSync::new(
        records_dyn.clone(),
        credentials.clone(),
        ledger.clone() as Arc<dyn LedgerApi>,
        limiter.clone(),
    );
    let pipeline = Arc::new(ReceiptPipeline::new(
        records_dyn.clone(),
        objects_dyn.clone(),
        extractor,
        sync,
    ));
    let email = Arc::new(EmailIngest::new(
        records_dyn,
        objects_dyn,
        pipeline.clone(),
        mailer.clone() as Arc<dyn Mailer>,
    ));

    TestEnv {
        records,
        objects,
        secrets,
        ledger,
        mailer,
        credentials,
        limiter,
        pipeline,
        email,
    }
}

pub fn active_tenant(tenant_id: &str) -> Tenant {
    Tenant {
        tenant_id: tenant_id.to_string(),
        name: format!("{tenant_id} Pty Ltd"),
        status: String::from("active"),
        contact_email: Some(format!("owner@{tenant_id}.example")),
        settings: TenantSettings {
            processing_enabled: true,
            auto_pay_enabled: false,
            bank_account_id: None,
            authorized_senders: vec![],
        },
        usage: TenantUsage::default(),
    }
}

pub fn integration(tenant_id: &str) -> LedgerIntegration {
    LedgerIntegration {
        tenant_id: tenant_id.to_string(),
        ledger_tenant_id: format!("scope-{tenant_id}"),
        client_id: String::from("client-id"),
        client_secret: String::from("client-secret"),
        currency_code: String::from("AUD"),
    }
}

pub fn mapping(tenant_id: &str, address: &str) -> EmailMapping {
    EmailMapping {
        tenant_id: tenant_id.to_string(),
        email_address: address.to_string(),
        status: String::from("active"),
    }
}

pub async fn seed_credential(secrets: &MemorySecretStore, tenant_id: &str) {
    let credential = TenantCredential {
        tenant_id: tenant_id.to_string(),
        access_token: String::from("valid-token"),
        refresh_token: Some(String::from("refresh-token")),
        expires_at: Utc::now() + Duration::hours(2),
    };
    secrets
        .set_secret(
            &format!("token-{tenant_id}"),
            &serde_json::to_string(&credential).unwrap(),
        )
        .await
        .unwrap();
}

/// Extractor fields for a receipt with a merchant, a total, and optional
/// `(description, quantity, total_price)` items.
pub fn receipt_fields(merchant: &str, total: &str, items: &[(&str, &str, &str)]) -> DocumentFields {
    let items: Vec<serde_json::Value> = items
        .iter()
        .map(|(description, quantity, price)| {
            serde_json::json!({
                "value_object": {
                    "Description": { "value_string": description },
                    "Quantity": { "value_number": quantity },
                    "TotalPrice": { "value_number": price },
                }
            })
        })
        .collect();

    serde_json::from_value(serde_json::json!({
        "MerchantName": { "value_string": merchant },
        "TransactionDate": { "value_date": "2024-05-20" },
        "Total": { "value_currency": { "amount": total } },
        "Items": { "value_array": items },
    }))
    .unwrap()
}
