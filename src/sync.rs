use std::sync::Arc;

use rust_decimal::Decimal;

use crate::credentials::CredentialManager;
use crate::db::RecordStore;
use crate::domain::Receipt;
use crate::error::{LedgerApiError, SyncError};
use crate::ledger::{BillLine, Contact, DraftBill, LedgerApi, LedgerAuth};
use crate::rate_limit::RateLimiter;

/// Default expense account for synced bill lines.
pub const EXPENSE_ACCOUNT_CODE: &str = "310";
/// Ledger-side bound on line descriptions.
pub const MAX_LINE_DESCRIPTION: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { invoice_id: String },
    /// Tenant has no ledger integration; sync is a no-op, not an error.
    NotConfigured,
}

/// Pushes one receipt into the external ledger: resolve the merchant to a
/// contact, then create a draft payable bill. Never retries internally;
/// retry is the caller's (or the next sweep's) responsibility.
pub struct LedgerSync {
    records: Arc<dyn RecordStore>,
    credentials: Arc<CredentialManager>,
    ledger: Arc<dyn LedgerApi>,
    limiter: Arc<RateLimiter>,
}

impl LedgerSync {
    pub fn new(
        records: Arc<dyn RecordStore>,
        credentials: Arc<CredentialManager>,
        ledger: Arc<dyn LedgerApi>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        LedgerSync {
            records,
            credentials,
            ledger,
            limiter,
        }
    }

    pub async fn sync(&self, tenant_id: &str, receipt: &Receipt) -> Result<SyncOutcome, SyncError> {
        let Some(integration) = self.records.get_integration(tenant_id).await? else {
            tracing::info!("No ledger integration configured for tenant_id={}", tenant_id);
            return Ok(SyncOutcome::NotConfigured);
        };

        let access_token = self
            .credentials
            .access_token(tenant_id, &integration)
            .await
            .map_err(SyncError::Auth)?;
        let auth = LedgerAuth {
            access_token,
            scope_tenant_id: integration.ledger_tenant_id.clone(),
        };

        let contact = self.resolve_contact(&auth, &receipt.merchant).await?;

        let bill = DraftBill {
            contact_id: contact.contact_id,
            date: receipt.transaction_date,
            due_date: receipt.transaction_date,
            currency_code: integration.currency_code.clone(),
            lines: build_bill_lines(receipt),
        };

        self.limiter.wait_if_needed().await;
        match self.ledger.create_invoice(&auth, &bill).await {
            Ok(invoice_id) => {
                tracing::info!(
                    "Created draft bill invoice_id={} for receipt id={} tenant_id={}",
                    invoice_id,
                    receipt.id,
                    tenant_id
                );
                Ok(SyncOutcome::Synced { invoice_id })
            }
            Err(LedgerApiError::RateLimited) => {
                self.limiter.note_rejection().await;
                Err(SyncError::Api(LedgerApiError::RateLimited))
            }
            Err(LedgerApiError::Http { status, body }) => {
                Err(SyncError::InvoiceCreation { status, body })
            }
            Err(err) => Err(SyncError::Api(err)),
        }
    }

    /// Search-before-create keeps contact resolution idempotent: an exact
    /// case-insensitive name match is reused, anything else creates a new
    /// supplier contact.
    async fn resolve_contact(
        &self,
        auth: &LedgerAuth,
        merchant: &str,
    ) -> Result<Contact, SyncError> {
        self.limiter.wait_if_needed().await;
        match self.ledger.search_contacts(auth, merchant).await {
            Ok(contacts) => {
                let wanted = merchant.to_lowercase();
                if let Some(contact) = contacts
                    .into_iter()
                    .find(|contact| contact.name.to_lowercase() == wanted)
                {
                    return Ok(contact);
                }
            }
            Err(err) => {
                if matches!(err, LedgerApiError::RateLimited) {
                    self.limiter.note_rejection().await;
                }
                tracing::warn!(
                    "Contact search failed for merchant={}, falling back to create: {}",
                    merchant,
                    err
                );
            }
        }

        self.limiter.wait_if_needed().await;
        match self.ledger.create_contact(auth, merchant).await {
            Ok(contact) => Ok(contact),
            Err(err) => {
                if matches!(err, LedgerApiError::RateLimited) {
                    self.limiter.note_rejection().await;
                }
                Err(SyncError::ContactResolution {
                    merchant: merchant.to_string(),
                    source: err,
                })
            }
        }
    }
}

/// One bill line per receipt item, or a single synthetic line for the total
/// when extraction found no itemization, so every synced receipt produces a
/// non-empty bill.
pub fn build_bill_lines(receipt: &Receipt) -> Vec<BillLine> {
    let tax_type = if receipt.tax_amount > Decimal::ZERO {
        "INPUT"
    } else {
        "NONE"
    };

    if receipt.line_items.is_empty() {
        return vec![BillLine {
            description: format!("{} - {}", receipt.merchant, receipt.transaction_date),
            quantity: Decimal::ONE,
            unit_amount: receipt.total_amount,
            account_code: EXPENSE_ACCOUNT_CODE.to_string(),
            tax_type: tax_type.to_string(),
        }];
    }

    receipt
        .line_items
        .iter()
        .map(|item| BillLine {
            description: truncate_description(&item.description),
            quantity: item.quantity,
            unit_amount: item.unit_amount,
            account_code: EXPENSE_ACCOUNT_CODE.to_string(),
            tax_type: tax_type.to_string(),
        })
        .collect()
}

fn truncate_description(raw: &str) -> String {
    if raw.chars().count() <= MAX_LINE_DESCRIPTION {
        return raw.to_string();
    }
    raw.chars().take(MAX_LINE_DESCRIPTION).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal_macros::dec;

    use crate::domain::{
        LedgerIntegration, LineItem, ReceiptFields, ReceiptOrigin, TenantCredential,
        TOKEN_EXPIRY_SKEW_SECS,
    };
    use crate::memory::{FakeLedger, MemoryRecordStore, MemorySecretStore};
    use crate::rate_limit::MAX_CALLS_PER_MINUTE;
    use crate::secrets::SecretStore;

    fn receipt(line_items: Vec<LineItem>, total: Decimal) -> Receipt {
        Receipt::from_extraction(
            "t1",
            "receipt.pdf",
            ReceiptOrigin::Upload,
            ReceiptFields {
                merchant: String::from("Acme Pty Ltd"),
                transaction_date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
                total_amount: total,
                tax_amount: crate::extract::derived_tax(total),
                line_items,
            },
        )
    }

    async fn engine_with(
        records: Arc<MemoryRecordStore>,
        ledger: Arc<FakeLedger>,
    ) -> LedgerSync {
        let secrets = Arc::new(MemorySecretStore::default());
        let credential = TenantCredential {
            tenant_id: String::from("t1"),
            access_token: String::from("tok"),
            refresh_token: Some(String::from("refresh")),
            expires_at: Utc::now() + Duration::seconds(TOKEN_EXPIRY_SKEW_SECS + 3600),
        };
        secrets
            .set_secret("token-t1", &serde_json::to_string(&credential).unwrap())
            .await
            .unwrap();
        LedgerSync::new(
            records,
            Arc::new(CredentialManager::new(secrets, ledger.clone())),
            ledger,
            Arc::new(RateLimiter::new(MAX_CALLS_PER_MINUTE)),
        )
    }

    fn integration() -> LedgerIntegration {
        LedgerIntegration {
            tenant_id: String::from("t1"),
            ledger_tenant_id: String::from("scope-1"),
            client_id: String::from("client"),
            client_secret: String::from("secret"),
            currency_code: String::from("AUD"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_integration_is_a_benign_no_op() {
        let records = Arc::new(MemoryRecordStore::default());
        let engine = engine_with(records, Arc::new(FakeLedger::default())).await;

        let outcome = engine.sync("t1", &receipt(vec![], dec!(10))).await.unwrap();
        assert_eq!(outcome, SyncOutcome::NotConfigured);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_surface_as_auth_error() {
        let records = Arc::new(MemoryRecordStore::default());
        records.add_integration(integration()).await;
        let ledger = Arc::new(FakeLedger::default());
        let engine = LedgerSync::new(
            records,
            Arc::new(CredentialManager::new(
                Arc::new(MemorySecretStore::default()),
                ledger.clone(),
            )),
            ledger,
            Arc::new(RateLimiter::new(MAX_CALLS_PER_MINUTE)),
        );

        let result = engine.sync("t1", &receipt(vec![], dec!(10))).await;
        assert!(matches!(result, Err(SyncError::Auth(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn existing_contact_is_reused_case_insensitively() {
        let records = Arc::new(MemoryRecordStore::default());
        records.add_integration(integration()).await;
        let ledger = Arc::new(FakeLedger::default());
        ledger.seed_contact("ACME PTY LTD").await;
        let engine = engine_with(records, ledger.clone()).await;

        let document = receipt(vec![], dec!(50.00));
        engine.sync("t1", &document).await.unwrap();
        engine.sync("t1", &document).await.unwrap();

        assert_eq!(ledger.contact_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_merchant_creates_a_supplier_contact() {
        let records = Arc::new(MemoryRecordStore::default());
        records.add_integration(integration()).await;
        let ledger = Arc::new(FakeLedger::default());
        let engine = engine_with(records, ledger.clone()).await;

        let outcome = engine.sync("t1", &receipt(vec![], dec!(20))).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(ledger.contact_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn search_failure_still_resolves_via_create() {
        let records = Arc::new(MemoryRecordStore::default());
        records.add_integration(integration()).await;
        let ledger = Arc::new(FakeLedger::default());
        ledger.fail_contact_search().await;
        let engine = engine_with(records, ledger.clone()).await;

        let outcome = engine.sync("t1", &receipt(vec![], dec!(20))).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_both_legs_is_a_contact_resolution_error() {
        let records = Arc::new(MemoryRecordStore::default());
        records.add_integration(integration()).await;
        let ledger = Arc::new(FakeLedger::default());
        ledger.fail_contact_search().await;
        ledger.fail_contact_create().await;
        let engine = engine_with(records, ledger).await;

        let result = engine.sync("t1", &receipt(vec![], dec!(20))).await;
        assert!(matches!(result, Err(SyncError::ContactResolution { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn invoice_rejection_carries_upstream_status_and_body() {
        let records = Arc::new(MemoryRecordStore::default());
        records.add_integration(integration()).await;
        let ledger = Arc::new(FakeLedger::default());
        ledger.fail_invoices(400, "validation failed").await;
        let engine = engine_with(records, ledger).await;

        match engine.sync("t1", &receipt(vec![], dec!(20))).await {
            Err(SyncError::InvoiceCreation { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "validation failed");
            }
            other => panic!("expected invoice creation error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_itemization_emits_one_synthetic_line() {
        let records = Arc::new(MemoryRecordStore::default());
        records.add_integration(integration()).await;
        let ledger = Arc::new(FakeLedger::default());
        let engine = engine_with(records, ledger.clone()).await;

        engine
            .sync("t1", &receipt(vec![], dec!(50.00)))
            .await
            .unwrap();

        let bills = ledger.created_bills().await;
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0].lines.len(), 1);
        assert_eq!(bills[0].lines[0].unit_amount, dec!(50.00));
        assert_eq!(bills[0].lines[0].quantity, Decimal::ONE);
        assert_eq!(bills[0].lines[0].account_code, EXPENSE_ACCOUNT_CODE);
        assert_eq!(bills[0].lines[0].tax_type, "INPUT");
        assert!(bills[0].lines[0].description.contains("Acme Pty Ltd"));
    }

    #[test]
    fn itemized_receipts_map_one_line_per_item() {
        let document = receipt(
            vec![
                LineItem {
                    description: String::from("Coffee"),
                    quantity: dec!(2),
                    unit_amount: dec!(4.50),
                },
                LineItem {
                    description: "x".repeat(MAX_LINE_DESCRIPTION + 100),
                    quantity: Decimal::ONE,
                    unit_amount: dec!(1.00),
                },
            ],
            dec!(10.00),
        );

        let lines = build_bill_lines(&document);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].quantity, dec!(2));
        assert_eq!(lines[1].description.chars().count(), MAX_LINE_DESCRIPTION);
    }

    #[test]
    fn zero_tax_uses_the_none_tax_type() {
        let document = receipt(vec![], Decimal::ZERO);
        let lines = build_bill_lines(&document);
        assert_eq!(lines[0].tax_type, "NONE");
    }
}
