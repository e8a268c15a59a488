use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;

use crate::credentials::CredentialManager;
use crate::db::RecordStore;
use crate::domain::{AuditEntry, ReceiptOrigin, Tenant};
use crate::error::{LedgerApiError, PaymentError, StoreError};
use crate::ledger::{parse_due_date, LedgerApi, LedgerAuth, PaymentRequest};
use crate::pipeline::ReceiptPipeline;
use crate::rate_limit::RateLimiter;
use crate::storage::{namespace, ObjectStore, Stage};
use crate::AppState;

/// Per-tenant cap on re-driven uploads per sweep run, to respect the run's
/// wall-clock budget.
pub const SWEEP_BATCH_LIMIT: usize = 5;

pub async fn reconciliation_sweep_task(state: Arc<AppState>) {
    // Create a Tokio interval. The first tick fires immediately.
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.sweep_interval));

    loop {
        interval.tick().await;
        tracing::info!("Running reconciliation_sweep_task...");

        let processed =
            run_reconciliation_sweep(&state.records, &state.objects, &state.pipeline).await;

        tracing::info!(
            "Finished running reconciliation_sweep_task, processed {} pending uploads",
            processed
        );
    }
}

/// Re-drive uploads the event-driven path missed. Every failure is logged
/// and skipped; one tenant's troubles never stall the others.
pub async fn run_reconciliation_sweep(
    records: &Arc<dyn RecordStore>,
    objects: &Arc<dyn ObjectStore>,
    pipeline: &Arc<ReceiptPipeline>,
) -> usize {
    let tenants = match records.list_processing_tenants().await {
        Ok(tenants) => tenants,
        Err(err) => {
            tracing::error!("An error occurred while querying active tenants: {:#?}", err);
            return 0;
        }
    };

    let mut processed = 0;
    for tenant in tenants.iter() {
        let upload_namespace = namespace(&tenant.tenant_id, Stage::Upload);
        let keys = match objects.list(&upload_namespace).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::error!(
                    "Error checking uploads for tenant_id={}: {}",
                    tenant.tenant_id,
                    err
                );
                continue;
            }
        };
        if keys.is_empty() {
            continue;
        }
        tracing::info!(
            "Found {} pending uploads for tenant_id={}",
            keys.len(),
            tenant.tenant_id
        );

        let results: Vec<bool> = stream::iter(keys.into_iter().take(SWEEP_BATCH_LIMIT))
            .map(|key| process_pending_upload(objects, pipeline, &tenant.tenant_id, key))
            .buffered(1)
            .collect()
            .await;
        processed += results.into_iter().filter(|ok| *ok).count();
    }
    processed
}

async fn process_pending_upload(
    objects: &Arc<dyn ObjectStore>,
    pipeline: &Arc<ReceiptPipeline>,
    tenant_id: &str,
    key: String,
) -> bool {
    let upload_namespace = namespace(tenant_id, Stage::Upload);
    let content = match objects.get(&upload_namespace, &key).await {
        Ok(content) => content,
        Err(err) => {
            tracing::error!("Error reading pending upload {}: {}", key, err);
            return false;
        }
    };

    match pipeline
        .ingest(tenant_id, &key, &content, ReceiptOrigin::Upload)
        .await
    {
        Ok(receipt) => {
            tracing::info!(
                "Processed pending upload {} as receipt id={} status={}",
                key,
                receipt.id,
                receipt.status.as_str()
            );
            true
        }
        Err(err) => {
            tracing::error!("Failed to process pending upload {}: {}", key, err);
            false
        }
    }
}

pub async fn auto_pay_task(state: Arc<AppState>) {
    // Create a Tokio interval. The first tick fires immediately.
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.auto_pay_interval));

    loop {
        interval.tick().await;
        tracing::info!("Running auto_pay_task...");

        let paid = run_auto_pay_sweep(
            &state.records,
            &state.credentials,
            &state.ledger,
            &state.limiter,
        )
        .await;

        tracing::info!("Finished running auto_pay_task, created {} payments", paid);
    }
}

/// Pay every awaiting bill for tenants that opted in, one audit entry per
/// payment. A single bill's failure is logged and the batch continues.
pub async fn run_auto_pay_sweep(
    records: &Arc<dyn RecordStore>,
    credentials: &Arc<CredentialManager>,
    ledger: &Arc<dyn LedgerApi>,
    limiter: &Arc<RateLimiter>,
) -> usize {
    let tenants = match records.list_auto_pay_tenants().await {
        Ok(tenants) => tenants,
        Err(err) => {
            tracing::error!(
                "An error occurred while querying auto-pay tenants: {:#?}",
                err
            );
            return 0;
        }
    };

    let mut paid = 0;
    for tenant in tenants.iter() {
        match auto_pay_tenant(records, credentials, ledger, limiter, tenant).await {
            Ok(count) => paid += count,
            Err(err) => {
                tracing::error!("Auto-pay failed for tenant_id={}: {}", tenant.tenant_id, err);
            }
        }
    }
    paid
}

async fn auto_pay_tenant(
    records: &Arc<dyn RecordStore>,
    credentials: &Arc<CredentialManager>,
    ledger: &Arc<dyn LedgerApi>,
    limiter: &Arc<RateLimiter>,
    tenant: &Tenant,
) -> Result<usize, StoreError> {
    let Some(integration) = records.get_integration(&tenant.tenant_id).await? else {
        tracing::info!(
            "No ledger integration for auto-pay tenant_id={}",
            tenant.tenant_id
        );
        return Ok(0);
    };
    let Some(bank_account_id) = tenant.settings.bank_account_id.as_deref() else {
        tracing::info!(
            "No bank account configured for auto-pay tenant_id={}",
            tenant.tenant_id
        );
        return Ok(0);
    };

    let access_token = match credentials
        .access_token(&tenant.tenant_id, &integration)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            tracing::error!(
                "Failed to get access token for auto-pay tenant_id={}: {}",
                tenant.tenant_id,
                err
            );
            return Ok(0);
        }
    };
    let auth = LedgerAuth {
        access_token,
        scope_tenant_id: integration.ledger_tenant_id.clone(),
    };

    limiter.wait_if_needed().await;
    let bills = match ledger.list_awaiting_payment(&auth).await {
        Ok(bills) => bills,
        Err(err) => {
            if matches!(err, LedgerApiError::RateLimited) {
                limiter.note_rejection().await;
            }
            tracing::error!(
                "Error listing awaiting bills for tenant_id={}: {}",
                tenant.tenant_id,
                err
            );
            return Ok(0);
        }
    };

    let today = Utc::now().date_naive();
    let mut paid = 0;
    for bill in bills.iter().filter(|bill| bill.amount_due > Decimal::ZERO) {
        limiter.wait_if_needed().await;

        let payment_date = bill
            .due_date
            .as_deref()
            .map(|raw| parse_due_date(raw, today))
            .unwrap_or(today);
        let payment = PaymentRequest {
            invoice_id: bill.invoice_id.clone(),
            account_id: bank_account_id.to_string(),
            date: payment_date,
            amount: bill.amount_due,
        };

        match ledger.create_payment(&auth, &payment).await {
            Ok(()) => {
                tracing::info!(
                    "Created auto-payment for invoice_id={} amount={}",
                    bill.invoice_id,
                    bill.amount_due
                );
                let entry = AuditEntry::auto_payment(
                    &tenant.tenant_id,
                    &bill.invoice_id,
                    bill.amount_due,
                    payment_date,
                );
                if let Err(err) = records.insert_audit(&entry).await {
                    tracing::error!(
                        "Failed to record audit entry for invoice_id={}: {}",
                        bill.invoice_id,
                        err
                    );
                }
                paid += 1;
            }
            Err(err) => {
                if matches!(err, LedgerApiError::RateLimited) {
                    limiter.note_rejection().await;
                }
                let err = PaymentError::from(err);
                tracing::error!(
                    "Error creating auto-payment for invoice_id={}: {}",
                    bill.invoice_id,
                    err
                );
            }
        }
    }
    Ok(paid)
}
