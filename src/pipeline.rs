use std::sync::Arc;

use chrono::Utc;

use crate::db::RecordStore;
use crate::domain::{LedgerSyncStatus, Receipt, ReceiptOrigin};
use crate::error::IngestError;
use crate::extract::{normalize, DocumentExtractor};
use crate::storage::{namespace, ObjectStore, Stage};
use crate::sync::{LedgerSync, SyncOutcome};

/// Drives one document from the upload namespace to a terminal receipt
/// state. Side effects run in a fixed order so a crash mid-pipeline never
/// loses the source document: the upload copy is deleted only after a
/// terminal state is durably recorded.
pub struct ReceiptPipeline {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn DocumentExtractor>,
    sync: LedgerSync,
}

impl ReceiptPipeline {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn DocumentExtractor>,
        sync: LedgerSync,
    ) -> Self {
        ReceiptPipeline {
            records,
            objects,
            extractor,
            sync,
        }
    }

    pub async fn ingest(
        &self,
        tenant_id: &str,
        filename: &str,
        content: &[u8],
        origin: ReceiptOrigin,
    ) -> Result<Receipt, IngestError> {
        let tenant = self.records.get_tenant(tenant_id).await?;
        if !tenant.is_some_and(|tenant| tenant.settings.processing_enabled) {
            tracing::info!("Processing disabled for tenant_id={}", tenant_id);
            return Err(IngestError::ProcessingDisabled(tenant_id.to_string()));
        }

        // Extraction failure leaves the upload untouched for a later sweep
        // or manual retry; nothing has been recorded yet.
        let fields = self.extractor.analyze(content).await.map_err(|source| {
            tracing::error!("Failed to extract data from {}: {}", filename, source);
            IngestError::ExtractionFailed {
                filename: filename.to_string(),
                source,
            }
        })?;
        let normalized = normalize(&fields, Utc::now().date_naive());

        let mut receipt = Receipt::from_extraction(tenant_id, filename, origin, normalized);
        self.records.insert_receipt(&receipt).await?;
        tracing::info!(
            "Stored receipt id={} merchant={} tenant_id={}",
            receipt.id,
            receipt.merchant,
            tenant_id
        );

        // Durability checkpoint before any destructive ledger calls.
        if let Err(err) = self
            .objects
            .put(&namespace(tenant_id, Stage::Processing), filename, content, None)
            .await
        {
            tracing::error!("Failed to copy {} to processing storage: {}", filename, err);
        }

        let now = Utc::now();
        match self.sync.sync(tenant_id, &receipt).await {
            Ok(SyncOutcome::Synced { invoice_id }) => {
                if let Err(err) = self
                    .objects
                    .put(&namespace(tenant_id, Stage::Complete), filename, content, None)
                    .await
                {
                    tracing::error!("Failed to copy {} to complete storage: {}", filename, err);
                }
                receipt.mark_completed(invoice_id, now);
            }
            Ok(SyncOutcome::NotConfigured) => {
                // Sync never ran, so the ledger fields stay pending; the
                // receipt still lands in a terminal non-success state.
                receipt.mark_failed(LedgerSyncStatus::Pending, now);
            }
            Err(err) => {
                tracing::error!(
                    "Ledger sync failed for receipt id={} tenant_id={}: {}",
                    receipt.id,
                    tenant_id,
                    err
                );
                receipt.mark_failed(LedgerSyncStatus::Error, now);
            }
        }

        let recorded = match self.records.update_receipt(&receipt).await {
            Ok(()) => {
                receipt.version += 1;
                true
            }
            Err(err) => {
                tracing::error!(
                    "Failed to record terminal state for receipt id={}: {}",
                    receipt.id,
                    err
                );
                false
            }
        };

        if let Err(err) = self.records.record_tenant_usage(tenant_id, now).await {
            tracing::error!("Failed to update usage for tenant_id={}: {}", tenant_id, err);
        }

        // Cleanup happens last, and only once the terminal state is durable,
        // so any earlier failure leaves the source recoverable.
        if recorded {
            if let Err(err) = self
                .objects
                .delete(&namespace(tenant_id, Stage::Upload), filename)
                .await
            {
                tracing::error!("Failed to remove {} from upload storage: {}", filename, err);
            }
        }

        Ok(receipt)
    }
}
