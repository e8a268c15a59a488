//! In-memory backends and scripted fakes. These drive the unit and
//! integration tests, and double as a local backend when poking at the
//! pipeline without external services.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::RecordStore;
use crate::domain::{AuditEntry, EmailMapping, LedgerIntegration, Receipt, Tenant};
use crate::email::Mailer;
use crate::error::{ExtractError, LedgerApiError, StoreError};
use crate::extract::{DocumentExtractor, DocumentFields};
use crate::ledger::{AwaitingBill, Contact, DraftBill, LedgerApi, LedgerAuth, PaymentRequest, TokenGrant};
use crate::secrets::SecretStore;
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    metadata: Option<HashMap<String, String>>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    namespaces: Mutex<HashMap<String, HashMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub async fn metadata(&self, namespace: &str, key: &str) -> Option<HashMap<String, String>> {
        let namespaces = self.namespaces.lock().await;
        namespaces
            .get(namespace)
            .and_then(|objects| objects.get(key))
            .and_then(|object| object.metadata.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        bytes: &[u8],
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.lock().await;
        namespaces.entry(namespace.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                metadata: metadata.cloned(),
            },
        );
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let namespaces = self.namespaces.lock().await;
        namespaces
            .get(namespace)
            .and_then(|objects| objects.get(key))
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{key}")))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.lock().await;
        let removed = namespaces
            .get_mut(namespace)
            .and_then(|objects| objects.remove(key));
        if removed.is_none() {
            return Err(StoreError::NotFound(format!("{namespace}/{key}")));
        }
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let namespaces = self.namespaces.lock().await;
        let mut keys: Vec<String> = namespaces
            .get(namespace)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.secrets.lock().await.get(name).cloned())
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordState {
    tenants: HashMap<String, Tenant>,
    receipts: Vec<Receipt>,
    integrations: HashMap<String, LedgerIntegration>,
    mappings: Vec<EmailMapping>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<RecordState>,
}

impl MemoryRecordStore {
    pub async fn add_tenant(&self, tenant: Tenant) {
        self.state
            .lock()
            .await
            .tenants
            .insert(tenant.tenant_id.clone(), tenant);
    }

    pub async fn add_integration(&self, integration: LedgerIntegration) {
        self.state
            .lock()
            .await
            .integrations
            .insert(integration.tenant_id.clone(), integration);
    }

    pub async fn add_mapping(&self, mapping: EmailMapping) {
        self.state.lock().await.mappings.push(mapping);
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.state.lock().await.tenants.get(tenant_id).cloned())
    }

    async fn list_processing_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tenants
            .values()
            .filter(|tenant| tenant.is_active() && tenant.settings.processing_enabled)
            .cloned()
            .collect())
    }

    async fn list_auto_pay_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tenants
            .values()
            .filter(|tenant| tenant.is_active() && tenant.settings.auto_pay_enabled)
            .cloned()
            .collect())
    }

    async fn record_tenant_usage(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.usage.receipts_processed += 1;
        tenant.usage.last_processing = Some(at);
        Ok(())
    }

    async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StoreError> {
        self.state.lock().await.receipts.push(receipt.clone());
        Ok(())
    }

    async fn get_receipt(&self, tenant_id: &str, id: &str) -> Result<Option<Receipt>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .receipts
            .iter()
            .find(|receipt| receipt.tenant_id == tenant_id && receipt.id == id)
            .cloned())
    }

    async fn list_receipts(&self, tenant_id: &str) -> Result<Vec<Receipt>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .receipts
            .iter()
            .filter(|receipt| receipt.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn update_receipt(&self, receipt: &Receipt) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .receipts
            .iter_mut()
            .find(|stored| stored.tenant_id == receipt.tenant_id && stored.id == receipt.id)
            .ok_or_else(|| StoreError::NotFound(format!("receipt {}", receipt.id)))?;
        if stored.version != receipt.version {
            return Err(StoreError::VersionConflict {
                id: receipt.id.clone(),
            });
        }
        *stored = Receipt {
            version: receipt.version + 1,
            ..receipt.clone()
        };
        Ok(())
    }

    async fn get_integration(
        &self,
        tenant_id: &str,
    ) -> Result<Option<LedgerIntegration>, StoreError> {
        Ok(self.state.lock().await.integrations.get(tenant_id).cloned())
    }

    async fn find_email_mapping(
        &self,
        email_address: &str,
    ) -> Result<Option<EmailMapping>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .mappings
            .iter()
            .find(|mapping| {
                mapping.status == "active"
                    && mapping.email_address.eq_ignore_ascii_case(email_address)
            })
            .cloned())
    }

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.state.lock().await.audit.push(entry.clone());
        Ok(())
    }
}

/// Scripted extractor: returns fixed fields, or fails on demand.
pub struct ScriptedExtractor {
    script: Mutex<Result<DocumentFields, String>>,
    calls: Mutex<usize>,
}

impl ScriptedExtractor {
    pub fn succeeding(fields: DocumentFields) -> Self {
        ScriptedExtractor {
            script: Mutex::new(Ok(fields)),
            calls: Mutex::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        ScriptedExtractor {
            script: Mutex::new(Err(reason.to_string())),
            calls: Mutex::new(0),
        }
    }

    pub async fn calls(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl DocumentExtractor for ScriptedExtractor {
    async fn analyze(&self, _content: &[u8]) -> Result<DocumentFields, ExtractError> {
        *self.calls.lock().await += 1;
        match &*self.script.lock().await {
            Ok(fields) => Ok(fields.clone()),
            Err(reason) => Err(ExtractError::Decode(reason.clone())),
        }
    }
}

#[derive(Default)]
struct LedgerState {
    contacts: Vec<Contact>,
    bills: Vec<DraftBill>,
    awaiting: Vec<AwaitingBill>,
    payments: Vec<PaymentRequest>,
    refresh_calls: usize,
    refresh_error: bool,
    search_error: bool,
    contact_create_error: bool,
    invoice_error: Option<(u16, String)>,
    payment_failures: HashSet<String>,
}

/// In-memory stand-in for the external ledger, with toggles to script the
/// failure paths.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub async fn seed_contact(&self, name: &str) {
        let mut state = self.state.lock().await;
        let contact_id = format!("contact-{}", state.contacts.len() + 1);
        state.contacts.push(Contact {
            contact_id,
            name: name.to_string(),
        });
    }

    pub async fn seed_awaiting_bill(&self, bill: AwaitingBill) {
        self.state.lock().await.awaiting.push(bill);
    }

    pub async fn contact_count(&self) -> usize {
        self.state.lock().await.contacts.len()
    }

    pub async fn created_bills(&self) -> Vec<DraftBill> {
        self.state.lock().await.bills.clone()
    }

    pub async fn payments(&self) -> Vec<PaymentRequest> {
        self.state.lock().await.payments.clone()
    }

    pub async fn refresh_calls(&self) -> usize {
        self.state.lock().await.refresh_calls
    }

    pub async fn fail_refresh(&self) {
        self.state.lock().await.refresh_error = true;
    }

    pub async fn fail_contact_search(&self) {
        self.state.lock().await.search_error = true;
    }

    pub async fn fail_contact_create(&self) {
        self.state.lock().await.contact_create_error = true;
    }

    pub async fn fail_invoices(&self, status: u16, body: &str) {
        self.state.lock().await.invoice_error = Some((status, body.to_string()));
    }

    pub async fn fail_payment_for(&self, invoice_id: &str) {
        self.state
            .lock()
            .await
            .payment_failures
            .insert(invoice_id.to_string());
    }
}

#[async_trait]
impl LedgerApi for FakeLedger {
    async fn refresh_token(
        &self,
        _client_id: &str,
        _client_secret: &str,
        _refresh_token: &str,
    ) -> Result<TokenGrant, LedgerApiError> {
        let mut state = self.state.lock().await;
        if state.refresh_error {
            return Err(LedgerApiError::Http {
                status: 400,
                body: String::from("invalid_grant"),
            });
        }
        state.refresh_calls += 1;
        Ok(TokenGrant {
            access_token: format!("fresh-token-{}", state.refresh_calls),
            refresh_token: format!("fresh-refresh-{}", state.refresh_calls),
            expires_in: 1800,
        })
    }

    async fn search_contacts(
        &self,
        _auth: &LedgerAuth,
        name: &str,
    ) -> Result<Vec<Contact>, LedgerApiError> {
        let state = self.state.lock().await;
        if state.search_error {
            return Err(LedgerApiError::Http {
                status: 500,
                body: String::from("search unavailable"),
            });
        }
        let needle = name.to_lowercase();
        Ok(state
            .contacts
            .iter()
            .filter(|contact| contact.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn create_contact(
        &self,
        _auth: &LedgerAuth,
        name: &str,
    ) -> Result<Contact, LedgerApiError> {
        let mut state = self.state.lock().await;
        if state.contact_create_error {
            return Err(LedgerApiError::Http {
                status: 500,
                body: String::from("contact create unavailable"),
            });
        }
        let contact = Contact {
            contact_id: format!("contact-{}", state.contacts.len() + 1),
            name: name.to_string(),
        };
        state.contacts.push(contact.clone());
        Ok(contact)
    }

    async fn create_invoice(
        &self,
        _auth: &LedgerAuth,
        bill: &DraftBill,
    ) -> Result<String, LedgerApiError> {
        let mut state = self.state.lock().await;
        if let Some((status, body)) = state.invoice_error.clone() {
            return Err(LedgerApiError::Http { status, body });
        }
        state.bills.push(bill.clone());
        Ok(format!("INV-{}", state.bills.len()))
    }

    async fn list_awaiting_payment(
        &self,
        _auth: &LedgerAuth,
    ) -> Result<Vec<AwaitingBill>, LedgerApiError> {
        Ok(self.state.lock().await.awaiting.clone())
    }

    async fn create_payment(
        &self,
        _auth: &LedgerAuth,
        payment: &PaymentRequest,
    ) -> Result<(), LedgerApiError> {
        let mut state = self.state.lock().await;
        if state.payment_failures.contains(&payment.invoice_id) {
            return Err(LedgerApiError::Http {
                status: 400,
                body: String::from("payment rejected"),
            });
        }
        state.payments.push(payment.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Captures outbound notifications for assertions.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) {
        self.sent.lock().await.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: html_body.to_string(),
        });
    }
}
