use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::db::RecordStore;
use crate::domain::{ReceiptOrigin, Tenant};
use crate::error::EmailIngestError;
use crate::pipeline::ReceiptPipeline;
use crate::storage::{namespace, ObjectStore, Stage};

/// Attachment types the extractor can make sense of.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".heif", ".docx", ".xlsx", ".pptx", ".html",
];

const ERROR_SUBJECT: &str = "Receipt Processing Error";

/// One inbound email, as delivered by the mail provider's webhook. The
/// provider handles MIME parsing; attachments arrive base64-encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailSubmission {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: String,
    pub content_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailOutcome {
    Processed { processed: usize, total: usize },
    /// Same message seen before; nothing re-ingested.
    Duplicate,
}

/// Outbound notification boundary. Sending is best effort; implementations
/// log their own failures.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str);
}

/// Default mailer when no provider is wired: notifications land in the log.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, _html_body: &str) {
        tracing::info!("Skipping outbound email to={} subject={}", to, subject);
    }
}

/// Validates and deduplicates inbound email submissions, stores their
/// attachments into the tenant's upload namespace, and drives each through
/// the same ingestion pipeline as direct uploads.
pub struct EmailIngest {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    pipeline: Arc<ReceiptPipeline>,
    mailer: Arc<dyn Mailer>,
    seen: Mutex<HashSet<String>>,
}

impl EmailIngest {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        pipeline: Arc<ReceiptPipeline>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        EmailIngest {
            records,
            objects,
            pipeline,
            mailer,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub async fn process(
        &self,
        submission: &EmailSubmission,
    ) -> Result<EmailOutcome, EmailIngestError> {
        let sender = normalize_address(&submission.from);
        let recipient = normalize_address(&submission.to);
        tracing::info!("Processing email from {} to {}", sender, recipient);

        let fingerprint = submission_fingerprint(&submission.message_id, &sender);
        if self.seen.lock().await.contains(&fingerprint) {
            tracing::info!("Email already processed: {}", fingerprint);
            return Ok(EmailOutcome::Duplicate);
        }

        let Some(mapping) = self.records.find_email_mapping(&recipient).await? else {
            tracing::warn!("No tenant found for email: {} from {}", recipient, sender);
            self.mailer
                .send(
                    &sender,
                    ERROR_SUBJECT,
                    &error_body("Email address not registered"),
                )
                .await;
            return Err(EmailIngestError::UnknownRecipient(recipient));
        };

        let tenant = self.records.get_tenant(&mapping.tenant_id).await?;
        if !tenant
            .as_ref()
            .is_some_and(|tenant| sender_authorized(tenant, &sender))
        {
            tracing::warn!(
                "Sender {} is not authorized for tenant_id={}",
                sender,
                mapping.tenant_id
            );
            self.mailer
                .send(
                    &sender,
                    ERROR_SUBJECT,
                    &error_body("Sender is not authorized for this account"),
                )
                .await;
            return Err(EmailIngestError::UnauthorizedSender(sender));
        }

        let accepted: Vec<&EmailAttachment> = submission
            .attachments
            .iter()
            .filter(|attachment| supported_extension(&attachment.filename))
            .collect();
        if accepted.is_empty() {
            tracing::warn!("No valid attachments found in email from {}", sender);
            self.mailer
                .send(
                    &sender,
                    ERROR_SUBJECT,
                    &error_body("No valid receipt attachments found"),
                )
                .await;
            return Err(EmailIngestError::NoAttachments);
        }

        let received_at = Utc::now();
        let total = accepted.len();
        let results: Vec<bool> = stream::iter(accepted)
            .then(|attachment| {
                self.process_attachment(
                    &mapping.tenant_id,
                    attachment,
                    &sender,
                    &submission.subject,
                    received_at,
                )
            })
            .collect()
            .await;
        let processed = results.into_iter().filter(|ok| *ok).count();

        if processed > 0 {
            self.mailer
                .send(
                    &sender,
                    &format!("Receipt Processed - {}", submission.subject),
                    &confirmation_body(processed, &submission.subject),
                )
                .await;
        }

        self.seen.lock().await.insert(fingerprint);
        tracing::info!(
            "Processed {}/{} attachments from {}",
            processed,
            total,
            sender
        );
        Ok(EmailOutcome::Processed { processed, total })
    }

    async fn process_attachment(
        &self,
        tenant_id: &str,
        attachment: &EmailAttachment,
        sender: &str,
        subject: &str,
        received_at: DateTime<Utc>,
    ) -> bool {
        let bytes = match BASE64.decode(attachment.content_base64.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(
                    "Attachment {} is not valid base64: {}",
                    attachment.filename,
                    err
                );
                return false;
            }
        };

        let safe_filename = format!(
            "email_{}_{}_{}",
            received_at.format("%Y%m%d_%H%M%S"),
            sender_hash(sender),
            attachment.filename
        );

        let mut metadata = HashMap::new();
        metadata.insert(String::from("source"), String::from("email"));
        metadata.insert(String::from("sender"), sender.to_string());
        metadata.insert(String::from("subject"), subject.to_string());
        metadata.insert(
            String::from("original_filename"),
            attachment.filename.clone(),
        );
        metadata.insert(String::from("received_at"), received_at.to_rfc3339());

        if let Err(err) = self
            .objects
            .put(
                &namespace(tenant_id, Stage::Upload),
                &safe_filename,
                &bytes,
                Some(&metadata),
            )
            .await
        {
            tracing::error!("Failed to store attachment {}: {}", safe_filename, err);
            return false;
        }
        tracing::info!(
            "Uploaded attachment {} for tenant_id={}",
            safe_filename,
            tenant_id
        );

        match self
            .pipeline
            .ingest(tenant_id, &safe_filename, &bytes, ReceiptOrigin::Email)
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    "Ingested email attachment as receipt id={} status={}",
                    receipt.id,
                    receipt.status.as_str()
                );
                true
            }
            Err(err) => {
                tracing::error!("Failed to ingest attachment {}: {}", safe_filename, err);
                false
            }
        }
    }
}

fn sender_authorized(tenant: &Tenant, sender: &str) -> bool {
    if tenant
        .contact_email
        .as_deref()
        .is_some_and(|contact| contact.eq_ignore_ascii_case(sender))
    {
        return true;
    }
    tenant
        .settings
        .authorized_senders
        .iter()
        .any(|authorized| authorized.eq_ignore_ascii_case(sender))
}

/// Reduce `Name <addr@host>` headers to the bare lowercased address.
pub fn normalize_address(raw: &str) -> String {
    if let Some(start) = raw.find('<') {
        if let Some(end) = raw[start + 1..].find('>') {
            return raw[start + 1..start + 1 + end].trim().to_lowercase();
        }
    }
    raw.trim().to_lowercase()
}

fn submission_fingerprint(message_id: &str, sender: &str) -> String {
    hex::encode(Sha256::digest(format!("{message_id}{sender}").as_bytes()))
}

fn sender_hash(sender: &str) -> String {
    hex::encode(Sha256::digest(sender.as_bytes()))[..8].to_string()
}

fn supported_extension(filename: &str) -> bool {
    let lowered = filename.to_lowercase();
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|extension| lowered.ends_with(extension))
}

fn confirmation_body(count: usize, subject: &str) -> String {
    format!(
        "<html><body>\
         <h2>Receipt Successfully Processed</h2>\
         <p>Attachments processed: {count}</p>\
         <p>Original subject: {subject}</p>\
         </body></html>"
    )
}

fn error_body(reason: &str) -> String {
    format!(
        "<html><body>\
         <h2>Receipt Processing Error</h2>\
         <p>{reason}</p>\
         <p>Make sure you are sending from an authorized address and that \
         attachments are in a supported format.</p>\
         </body></html>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_extracted_and_lowercased() {
        assert_eq!(
            normalize_address("Jane Doe <Jane@Example.COM>"),
            "jane@example.com"
        );
        assert_eq!(normalize_address("  bob@host.io "), "bob@host.io");
    }

    #[test]
    fn extension_whitelist_is_case_insensitive() {
        assert!(supported_extension("receipt.PDF"));
        assert!(supported_extension("photo.jpeg"));
        assert!(!supported_extension("malware.exe"));
        assert!(!supported_extension("noextension"));
    }

    #[test]
    fn fingerprints_depend_on_message_and_sender() {
        let a = submission_fingerprint("<m1@host>", "a@x.io");
        let b = submission_fingerprint("<m1@host>", "b@x.io");
        let c = submission_fingerprint("<m2@host>", "a@x.io");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, submission_fingerprint("<m1@host>", "a@x.io"));
    }
}
