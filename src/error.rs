use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("version conflict writing receipt {id}")]
    VersionConflict { id: String },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document analysis request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("document analysis rejected: status={status}")]
    Status { status: u16 },
    #[error("document analysis returned unusable output: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum LedgerApiError {
    #[error("ledger rate limit hit")]
    RateLimited,
    #[error("ledger call failed: status={status} body={body}")]
    Http { status: u16, body: String },
    #[error("ledger transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected ledger response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no usable credential bundle stored")]
    Missing,
    #[error("token refresh rejected: {0}")]
    Refresh(LedgerApiError),
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
    #[error("credential bundle corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no usable access token: {0}")]
    Auth(CredentialError),
    #[error("contact resolution failed for {merchant}: {source}")]
    ContactResolution {
        merchant: String,
        source: LedgerApiError,
    },
    #[error("invoice creation failed: status={status} body={body}")]
    InvoiceCreation { status: u16, body: String },
    #[error("ledger call failed: {0}")]
    Api(LedgerApiError),
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment creation rejected: status={status} body={body}")]
    Creation { status: u16, body: String },
    #[error("payment call failed: {0}")]
    Api(LedgerApiError),
}

impl From<LedgerApiError> for PaymentError {
    fn from(err: LedgerApiError) -> Self {
        match err {
            LedgerApiError::Http { status, body } => PaymentError::Creation { status, body },
            other => PaymentError::Api(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Tenant missing or opted out. Not retryable; nothing was recorded.
    #[error("processing disabled for tenant {0}")]
    ProcessingDisabled(String),
    /// Extraction failed; the upload is untouched and safe to retry.
    #[error("extraction failed for {filename}: {source}")]
    ExtractionFailed {
        filename: String,
        source: ExtractError,
    },
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum EmailIngestError {
    #[error("no tenant registered for recipient {0}")]
    UnknownRecipient(String),
    #[error("sender {0} is not authorized for this tenant")]
    UnauthorizedSender(String),
    #[error("no processable attachments in submission")]
    NoAttachments,
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}
