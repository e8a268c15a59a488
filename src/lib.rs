pub mod args;
pub mod credentials;
pub mod db;
pub mod domain;
pub mod email;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod rate_limit;
pub mod secrets;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use credentials::CredentialManager;
use db::RecordStore;
use email::EmailIngest;
use ledger::LedgerApi;
use pipeline::ReceiptPipeline;
use rate_limit::RateLimiter;
use storage::ObjectStore;

/// Shared handles for the HTTP handlers and background tasks.
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub pipeline: Arc<ReceiptPipeline>,
    pub email: Arc<EmailIngest>,
    pub credentials: Arc<CredentialManager>,
    pub ledger: Arc<dyn LedgerApi>,
    pub limiter: Arc<RateLimiter>,
    pub sweep_interval: u64,
    pub auto_pay_interval: u64,
}
