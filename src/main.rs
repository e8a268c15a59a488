use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use receiptflow::args::parse_args;
use receiptflow::credentials::CredentialManager;
use receiptflow::db::{create_pool, PgRecordStore, RecordStore};
use receiptflow::email::{EmailIngest, LogMailer, Mailer};
use receiptflow::extract::{DocumentExtractor, HttpDocumentExtractor};
use receiptflow::handlers::{email_webhook, get_receipts, upload_receipt};
use receiptflow::jobs::{auto_pay_task, reconciliation_sweep_task};
use receiptflow::ledger::{HttpLedgerClient, LedgerApi};
use receiptflow::logging::setup_logging;
use receiptflow::pipeline::ReceiptPipeline;
use receiptflow::rate_limit::{RateLimiter, MAX_CALLS_PER_MINUTE};
use receiptflow::secrets::{PgSecretStore, SecretStore};
use receiptflow::storage::{FsObjectStore, ObjectStore};
use receiptflow::sync::LedgerSync;
use receiptflow::AppState;

#[tokio::main]
async fn main() {
    let args = parse_args();

    setup_logging(&args.base_log_dir);

    let pool = create_pool(&args.database_url)
        .await
        .expect("Failed to create PostgreSQL pool");

    let records: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool.clone()));
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&args.storage_root));
    let secrets: Arc<dyn SecretStore> = Arc::new(PgSecretStore::new(pool));
    let extractor: Arc<dyn DocumentExtractor> = Arc::new(HttpDocumentExtractor::new(
        args.extractor_endpoint,
        args.extractor_api_key,
    ));
    let ledger: Arc<dyn LedgerApi> = Arc::new(HttpLedgerClient::new(
        args.ledger_api_url,
        args.ledger_token_url,
    ));
    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);

    let limiter = Arc::new(RateLimiter::new(MAX_CALLS_PER_MINUTE));
    let credentials = Arc::new(CredentialManager::new(secrets, ledger.clone()));
    let sync = LedgerSync::new(
        records.clone(),
        credentials.clone(),
        ledger.clone(),
        limiter.clone(),
    );
    let pipeline = Arc::new(ReceiptPipeline::new(
        records.clone(),
        objects.clone(),
        extractor,
        sync,
    ));
    let email = Arc::new(EmailIngest::new(
        records.clone(),
        objects.clone(),
        pipeline.clone(),
        mailer,
    ));

    let app_state = Arc::new(AppState {
        records,
        objects,
        pipeline,
        email,
        credentials,
        ledger,
        limiter,
        sweep_interval: args.sweep_interval,
        auto_pay_interval: args.auto_pay_interval,
    });

    tracing::info!("Spawning background tasks...");
    tokio::spawn(reconciliation_sweep_task(app_state.clone()));
    tokio::spawn(auto_pay_task(app_state.clone()));

    let app = Router::new()
        .route(
            "/api/tenants/{tenant_id}/uploads/{filename}",
            put(upload_receipt),
        )
        .route("/api/tenants/{tenant_id}/receipts", get(get_receipts))
        .route("/webhook/email", post(email_webhook))
        .route("/", get(|| async { "receiptflow" }))
        .with_state(app_state);

    let bind_address = format! {"0.0.0.0:{}", args.port};
    tracing::info!("Server listening on {}...", bind_address);

    let listener = tokio::net::TcpListener::bind(bind_address).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
