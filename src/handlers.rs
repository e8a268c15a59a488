use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::RecordStore as _;
use crate::domain::{Receipt, ReceiptOrigin};
use crate::email::{EmailOutcome, EmailSubmission};
use crate::error::{EmailIngestError, IngestError, StoreError};
use crate::storage::{namespace, ObjectStore as _, Stage};
use crate::AppState;

#[derive(Debug, Deserialize, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug)]
pub enum AppError {
    Store(StoreError),
    Ingest(IngestError),
    Email(EmailIngestError),
    BadRequest(String),
    InternalServerError,
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        AppError::Ingest(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Store(err) => {
                tracing::error!("Store error in handler: {:#?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage error".to_string(),
                )
            }
            AppError::Ingest(IngestError::ProcessingDisabled(tenant_id)) => (
                StatusCode::CONFLICT,
                format!("Processing is disabled for tenant {tenant_id}"),
            ),
            AppError::Ingest(IngestError::ExtractionFailed { filename, .. }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Could not extract receipt data from {filename}"),
            ),
            AppError::Ingest(err) => {
                tracing::error!("Ingest error in handler: {:#?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process receipt".to_string(),
                )
            }
            AppError::Email(EmailIngestError::UnknownRecipient(recipient)) => (
                StatusCode::NOT_FOUND,
                format!("No tenant registered for {recipient}"),
            ),
            AppError::Email(EmailIngestError::UnauthorizedSender(sender)) => (
                StatusCode::FORBIDDEN,
                format!("Sender {sender} is not authorized"),
            ),
            AppError::Email(EmailIngestError::NoAttachments) => (
                StatusCode::BAD_REQUEST,
                "No valid receipt attachments found".to_string(),
            ),
            AppError::Email(err) => {
                tracing::error!("Email ingest error in handler: {:#?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process email".to_string(),
                )
            }
            AppError::BadRequest(msg) => {
                tracing::info!("Bad request: {}", &msg);
                (StatusCode::BAD_REQUEST, msg)
            }
            AppError::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (
            status,
            Json(serde_json::json!({ "message": error_message })),
        )
            .into_response()
    }
}

/// Models the new-object-in-upload-namespace trigger: store the bytes, then
/// run the pipeline on them.
#[axum::debug_handler]
pub async fn upload_receipt(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, filename)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<DataResponse<Receipt>>, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest(String::from("Empty upload body")));
    }

    state
        .objects
        .put(&namespace(&tenant_id, Stage::Upload), &filename, &body, None)
        .await?;

    let receipt = state
        .pipeline
        .ingest(&tenant_id, &filename, &body, ReceiptOrigin::Upload)
        .await?;

    Ok(Json(DataResponse { data: receipt }))
}

#[axum::debug_handler]
pub async fn email_webhook(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<EmailSubmission>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.email.process(&submission).await {
        Ok(EmailOutcome::Duplicate) => Ok(Json(serde_json::json!({
            "status": "success",
            "message": "Email already processed",
        }))),
        Ok(EmailOutcome::Processed { processed, total }) if processed > 0 => {
            Ok(Json(serde_json::json!({
                "status": "success",
                "processed": processed,
                "total": total,
            })))
        }
        Ok(EmailOutcome::Processed { .. }) => Err(AppError::InternalServerError),
        Err(err) => Err(AppError::Email(err)),
    }
}

#[axum::debug_handler]
pub async fn get_receipts(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<DataResponse<Vec<Receipt>>>, AppError> {
    let receipts = state
        .records
        .list_receipts(&tenant_id)
        .await
        .inspect_err(|err| {
            tracing::error!("Error querying receipts in get_receipts: {:#?}", err)
        })?;

    Ok(Json(DataResponse { data: receipts }))
}
