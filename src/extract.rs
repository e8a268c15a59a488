use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{LineItem, ReceiptFields};
use crate::error::ExtractError;

const FALLBACK_MERCHANT: &str = "Unknown Vendor";

/// Typed fields returned by the document-understanding service. Every field
/// is individually optional, and amounts arrive either currency-typed or as
/// plain numbers depending on what the model recognized.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentFields {
    #[serde(rename = "MerchantName")]
    pub merchant_name: Option<StringField>,
    #[serde(rename = "VendorName")]
    pub vendor_name: Option<StringField>,
    #[serde(rename = "TransactionDate")]
    pub transaction_date: Option<DateField>,
    #[serde(rename = "Total")]
    pub total: Option<AmountField>,
    #[serde(rename = "Items")]
    pub items: Option<ItemsField>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StringField {
    pub value_string: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DateField {
    pub value_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AmountField {
    pub value_currency: Option<CurrencyValue>,
    pub value_number: Option<Decimal>,
}

impl AmountField {
    pub fn amount(&self) -> Option<Decimal> {
        self.value_currency
            .as_ref()
            .map(|currency| currency.amount)
            .or(self.value_number)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyValue {
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NumberField {
    pub value_number: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemsField {
    #[serde(default)]
    pub value_array: Vec<ItemObject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemObject {
    #[serde(default)]
    pub value_object: ItemFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemFields {
    #[serde(rename = "Description")]
    pub description: Option<StringField>,
    #[serde(rename = "Quantity")]
    pub quantity: Option<NumberField>,
    #[serde(rename = "TotalPrice")]
    pub total_price: Option<AmountField>,
}

/// Black-box extractor boundary: bytes in, typed optional fields out.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn analyze(&self, content: &[u8]) -> Result<DocumentFields, ExtractError>;
}

/// Tax is never read from the document; it is derived at a fixed 10% of the
/// total. Single-jurisdiction GST assumption, preserved for compatibility
/// with existing synced records.
pub fn derived_tax(total_amount: Decimal) -> Decimal {
    if total_amount > Decimal::ZERO {
        (total_amount * Decimal::new(10, 2)).round_dp(2)
    } else {
        Decimal::ZERO
    }
}

/// Normalize raw extractor output into canonical receipt fields. A document
/// that parses but yields no merchant, items, or total still normalizes
/// successfully; the sync engine later falls back to a synthetic line item.
pub fn normalize(fields: &DocumentFields, today: NaiveDate) -> ReceiptFields {
    let merchant = fields
        .merchant_name
        .as_ref()
        .and_then(|field| field.value_string.as_deref())
        .or_else(|| {
            fields
                .vendor_name
                .as_ref()
                .and_then(|field| field.value_string.as_deref())
        })
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(FALLBACK_MERCHANT)
        .to_string();

    let transaction_date = fields
        .transaction_date
        .as_ref()
        .and_then(|field| field.value_date)
        .unwrap_or(today);

    let total_amount = fields
        .total
        .as_ref()
        .and_then(AmountField::amount)
        .unwrap_or(Decimal::ZERO);

    let line_items = fields
        .items
        .as_ref()
        .map(|items| {
            items
                .value_array
                .iter()
                .filter_map(|item| normalize_item(&item.value_object))
                .collect()
        })
        .unwrap_or_default();

    ReceiptFields {
        merchant,
        transaction_date,
        total_amount,
        tax_amount: derived_tax(total_amount),
        line_items,
    }
}

// An item needs both a description and a non-zero amount to survive.
fn normalize_item(item: &ItemFields) -> Option<LineItem> {
    let description = item
        .description
        .as_ref()
        .and_then(|field| field.value_string.as_deref())
        .map(str::trim)
        .filter(|description| !description.is_empty())?;
    let unit_amount = item
        .total_price
        .as_ref()
        .and_then(AmountField::amount)
        .filter(|amount| !amount.is_zero())?;
    let quantity = item
        .quantity
        .as_ref()
        .and_then(|field| field.value_number)
        .unwrap_or(Decimal::ONE);

    Some(LineItem {
        description: description.to_string(),
        quantity,
        unit_amount,
    })
}

/// HTTP client for the document-understanding service.
pub struct HttpDocumentExtractor {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpDocumentExtractor {
    pub fn new(endpoint: String, api_key: String) -> Self {
        HttpDocumentExtractor {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    documents: Vec<AnalyzedDocument>,
}

#[derive(Debug, Deserialize)]
struct AnalyzedDocument {
    #[serde(default)]
    fields: Option<DocumentFields>,
}

#[async_trait]
impl DocumentExtractor for HttpDocumentExtractor {
    async fn analyze(&self, content: &[u8]) -> Result<DocumentFields, ExtractError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/octet-stream")
            .body(content.to_vec())
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in document analysis request: {:#?}", err);
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            tracing::error!("Document analysis rejected with status={}", status);
            return Err(ExtractError::Status { status });
        }

        let analysis = response.json::<AnalyzeResponse>().await.inspect_err(|err| {
            tracing::error!(
                "Error occurred while deserialising analysis response: {:#?}",
                err
            );
        })?;

        Ok(analysis
            .documents
            .into_iter()
            .next()
            .and_then(|document| document.fields)
            .unwrap_or_default())
    }
}
