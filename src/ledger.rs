use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerApiError;

/// Bearer token plus the ledger-side tenant scope for one call sequence.
#[derive(Debug, Clone)]
pub struct LedgerAuth {
    pub access_token: String,
    pub scope_tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "ContactID")]
    pub contact_id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillLine {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Quantity")]
    pub quantity: Decimal,
    #[serde(rename = "UnitAmount")]
    pub unit_amount: Decimal,
    #[serde(rename = "AccountCode")]
    pub account_code: String,
    #[serde(rename = "TaxType")]
    pub tax_type: String,
}

/// A payable bill to be created in draft state.
#[derive(Debug, Clone)]
pub struct DraftBill {
    pub contact_id: String,
    pub date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency_code: String,
    pub lines: Vec<BillLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwaitingBill {
    #[serde(rename = "InvoiceID")]
    pub invoice_id: String,
    #[serde(rename = "AmountDue", default)]
    pub amount_due: Decimal,
    #[serde(rename = "DueDate", default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub invoice_id: String,
    pub account_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
}

/// The external accounting ledger's API surface, as the pipeline consumes
/// it. The HTTP client below is the production implementation; tests inject
/// an in-memory fake.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn refresh_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, LedgerApiError>;

    async fn search_contacts(
        &self,
        auth: &LedgerAuth,
        name: &str,
    ) -> Result<Vec<Contact>, LedgerApiError>;

    async fn create_contact(
        &self,
        auth: &LedgerAuth,
        name: &str,
    ) -> Result<Contact, LedgerApiError>;

    /// Creates the draft bill and returns the new invoice id.
    async fn create_invoice(
        &self,
        auth: &LedgerAuth,
        bill: &DraftBill,
    ) -> Result<String, LedgerApiError>;

    async fn list_awaiting_payment(
        &self,
        auth: &LedgerAuth,
    ) -> Result<Vec<AwaitingBill>, LedgerApiError>;

    async fn create_payment(
        &self,
        auth: &LedgerAuth,
        payment: &PaymentRequest,
    ) -> Result<(), LedgerApiError>;
}

pub struct HttpLedgerClient {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
}

#[derive(Serialize)]
struct NewContact {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IsSupplier")]
    is_supplier: bool,
    #[serde(rename = "IsCustomer")]
    is_customer: bool,
}

#[derive(Serialize)]
struct ContactsEnvelope {
    #[serde(rename = "Contacts")]
    contacts: Vec<NewContact>,
}

#[derive(Deserialize)]
struct ContactsPage {
    #[serde(rename = "Contacts", default)]
    contacts: Vec<Contact>,
}

#[derive(Serialize)]
struct ContactRef {
    #[serde(rename = "ContactID")]
    contact_id: String,
}

#[derive(Serialize)]
struct InvoicePayload {
    #[serde(rename = "Type")]
    invoice_type: &'static str,
    #[serde(rename = "Contact")]
    contact: ContactRef,
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "DueDate")]
    due_date: String,
    #[serde(rename = "LineAmountTypes")]
    line_amount_types: &'static str,
    #[serde(rename = "LineItems")]
    line_items: Vec<BillLine>,
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "CurrencyCode")]
    currency_code: String,
}

#[derive(Serialize)]
struct InvoicesEnvelope {
    #[serde(rename = "Invoices")]
    invoices: Vec<InvoicePayload>,
}

#[derive(Deserialize)]
struct CreatedInvoice {
    #[serde(rename = "InvoiceID")]
    invoice_id: String,
}

#[derive(Deserialize)]
struct CreatedInvoicesPage {
    #[serde(rename = "Invoices", default)]
    invoices: Vec<CreatedInvoice>,
}

#[derive(Deserialize)]
struct AwaitingBillsPage {
    #[serde(rename = "Invoices", default)]
    invoices: Vec<AwaitingBill>,
}

#[derive(Serialize)]
struct InvoiceRef {
    #[serde(rename = "InvoiceID")]
    invoice_id: String,
}

#[derive(Serialize)]
struct AccountRef {
    #[serde(rename = "AccountID")]
    account_id: String,
}

#[derive(Serialize)]
struct PaymentPayload {
    #[serde(rename = "Invoice")]
    invoice: InvoiceRef,
    #[serde(rename = "Account")]
    account: AccountRef,
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Amount")]
    amount: Decimal,
}

#[derive(Serialize)]
struct PaymentsEnvelope {
    #[serde(rename = "Payments")]
    payments: Vec<PaymentPayload>,
}

impl HttpLedgerClient {
    pub fn new(api_base: String, token_url: String) -> Self {
        HttpLedgerClient {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url,
        }
    }

    fn authed(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &LedgerAuth,
    ) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&auth.access_token)
            .header("tenant-scope-id", &auth.scope_tenant_id)
            .header("Accept", "application/json")
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, LedgerApiError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(LedgerApiError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LedgerApiError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

#[async_trait]
impl LedgerApi for HttpLedgerClient {
    async fn refresh_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, LedgerApiError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&params)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to token endpoint: {:#?}", err);
            })?;

        let response = check(response).await?;
        response
            .json::<TokenGrant>()
            .await
            .inspect_err(|err| {
                tracing::error!(
                    "Error occurred while deserialising token response: {:#?}",
                    err
                );
            })
            .map_err(LedgerApiError::Transport)
    }

    async fn search_contacts(
        &self,
        auth: &LedgerAuth,
        name: &str,
    ) -> Result<Vec<Contact>, LedgerApiError> {
        let filter = format!("Name.Contains(\"{}\")", name.replace('"', "\\\""));

        let response = self
            .authed(self.http.get(format!("{}/contacts", self.api_base)), auth)
            .query(&[("where", filter.as_str())])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to contacts API: {:#?}", err);
            })?;

        let response = check(response).await?;
        response
            .json::<ContactsPage>()
            .await
            .map(|page| page.contacts)
            .map_err(LedgerApiError::Transport)
    }

    async fn create_contact(
        &self,
        auth: &LedgerAuth,
        name: &str,
    ) -> Result<Contact, LedgerApiError> {
        tracing::info!("Creating supplier contact name={}", name);

        let envelope = ContactsEnvelope {
            contacts: vec![NewContact {
                name: name.to_string(),
                is_supplier: true,
                is_customer: false,
            }],
        };

        let response = self
            .authed(self.http.put(format!("{}/contacts", self.api_base)), auth)
            .json(&envelope)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to contacts API: {:#?}", err);
            })?;

        let response = check(response).await?;
        let page = response
            .json::<ContactsPage>()
            .await
            .map_err(LedgerApiError::Transport)?;
        page.contacts
            .into_iter()
            .next()
            .ok_or_else(|| LedgerApiError::Unexpected(String::from("empty contacts payload")))
    }

    async fn create_invoice(
        &self,
        auth: &LedgerAuth,
        bill: &DraftBill,
    ) -> Result<String, LedgerApiError> {
        let envelope = InvoicesEnvelope {
            invoices: vec![InvoicePayload {
                invoice_type: "ACCPAY",
                contact: ContactRef {
                    contact_id: bill.contact_id.clone(),
                },
                date: bill.date.format("%Y-%m-%d").to_string(),
                due_date: bill.due_date.format("%Y-%m-%d").to_string(),
                line_amount_types: "Inclusive",
                line_items: bill.lines.clone(),
                status: "DRAFT",
                currency_code: bill.currency_code.clone(),
            }],
        };

        let response = self
            .authed(self.http.post(format!("{}/invoices", self.api_base)), auth)
            .json(&envelope)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to invoices API: {:#?}", err);
            })?;

        let response = check(response).await?;
        let page = response
            .json::<CreatedInvoicesPage>()
            .await
            .map_err(LedgerApiError::Transport)?;
        page.invoices
            .into_iter()
            .next()
            .map(|invoice| invoice.invoice_id)
            .ok_or_else(|| LedgerApiError::Unexpected(String::from("empty invoices payload")))
    }

    async fn list_awaiting_payment(
        &self,
        auth: &LedgerAuth,
    ) -> Result<Vec<AwaitingBill>, LedgerApiError> {
        let response = self
            .authed(self.http.get(format!("{}/invoices", self.api_base)), auth)
            .query(&[
                ("where", "Type==\"ACCPAY\" AND Status==\"AUTHORISED\""),
                ("order", "DueDate ASC"),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to invoices API: {:#?}", err);
            })?;

        let response = check(response).await?;
        response
            .json::<AwaitingBillsPage>()
            .await
            .map(|page| page.invoices)
            .map_err(LedgerApiError::Transport)
    }

    async fn create_payment(
        &self,
        auth: &LedgerAuth,
        payment: &PaymentRequest,
    ) -> Result<(), LedgerApiError> {
        let envelope = PaymentsEnvelope {
            payments: vec![PaymentPayload {
                invoice: InvoiceRef {
                    invoice_id: payment.invoice_id.clone(),
                },
                account: AccountRef {
                    account_id: payment.account_id.clone(),
                },
                date: payment.date.format("%Y-%m-%d").to_string(),
                amount: payment.amount,
            }],
        };

        let response = self
            .authed(self.http.put(format!("{}/payments", self.api_base)), auth)
            .json(&envelope)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to payments API: {:#?}", err);
            })?;

        check(response).await?;
        Ok(())
    }
}

/// Due dates arrive either ISO (`2024-05-01...`) or in the legacy
/// `/Date(1700000000000)/` millisecond encoding.
pub fn parse_due_date(raw: &str, fallback: NaiveDate) -> NaiveDate {
    if let Some(millis) = raw
        .strip_prefix("/Date(")
        .and_then(|rest| rest.split(&['+', '-', ')'][..]).next())
        .and_then(|digits| digits.parse::<i64>().ok())
    {
        return DateTime::from_timestamp_millis(millis)
            .map(|at| at.date_naive())
            .unwrap_or(fallback);
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .unwrap_or(fallback)
}
