//! Invoice gateway client.

use std::time::Duration;

use app_config::AppConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Gateway rejected the invoice ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Gateway response has no invoice id")]
    MissingInvoiceId,
}

/// What we ask the gateway to bill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceOrder {
    /// Our order id; the gateway echoes it back as `external_id` in callbacks.
    pub external_id: String,
    pub amount: i64,
    pub payer_email: String,
    pub description: String,
}

/// Invoice as issued by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayInvoice {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub invoice_url: Option<String>,
    #[serde(default)]
    pub expiry_date: Option<String>,
}

/// External invoice creation capability.
#[async_trait]
pub trait InvoiceGateway: Send + Sync {
    async fn create_invoice(&self, order: &InvoiceOrder) -> Result<GatewayInvoice, GatewayError>;
}

#[derive(Serialize)]
struct CreateInvoiceBody<'a> {
    external_id: &'a str,
    amount: i64,
    payer_email: &'a str,
    description: &'a str,
    success_redirect_url: &'a str,
    failure_redirect_url: &'a str,
}

/// HTTP client of the invoice API (`POST {base}/v2/invoices`, basic auth with the
/// secret key as user name).
#[derive(Clone)]
pub struct HttpInvoiceGateway {
    client: Client,
    base_url: String,
    api_key: String,
    success_url: String,
    failure_url: String,
}

impl HttpInvoiceGateway {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(cfg: &AppConfig) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: cfg.payment_api_url.trim_end_matches('/').to_string(),
            api_key: cfg.payment_api_key.clone(),
            success_url: cfg.payment_success_url.clone(),
            failure_url: cfg.payment_failure_url.clone(),
        })
    }
}

#[async_trait]
impl InvoiceGateway for HttpInvoiceGateway {
    #[instrument(skip(self, order), fields(external_id = %order.external_id))]
    async fn create_invoice(&self, order: &InvoiceOrder) -> Result<GatewayInvoice, GatewayError> {
        let body = CreateInvoiceBody {
            external_id: &order.external_id,
            amount: order.amount,
            payer_email: &order.payer_email,
            description: &order.description,
            success_redirect_url: &self.success_url,
            failure_redirect_url: &self.failure_url,
        };

        let response = self
            .client
            .post(format!("{}/v2/invoices", self.base_url))
            .basic_auth(&self.api_key, Some(""))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let invoice: GatewayInvoice = response.json().await?;
        if invoice.id.is_empty() {
            return Err(GatewayError::MissingInvoiceId);
        }
        debug!(invoice_id = %invoice.id, status = %invoice.status, "Invoice created");
        Ok(invoice)
    }
}
