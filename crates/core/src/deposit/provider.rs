//! Payment provider client: turns a deposit intent into transfer instructions.
//!
//! The provider is only ever called before a unit of work starts, so a slow
//! or failing provider never holds the store lock.

use std::future::Future;
use std::pin::Pin;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;

/// Body of `POST {base_url}/deposits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub account_number: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Idempotency key the payer must put in the transfer memo.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositInstructions {
    pub qr_code: String,
    pub account_number: String,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse provider response: {0}")]
    Parse(String),
    #[error("payment provider not configured")]
    NotConfigured,
    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Trait: PaymentProvider
// =============================================================================

/// Abstraction over the payment provider API for testability.
pub trait PaymentProvider: Send + Sync + 'static {
    fn create_deposit_request(
        &self,
        request: DepositRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DepositInstructions, ProviderError>> + Send + '_>>;
}

// =============================================================================
// HttpPaymentProvider
// =============================================================================

pub struct HttpPaymentProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpPaymentProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(ProviderError::Http)?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn deposits_url(&self) -> String {
        format!("{}/deposits", self.config.base_url.trim_end_matches('/'))
    }
}

impl PaymentProvider for HttpPaymentProvider {
    fn create_deposit_request(
        &self,
        request: DepositRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DepositInstructions, ProviderError>> + Send + '_>> {
        Box::pin(async move {
            if !self.config.is_configured() {
                return Err(ProviderError::NotConfigured);
            }
            let mut builder = self.client.post(self.deposits_url()).json(&request);
            if let Some(key) = &self.config.api_key {
                builder = builder.bearer_auth(key);
            }

            let response = builder.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = response.bytes().await?;
            serde_json::from_slice(&bytes).map_err(|e| ProviderError::Parse(e.to_string()))
        })
    }
}

// =============================================================================
// Mock: MockPaymentProvider (test / testing feature)
// =============================================================================

#[cfg(any(test, feature = "testing"))]
pub struct MockPaymentProvider {
    requests: parking_lot::Mutex<Vec<DepositRequest>>,
    /// Whether requests should fail.
    pub should_fail: bool,
}

#[cfg(any(test, feature = "testing"))]
impl MockPaymentProvider {
    pub fn new() -> Self {
        Self {
            requests: parking_lot::Mutex::new(Vec::new()),
            should_fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            requests: parking_lot::Mutex::new(Vec::new()),
            should_fail: true,
        }
    }

    /// Requests received so far, including failed ones.
    pub fn requests(&self) -> Vec<DepositRequest> {
        self.requests.lock().clone()
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for MockPaymentProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
impl PaymentProvider for MockPaymentProvider {
    fn create_deposit_request(
        &self,
        request: DepositRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DepositInstructions, ProviderError>> + Send + '_>> {
        self.requests.lock().push(request.clone());
        if self.should_fail {
            return Box::pin(async { Err(ProviderError::Other("mock failure".to_string())) });
        }
        let instructions = DepositInstructions {
            qr_code: format!("qr://{}/{}/{}", request.account_number, request.amount, request.content),
            account_number: request.account_number,
        };
        Box::pin(async move { Ok(instructions) })
    }
}

// =============================================================================
// Tests
// =============================================================================
