//! Mobile-money gateway client: initiates payments and queries their status.
//!
//! The gateway is an opaque external service with two operations. Nothing in
//! this module retries: the issuer surfaces failures to the caller verbatim
//! and the reconciler owns the retry budget for status queries.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, TaskPayError};
use crate::models::{Amount, TransactionStatus};
use crate::phone::CanonicalPhone;

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub phone_number: String,
    pub amount: i64,
    /// Client-side idempotency key.
    pub reference: String,
}

impl PaymentRequest {
    pub fn new(phone: &CanonicalPhone, amount: Amount, reference: &str) -> Self {
        PaymentRequest {
            phone_number: phone.as_str().to_string(),
            amount: amount.as_kes(),
            reference: reference.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub success: bool,
    pub gateway_reference: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct StatusRequest<'a> {
    reference: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub status: Option<String>,
    pub error: Option<String>,
}

impl InitiateResponse {
    /// The gateway's reference, or `GatewayRejected` for a failure payload.
    pub fn into_reference(self) -> Result<String> {
        match (self.success, self.gateway_reference) {
            (true, Some(reference)) if !reference.is_empty() => Ok(reference),
            (true, _) => Err(TaskPayError::GatewayRejected(
                "gateway accepted the request without a reference".to_string(),
            )),
            (false, _) => Err(TaskPayError::GatewayRejected(
                self.error
                    .unwrap_or_else(|| "payment request declined".to_string()),
            )),
        }
    }
}

impl StatusResponse {
    pub fn into_status(self) -> Result<TransactionStatus> {
        if !self.success {
            return Err(TaskPayError::GatewayRejected(
                self.error
                    .unwrap_or_else(|| "status query declined".to_string()),
            ));
        }
        let word = self.status.unwrap_or_default();
        TransactionStatus::from_gateway(&word).ok_or_else(|| {
            TaskPayError::GatewayRejected(format!("unrecognised transaction status {word:?}"))
        })
    }
}

// ─────────────────────────────────────────────────────────
// Gateway seam
// ─────────────────────────────────────────────────────────

/// The two operations the core needs from a payment provider.
pub trait PaymentGateway: Send + Sync {
    /// Ask the gateway to start a payment. Returns the gateway's own reference.
    fn initiate(&self, request: &PaymentRequest) -> impl Future<Output = Result<String>> + Send;

    /// Look up a payment by the reference returned from [`initiate`](Self::initiate).
    fn query_status(
        &self,
        gateway_reference: &str,
    ) -> impl Future<Output = Result<TransactionStatus>> + Send;
}

/// HTTP/JSON gateway client.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaskPayError::Config(format!("HTTP client: {e}")))?;
        Ok(HttpGateway {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .post(path)
            .json(body)
            .send()
            .await
            .map_err(|e| TaskPayError::GatewayUnreachable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(TaskPayError::GatewayUnreachable(format!(
                "gateway responded {status}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| TaskPayError::GatewayUnreachable(e.to_string()))?;

        // Client errors usually still carry the `{success:false,error}` payload.
        serde_json::from_str(&text).map_err(|_| {
            TaskPayError::GatewayRejected(format!("gateway responded {status}: {text}"))
        })
    }
}

impl PaymentGateway for HttpGateway {
    async fn initiate(&self, request: &PaymentRequest) -> Result<String> {
        let response: InitiateResponse = self.send("/payments", request).await?;
        debug!(
            "Initiate {} -> success={} ref={:?}",
            request.reference, response.success, response.gateway_reference
        );
        response.into_reference()
    }

    async fn query_status(&self, gateway_reference: &str) -> Result<TransactionStatus> {
        let response: StatusResponse = self
            .send(
                "/payments/status",
                &StatusRequest {
                    reference: gateway_reference,
                },
            )
            .await?;
        debug!(
            "Status {gateway_reference} -> success={} status={:?}",
            response.success, response.status
        );
        response.into_status()
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::to_canonical;

    #[test]
    fn request_uses_gateway_field_names() {
        let phone = to_canonical("0712345678").unwrap();
        let request = PaymentRequest::new(&phone, Amount::kes(1800), "u1:1700000000000");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "phoneNumber": "254712345678",
                "amount": 1800,
                "reference": "u1:1700000000000",
            })
        );
    }

    #[test]
    fn initiate_success_yields_reference() {
        let body = r#"{"success":true,"gatewayReference":"GW-42"}"#;
        let response: InitiateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.into_reference().unwrap(), "GW-42");
    }

    #[test]
    fn initiate_failure_payload_is_rejection() {
        let body = r#"{"success":false,"error":"Invalid MSISDN"}"#;
        let response: InitiateResponse = serde_json::from_str(body).unwrap();
        match response.into_reference() {
            Err(TaskPayError::GatewayRejected(msg)) => assert_eq!(msg, "Invalid MSISDN"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn initiate_success_without_reference_is_rejection() {
        let body = r#"{"success":true}"#;
        let response: InitiateResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(
            response.into_reference(),
            Err(TaskPayError::GatewayRejected(_))
        ));
    }

    #[test]
    fn status_words_are_mapped() {
        let body = r#"{"success":true,"status":"COMPLETED"}"#;
        let response: StatusResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.into_status().unwrap(), TransactionStatus::Success);
    }

    #[test]
    fn unknown_status_word_is_an_error() {
        let body = r#"{"success":true,"status":"ON_HOLD"}"#;
        let response: StatusResponse = serde_json::from_str(body).unwrap();
        assert!(response.into_status().is_err());
    }

    #[test]
    fn failed_status_query_is_an_error() {
        let body = r#"{"success":false,"status":null,"error":"unknown reference"}"#;
        let response: StatusResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(
            response.into_status(),
            Err(TaskPayError::GatewayRejected(_))
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let gw = HttpGateway::new("https://pay.example/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(gw.base_url, "https://pay.example");
    }
}
