//! HTTP ledger client.
//!
//! - `POST {rpc}/accounts` once at start-up (`409 Conflict` means the account
//!   already exists)
//! - `POST {rpc}/inscriptions` per record, answered with
//!   `{"transactionId": "...", "hash": "..."}`
//!
//! Requests carry the signing key as a bearer token and are bounded by the
//! client-wide timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{AccountSetup, InscriptionPayload, LedgerClient, LedgerError, LedgerReceipt};

/// Longest response body kept in a [`LedgerError::Rejected`].
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpLedgerConfig {
    pub rpc_url: String,
    pub signing_key: SecretString,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    rpc_url: String,
    signing_key: SecretString,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    transaction_id: String,
    #[serde(default)]
    hash: Option<String>,
}

impl HttpLedgerClient {
    pub fn new(config: HttpLedgerConfig) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            rpc_url: config.rpc_url.trim_end_matches('/').to_string(),
            signing_key: config.signing_key,
            timeout: config.timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.rpc_url, path)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout(self.timeout)
        } else {
            LedgerError::Transport(err.to_string())
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, LedgerError> {
        self.client
            .post(self.endpoint(path))
            .bearer_auth(self.signing_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))
    }
}

async fn rejected(response: reqwest::Response) -> LedgerError {
    let status = response.status().as_u16();
    let body = response.text().await;
    rejection(status, body.map_err(|e| e.to_string()))
}

fn rejection(status: u16, body: Result<String, String>) -> LedgerError {
    let body = body.unwrap_or_else(|e| format!("<unreadable body: {e}>"));
    LedgerError::Rejected {
        status,
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    }
}

fn parse_submit_response(body: &[u8]) -> Result<LedgerReceipt, LedgerError> {
    let parsed: SubmitResponse =
        serde_json::from_slice(body).map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

    if parsed.transaction_id.trim().is_empty() {
        return Err(LedgerError::InvalidResponse(
            "empty transactionId".to_string(),
        ));
    }

    Ok(LedgerReceipt {
        transaction_id: parsed.transaction_id,
        hash: parsed.hash.filter(|h| !h.is_empty()),
    })
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    #[instrument(skip(self), err)]
    async fn initialize(&self) -> Result<AccountSetup, LedgerError> {
        let response = self.post("accounts", &serde_json::json!({})).await?;

        match response.status() {
            StatusCode::CONFLICT => Ok(AccountSetup::AlreadyInitialized),
            status if status.is_success() => Ok(AccountSetup::Created),
            _ => Err(rejected(response).await),
        }
    }

    #[instrument(skip(self, payload), fields(record_id = %payload.record_id), err)]
    async fn submit(&self, payload: &InscriptionPayload) -> Result<LedgerReceipt, LedgerError> {
        let body = serde_json::json!({
            "datatype": payload.tag.datatype,
            "handle": payload.tag.handle,
            "payload": payload,
        });

        let response = self.post("inscriptions", &body).await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let receipt = parse_submit_response(&bytes)?;

        debug!(tx_id = %receipt.transaction_id, "ledger accepted inscription");
        Ok(receipt)
    }
}
