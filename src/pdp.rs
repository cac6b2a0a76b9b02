//! Decision service (PDP) client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attr::AttributeAssignment;
use crate::error::PepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Permit,
    Deny,
    #[serde(other)]
    Indeterminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdpResponse {
    pub effect: Effect,
    #[serde(default)]
    pub obligations: Vec<AttributeAssignment>,
    /// Evaluation status reported by the service, usually set with `Indeterminate`.
    #[serde(default)]
    pub status: Option<String>,
}

impl PdpResponse {
    pub fn new(effect: Effect, obligations: Vec<AttributeAssignment>) -> Self {
        Self {
            effect,
            obligations,
            status: None,
        }
    }
}

#[async_trait]
pub trait PolicyClient: Send + Sync {
    async fn validate(&self, attrs: &[AttributeAssignment]) -> Result<PdpResponse, PepError>;
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    attributes: &'a [AttributeAssignment],
}

/// JSON over HTTP client. Endpoints are used round-robin; a transport error
/// moves on to the next endpoint until each was tried once.
pub struct HttpPolicyClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    next: AtomicUsize,
}

impl HttpPolicyClient {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        if endpoints.is_empty() {
            anyhow::bail!("no pdp endpoints configured");
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoints,
            next: AtomicUsize::new(0),
        })
    }

    async fn post(&self, endpoint: &str, attrs: &[AttributeAssignment]) -> Result<PdpResponse, reqwest::Error> {
        self.http
            .post(endpoint)
            .json(&ValidateRequest { attributes: attrs })
            .send()
            .await?
            .error_for_status()?
            .json::<PdpResponse>()
            .await
    }
}

#[async_trait]
impl PolicyClient for HttpPolicyClient {
    async fn validate(&self, attrs: &[AttributeAssignment]) -> Result<PdpResponse, PepError> {
        let first = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for i in 0..self.endpoints.len() {
            let endpoint = &self.endpoints[(first + i) % self.endpoints.len()];
            match self.post(endpoint, attrs).await {
                Ok(resp) => {
                    debug!(endpoint = %endpoint, effect = ?resp.effect, "pdp response");
                    return Ok(resp);
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    warn!(endpoint = %endpoint, error = %err, "pdp endpoint unavailable");
                    last_err = Some(err);
                }
                Err(err) => return Err(PepError::pdp("transport", err)),
            }
        }
        Err(PepError::pdp(
            "transport",
            last_err.map_or_else(|| "no endpoint answered".to_string(), |e| e.to_string()),
        ))
    }
}
