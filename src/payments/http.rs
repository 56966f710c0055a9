use crate::config::GatewayConfig;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::StatusResult;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Thin JSON client over reqwest. Performs a single attempt per call;
/// retry policy belongs to the caller.
#[derive(Clone)]
pub struct GatewayHttpClient {
    client: Client,
    timeout: Duration,
}

impl GatewayHttpClient {
    pub fn new(timeout: Duration) -> GatewayResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| GatewayError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self { client, timeout })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> GatewayResult<T> {
        let mut request = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header("Accept", "application/json");
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }
            } else {
                GatewayError::NetworkError {
                    message: format!("status request failed: {}", e),
                }
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| GatewayError::NetworkError {
            message: format!("failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(GatewayError::HttpError {
                status: status.as_u16(),
                message: truncate(&text, 256),
            });
        }

        serde_json::from_str::<T>(&text).map_err(|e| GatewayError::MalformedResponse {
            message: format!("invalid JSON response: {}", e),
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// The backend answers either with the bare status object or wrapped in
/// its standard `{ success, data }` envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusBody {
    Envelope {
        success: bool,
        data: Option<StatusResult>,
        #[serde(default)]
        message: Option<String>,
    },
    Bare(StatusResult),
}

impl StatusBody {
    fn into_result(self) -> GatewayResult<StatusResult> {
        match self {
            StatusBody::Bare(result) => Ok(result),
            StatusBody::Envelope {
                success: true,
                data: Some(result),
                ..
            } => Ok(result),
            StatusBody::Envelope { message, .. } => Err(GatewayError::MalformedResponse {
                message: message.unwrap_or_else(|| "envelope without status data".to_string()),
            }),
        }
    }
}

/// [`PaymentGateway`] backed by the rental backend's REST API.
pub struct HttpPaymentGateway {
    config: GatewayConfig,
    http: GatewayHttpClient,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let http = GatewayHttpClient::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }

    /// Appends `segments` to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> GatewayResult<Url> {
        let invalid = |message: String| GatewayError::ValidationError {
            message,
            field: Some("base_url".to_string()),
        };
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| invalid(format!("invalid base URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| invalid("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch(&self, url: Url) -> GatewayResult<StatusResult> {
        debug!(url = %url, "requesting PIX charge status");
        let body: StatusBody = self
            .http
            .get_json(url.as_str(), self.config.api_token.as_deref())
            .await?;
        body.into_result()
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn check_status_by_internal_id(&self, id: &str) -> GatewayResult<StatusResult> {
        self.fetch(self.endpoint(&["payments", id, "pix", "status"])?)
            .await
    }

    async fn check_status_by_external_id(&self, id: &str) -> GatewayResult<StatusResult> {
        self.fetch(self.endpoint(&["payments", "pix", "external", id, "status"])?)
            .await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
