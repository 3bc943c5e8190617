use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::{Instrument, debug, info_span};

use crate::error::DeliveryError;

/// One signed POST to a tenant endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundWebhook {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
}

/// Any HTTP answer, successful or not. Transport-level failures are
/// [`DeliveryError`]s instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub body: String,
}

impl DeliveryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync + fmt::Debug {
    async fn post(
        &self,
        request: OutboundWebhook,
    ) -> Result<DeliveryResponse, DeliveryError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::Transport(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        request: OutboundWebhook,
    ) -> Result<DeliveryResponse, DeliveryError> {
        let OutboundWebhook {
            url,
            body,
            headers: extra,
        } = request;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &extra {
            let value = HeaderValue::from_str(value).map_err(|e| {
                DeliveryError::Transport(format!("invalid header {name}: {e}"))
            })?;
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                DeliveryError::Transport(format!("invalid header name {name}: {e}"))
            })?;
            headers.insert(name, value);
        }

        let span = info_span!("webhook_post", url = %url);
        async move {
            let response = self
                .client
                .post(&url)
                .headers(headers)
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        DeliveryError::Timeout(self.timeout.as_secs())
                    } else if e.is_connect() {
                        DeliveryError::Transport(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::Transport(e.to_string())
                    }
                })?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            debug!(status, "webhook endpoint responded");
            Ok(DeliveryResponse { status, body })
        }
        .instrument(span)
        .await
    }
}

