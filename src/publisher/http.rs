use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use tracing::{debug, info};

use crate::config::{ProductTarget, RestAuth, RestTarget};
use crate::error::PublishError;

/// Delivers one serialized batch to the collector.
#[async_trait]
pub trait PayloadSender: Send + Sync {
    async fn send(&self, payload: &[u8]) -> Result<(), PublishError>;
}

pub struct HttpCollector {
    http_client: HttpClient,
    url: String,
    headers: HeaderMap,
}

impl HttpCollector {
    pub fn new(target: &RestTarget) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(target.request_timeout)
            .danger_accept_invalid_certs(target.accept_invalid_certs)
            .build()?;

        let headers = collector_headers(target)?;
        info!(
            "HTTP collector initialized for {:?} at {}",
            target.product, target.url
        );

        Ok(Self {
            http_client,
            url: target.url.clone(),
            headers,
        })
    }
}

#[async_trait]
impl PayloadSender for HttpCollector {
    async fn send(&self, payload: &[u8]) -> Result<(), PublishError> {
        debug!("Posting {} bytes to {}", payload.len(), self.url);

        let response = self
            .http_client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PublishError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

/// Header set for the target product: tenant header always, plus basic auth
/// (pi, when enabled) or a ZenApiKey token (aiops).
pub fn collector_headers(target: &RestTarget) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("X-TenantID", HeaderValue::from_str(&target.tenant_id)?);

    let authorization = match (&target.product, &target.auth) {
        (_, RestAuth::None) => None,
        (ProductTarget::Pi, RestAuth::Basic { username, password }) => Some(format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", username, password))
        )),
        (ProductTarget::Aiops, RestAuth::ZenApiKey { user, api_key }) => Some(format!(
            "ZenApiKey {}",
            STANDARD.encode(format!("{}:{}", user, api_key))
        )),
        (product, auth) => {
            anyhow::bail!("authentication {:?} is not supported for product {:?}", auth, product)
        }
    };

    if let Some(value) = authorization {
        let mut value = HeaderValue::from_str(&value)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}
