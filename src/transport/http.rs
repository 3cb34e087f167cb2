use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::trait_def::{Headers, Transport, TransportError, TransportResult};
use crate::config::HttpConfig;

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn from_config(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .build()
            .context("failed to build HTTP client for tracking")?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn apply_headers(
        mut request: reqwest::RequestBuilder,
        headers: Headers,
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            request = request.header(name, value);
        }
        request
    }
}

fn network_error(err: reqwest::Error) -> TransportError {
    match err.status() {
        Some(status) => TransportError::Status(status.as_u16()),
        None => TransportError::Network(err.to_string()),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, url: &str, headers: Headers) -> TransportResult<Value> {
        debug!(%url, "GET");
        let request = Self::apply_headers(self.client.get(url), headers);
        let response = request
            .send()
            .await
            .map_err(network_error)?
            .error_for_status()
            .map_err(network_error)?;

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn post_json(&self, url: &str, headers: Headers, body: &Value) -> TransportResult<()> {
        debug!(%url, "POST");
        let request = Self::apply_headers(self.client.post(url), headers);
        request
            .json(body)
            .send()
            .await
            .map_err(network_error)?
            .error_for_status()
            .map_err(network_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        assert!(HttpTransport::from_config(&HttpConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let transport = HttpTransport::from_config(&HttpConfig {
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();

        let err = transport
            .get_json("http://127.0.0.1:1/customize.json", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}
