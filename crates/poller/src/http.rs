use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use uuid::Uuid;

use crate::{PollError, StatusReport, StatusSource};

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<StatusReport>,
    #[serde(default)]
    message: Option<String>,
}

/// Reads `GET {base}/api/payment/status/{order_id}` with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpStatusSource {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self, PollError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, order_id: Uuid) -> Result<StatusReport, PollError> {
        let url = format!("{}/api/payment/status/{}", self.base_url, order_id);
        let response = self.client.get(url).bearer_auth(&self.token).send().await?;
        let status = response.status();
        let body: Envelope = response
            .json()
            .await
            .map_err(|e| PollError::Malformed(e.to_string()))?;

        match body {
            Envelope {
                success: true,
                data: Some(report),
                ..
            } if status.is_success() => Ok(report),
            Envelope { message, .. } => Err(PollError::Rejected {
                status: status.as_u16(),
                message: message.unwrap_or_else(|| "no status in response".into()),
            }),
        }
    }
}
