//! HTTP sink - POST completed series summaries to a storage service
//!
//! Request: `POST {url}` with `Content-Type: application/json` and the
//! summary as body. Any 2xx status is an acknowledgement. When the service
//! answers with a JSON body carrying `"Status Code"` or `"status"`, that value
//! is kept in the `Ack`.

use super::sink::{SeriesSink, SinkError};
use super::types::{Ack, SeriesSummary};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::time::Duration;

pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    /// Create a sink posting to `url`, each request bounded by `timeout`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SeriesSink for HttpSink {
    async fn submit(&self, summary: &SeriesSummary) -> Result<Ack, SinkError> {
        let body = serde_json::to_vec(summary)?;
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        log::debug!("📨 Sink response ({}): {}", status, body);

        Ok(Ack {
            status: ack_status(&body).or_else(|| Some(status.as_u16().to_string())),
        })
    }

    fn sink_type(&self) -> &'static str {
        "http"
    }
}

fn ack_status(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let status = value.get("Status Code").or_else(|| value.get("status"))?;
    match status {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
