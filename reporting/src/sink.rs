use crate::protocol::ReportPayload;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

pub const API_KEY_HEADER: &str = "x-tggl-api-key";

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("report endpoint responded with status {0}")]
    Status(StatusCode),
}

/// Where flushed reports go. Only success or failure of a send is consumed.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, payload: &ReportPayload) -> Result<(), ReportError>;
}

/// Posts reports as JSON to the upstream report endpoint.
pub struct HttpReportSink {
    client: reqwest::Client,
    url: Url,
    api_key: String,
}

impl HttpReportSink {
    pub fn new(url: Url, api_key: String) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(HttpReportSink {
            client,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn send(&self, payload: &ReportPayload) -> Result<(), ReportError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ReportError::Status(response.status()));
        }
        Ok(())
    }
}
