use crate::types::{ConfigParseError, FlagConfig};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

pub const API_KEY_HEADER: &str = "x-tggl-api-key";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum AuthorityError {
    #[error("request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("authority responded with status {0}")]
    Status(StatusCode),
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigParseError),
}

/// The remote source of truth for flag configuration.
#[async_trait]
pub trait Authority: Send + Sync {
    async fn fetch_config(&self) -> Result<FlagConfig, AuthorityError>;
}

pub struct HttpAuthority {
    client: reqwest::Client,
    config_url: Url,
    api_key: String,
}

impl HttpAuthority {
    pub fn new(base_url: &Url, api_key: String) -> Result<Self, AuthorityError> {
        let config_url = Url::parse(&format!(
            "{}/config",
            base_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| AuthorityError::InvalidUrl(e.to_string()))?;

        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(HttpAuthority {
            client,
            config_url,
            api_key,
        })
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn fetch_config(&self) -> Result<FlagConfig, AuthorityError> {
        let response = self
            .client
            .get(self.config_url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthorityError::Status(response.status()));
        }

        let flags = response.json::<Vec<Value>>().await?;
        Ok(FlagConfig::from_flags(flags)?)
    }
}
