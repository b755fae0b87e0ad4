//! HTTP client for the scheduler command API.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CliError;

/// Client for one scheduler.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        decode(self.client.get(self.url(path)).send().await?).await
    }

    /// POST with the arguments in the query string, the form `/deploy`
    /// and `/remove` expect.
    pub async fn post_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T, CliError> {
        let request = self.client.post(self.url(path)).query(query);
        decode(request.send().await?).await
    }
}

/// Problem document the scheduler returns on errors.
#[derive(Debug, Deserialize)]
struct Problem {
    code: String,
    detail: String,
    #[serde(default)]
    retryable: bool,
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CliError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| CliError::Other(anyhow::anyhow!("Unexpected response body: {e}")));
    }
    Err(problem(status, &body))
}

/// Anything that is not a problem document (a proxy page, an empty 502)
/// is reported with its raw body.
fn problem(status: StatusCode, body: &str) -> CliError {
    match serde_json::from_str::<Problem>(body) {
        Ok(p) => CliError::api(status.as_u16(), p.code, p.detail, p.retryable),
        Err(_) => {
            let detail = match body.trim() {
                "" => status.canonical_reason().unwrap_or("no response body"),
                text => text,
            };
            CliError::api(status.as_u16(), "unknown", detail, false)
        }
    }
}
