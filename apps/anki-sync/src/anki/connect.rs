//! HTTP transport for a running AnkiConnect instance.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{AnkiApi, RemoteError, API_VERSION};

#[derive(Debug, Serialize)]
struct Request<'a> {
    action: &'a str,
    version: u32,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// AnkiConnect client over HTTP POST.
#[derive(Debug, Clone)]
pub struct AnkiConnect {
    client: Client,
    url: String,
}

impl AnkiConnect {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AnkiApi for AnkiConnect {
    async fn invoke(&self, action: &str, params: Value) -> Result<Value, RemoteError> {
        let request = Request {
            action,
            version: API_VERSION,
            params,
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Http { status, message });
        }

        let response: Response = resp.json().await.map_err(|e| RemoteError::Unexpected {
            action: action.to_string(),
            message: e.to_string(),
        })?;

        match response.error {
            Some(message) => Err(RemoteError::Action {
                action: action.to_string(),
                message,
            }),
            None => Ok(response.result),
        }
    }
}
