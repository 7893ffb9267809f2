//! Client for the call-origination service.
//!
//! The service places the outbound call and answers with the websocket URL
//! the call audio can be listened on.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct CallRequest<'a> {
    number: &'a str,
}

/// Successful origination response. Either field may be missing; the session
/// decides what is acceptable.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub listen_url: Option<String>,
    pub call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    details: Option<String>,
}

#[async_trait]
pub trait CallOriginator: Send + Sync {
    /// Places a call to `number`. The error's message is shown to the user.
    async fn originate(&self, number: &str) -> Result<CallResponse>;
}

pub struct HttpOriginator {
    client: reqwest::Client,
    url: String,
}

impl HttpOriginator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CallOriginator for HttpOriginator {
    async fn originate(&self, number: &str) -> Result<CallResponse> {
        debug!("Requesting outbound call via {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&CallRequest { number })
            .send()
            .await
            .map_err(|e| anyhow!("Call origination request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(ErrorBody {
                    error,
                    details: Some(details),
                }) => format!("{error}: {details}"),
                Ok(ErrorBody { error, .. }) => error,
                Err(_) => format!("HTTP {status}"),
            };
            return Err(anyhow!(reason));
        }

        response
            .json::<CallResponse>()
            .await
            .context("Invalid call origination response")
    }
}
