//! Outbound JSON pushes to subscriber endpoints.
//!
//! Deliveries are fire-and-forget: failures are logged with the destination
//! and status and never retried.

use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Destination {url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error("Failed to encode body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where a push goes, with the subscriber's extra headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl PushTarget {
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            headers,
        }
    }
}

/// Shared HTTP client for every outbound push.
#[derive(Debug, Clone)]
pub struct PushClient {
    client: Client,
}

impl PushClient {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// POST `body` as JSON and wait for the answer.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        target: &PushTarget,
        body: &T,
    ) -> Result<(), DeliveryError> {
        let payload = serde_json::to_vec(body)?;
        self.post_bytes(target, payload).await
    }

    async fn post_bytes(&self, target: &PushTarget, payload: Vec<u8>) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(&target.url)
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(payload).send().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(DeliveryError::Status {
                url: target.url.clone(),
                status,
            }),
        }
    }

    /// Encode `body` now and deliver it on a background task. Callers are
    /// not expected to await the handle.
    pub fn spawn_post<T: Serialize + ?Sized>(
        &self,
        target: PushTarget,
        body: &T,
    ) -> Result<JoinHandle<()>, DeliveryError> {
        let payload = serde_json::to_vec(body)?;
        let client = self.clone();

        Ok(tokio::spawn(async move {
            match client.post_bytes(&target, payload).await {
                Ok(()) => tracing::debug!(url = %target.url, "Push delivered"),
                Err(DeliveryError::Status { url, status }) => {
                    tracing::warn!(url = %url, status = %status, "Push rejected")
                }
                Err(e) => tracing::warn!(url = %target.url, "Push failed: {}", e),
            }
        }))
    }
}
