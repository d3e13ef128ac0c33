//! Change-notification transports.
//!
//! A transport hands out raw notification envelopes one at a time and
//! blocks until the next one arrives. Decoding happens in the ingestor.

use crate::client::ClientError;
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client, StatusCode,
};
use std::time::Duration;
use tokio::sync::mpsc;

#[async_trait]
pub trait NotificationSource: Send {
    /// Next raw message. `Ok(None)` means the transport has closed for good.
    async fn next_message(&mut self) -> Result<Option<String>, ClientError>;
}

/// In-process transport fed through an mpsc channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<String>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// New source together with the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<String>, ClientError> {
        Ok(self.rx.recv().await)
    }
}

/// Polls an HTTP queue endpoint: `200` carries one message, `204` means the
/// queue is empty for now.
pub struct HttpPollSource {
    client: Client,
    url: String,
    poll_interval: Duration,
}

impl HttpPollSource {
    pub fn new(
        url: impl Into<String>,
        token: Option<&str>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(token)
                .map_err(|_| ClientError::InvalidConfig("token is not a valid header value".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            poll_interval,
        })
    }
}

#[async_trait]
impl NotificationSource for HttpPollSource {
    async fn next_message(&mut self) -> Result<Option<String>, ClientError> {
        loop {
            let response = self.client.get(&self.url).send().await?;
            match response.status() {
                StatusCode::OK => return Ok(Some(response.text().await?)),
                StatusCode::NO_CONTENT => {
                    tracing::trace!(url = %self.url, "Queue empty");
                    tokio::time::sleep(self.poll_interval).await;
                }
                StatusCode::GONE => return Ok(None),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(ClientError::AuthError)
                }
                status => return Err(ClientError::ServerError { status }),
            }
        }
    }
}

#[async_trait]
impl<T: NotificationSource + ?Sized> NotificationSource for Box<T> {
    async fn next_message(&mut self) -> Result<Option<String>, ClientError> {
        (**self).next_message().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_channel_source() {
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send("<a/>".to_string()).await.unwrap();
        drop(tx);
        assert_eq!(source.next_message().await.unwrap().as_deref(), Some("<a/>"));
        assert_eq!(source.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_http_poll_skips_empty_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .and(header("authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(204))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<msg/>"))
            .mount(&server)
            .await;

        let mut source = HttpPollSource::new(
            format!("{}/queue", server.uri()),
            Some("Bearer abc"),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(source.next_message().await.unwrap().as_deref(), Some("<msg/>"));
    }

    #[tokio::test]
    async fn test_http_poll_gone_closes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        let mut source =
            HttpPollSource::new(server.uri(), None, Duration::from_millis(5), Duration::from_secs(5)).unwrap();
        assert_eq!(source.next_message().await.unwrap(), None);
    }
}
