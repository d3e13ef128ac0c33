//! HTTP client for the upstream airport-management service.

use crate::protocol::{self, ParseError};
use crate::types::{FixedResource, Flight, ResourceType};
use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::escape::escape;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE},
    Client, StatusCode,
};
use std::time::Duration;
use thiserror::Error;

const SOAP_ENV: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SERVICE_NS: &str = "http://www.sita.aero/ams6-xml-api-webservice";
const SOAP_ACTION_BASE: &str =
    "http://www.sita.aero/ams6-xml-api-webservice/IAMSIntegrationService";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Server returned error status: {status}")]
    ServerError { status: StatusCode },
    #[error("Authentication failed")]
    AuthError,
    #[error("Invalid response: {0}")]
    InvalidResponse(#[from] ParseError),
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

/// Read side of the upstream service: connectivity probe, bulk flight
/// window and resource listings.
#[async_trait]
pub trait FlightSource: Send + Sync {
    async fn probe(&self) -> Result<(), ClientError>;

    /// Flights scheduled between `from` and `to` (inclusive dates).
    async fn fetch_flights(
        &self,
        airport: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Flight>, ClientError>;

    async fn fetch_resources(
        &self,
        airport: &str,
        resource_type: ResourceType,
    ) -> Result<Vec<FixedResource>, ClientError>;
}

/// Configuration for the upstream client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service endpoint the request envelopes are POSTed to
    pub base_url: String,
    /// Session token sent inside every request envelope
    pub token: Option<String>,
    /// Request timeout
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// SOAP request body for `operation` with simple text parameters.
fn envelope(operation: &str, params: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in params {
        body.push_str(&format!("<{name}>{}</{name}>", escape(*value)));
    }
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="{SOAP_ENV}"><s:Body><{operation} xmlns="{SERVICE_NS}">{body}</{operation}></s:Body></s:Envelope>"#
    )
}

/// Client for the upstream service.
pub struct AmsClient {
    client: Client,
    config: ClientConfig,
}

impl AmsClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/xml"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/xml; charset=utf-8"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .gzip(true)
            .build()?;

        if config.base_url.trim().is_empty() {
            return Err(ClientError::InvalidConfig("empty base URL".into()));
        }

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POST one operation envelope and return the raw response body.
    async fn call(&self, operation: &str, params: &[(&str, &str)]) -> Result<String, ClientError> {
        let token = self.config.token.as_deref().unwrap_or_default();
        let mut all = vec![("sessionToken", token)];
        all.extend_from_slice(params);

        tracing::debug!(operation, url = %self.config.base_url, "Calling upstream");

        let response = self
            .client
            .post(&self.config.base_url)
            .header("SOAPAction", format!("{SOAP_ACTION_BASE}/{operation}"))
            .body(envelope(operation, &all))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.text().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ClientError::AuthError),
            status => Err(ClientError::ServerError { status }),
        }
    }
}

#[async_trait]
impl FlightSource for AmsClient {
    async fn probe(&self) -> Result<(), ClientError> {
        let body = self.call("GetAirports", &[]).await?;
        protocol::check_response(&body)?;
        Ok(())
    }

    async fn fetch_flights(
        &self,
        airport: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Flight>, ClientError> {
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();
        let body = self
            .call(
                "GetFlights",
                &[
                    ("from", &from),
                    ("to", &to),
                    ("airport", airport),
                    ("airportIdentifierType", "IATACode"),
                ],
            )
            .await?;
        Ok(protocol::parse_flights(&body)?)
    }

    async fn fetch_resources(
        &self,
        airport: &str,
        resource_type: ResourceType,
    ) -> Result<Vec<FixedResource>, ClientError> {
        let body = self
            .call(
                resource_type.listing_operation(),
                &[("airport", airport), ("airportIdentifierType", "IATACode")],
            )
            .await?;
        Ok(protocol::parse_resources(&body, resource_type)?)
    }
}
