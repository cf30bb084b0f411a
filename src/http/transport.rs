//! HTTP transport seam
//!
//! `HttpService` talks to the network only through [`HttpTransport`], so
//! tests and embedders can swap the reqwest client for their own.

use crate::error::{Result, TxLogError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Basic authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// A request ready to send: placeholders resolved, query still separate
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
    pub auth: Option<BasicAuth>,
}

/// Response as received from the transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    /// Header names are lower-case
    pub headers: BTreeMap<String, String>,
    /// JSON body, or the body text as a JSON string when it is not JSON
    pub body: Option<serde_json::Value>,
}

impl RawResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Executes prepared requests.
///
/// Failures must surface as [`TxLogError::ConnectionTimeout`] for timeouts
/// and [`TxLogError::Connection`] for anything else on the wire, so the
/// client can classify them.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &PreparedRequest) -> Result<RawResponse>;
}

/// Default transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TxLogError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &PreparedRequest) -> Result<RawResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| TxLogError::Config(format!("Invalid HTTP method '{}': {}", request.method, e)))?;
        let mut url = reqwest::Url::parse(&request.url)
            .map_err(|e| TxLogError::Connection(format!("invalid url '{}': {}", request.url, e)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }

        let mut builder = self.client.request(method, url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(auth) = &request.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let text = response.text().await.map_err(classify)?;
        let body = if text.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
        };

        Ok(RawResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TxLogError {
    if err.is_timeout() {
        TxLogError::ConnectionTimeout(err.to_string())
    } else {
        TxLogError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let resp = RawResponse::new(429).with_header("Retry-After", "2");
        assert_eq!(resp.header("retry-after"), Some("2"));
        assert_eq!(resp.header("RETRY-AFTER"), Some("2"));
        assert_eq!(resp.header("x-missing"), None);
    }

    #[tokio::test]
    async fn test_reqwest_rejects_invalid_url_as_connection_error() {
        let transport = ReqwestTransport::new().unwrap();
        let request = PreparedRequest {
            method: "GET".into(),
            url: "not a url".into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            auth: None,
        };
        let err = transport.execute(&request).await.unwrap_err();
        assert!(matches!(err, TxLogError::Connection(_)));
    }
}
