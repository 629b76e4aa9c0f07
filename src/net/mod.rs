//! Network boundary: requests, responses, and the transport that moves them.

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use url::Url;

pub use reqwest::Method;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Message shown when a page is requested with neither cache nor network.
pub const OFFLINE_MESSAGE: &str = "Application is not connected to the internet";

/// Body of the synthesized response for API reads with no data source.
pub const FETCH_ERROR_MESSAGE: &str = "Error fetching data";

/// An outbound request as seen by the interceptor and the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub body: Option<Value>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_json(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn is_read(&self) -> bool {
    self.method == Method::GET
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from the local store or asset cache
  Cache,
  /// Built locally because the network was unreachable and nothing was cached
  Offline,
  /// Built locally because an API read could not be answered
  Synthesized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  /// Final URL after redirects
  pub url: String,
  pub redirected: bool,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  /// JSON response with the given status.
  pub fn json<T: Serialize + ?Sized>(status: u16, value: &T, source: ResponseSource) -> Result<Self> {
    let body = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize body: {}", e))?;
    Ok(Self {
      status,
      status_text: reason(status).to_string(),
      url: String::new(),
      redirected: false,
      content_type: Some(JSON_CONTENT_TYPE.to_string()),
      body,
      source,
    })
  }

  /// Plain text response.
  pub fn text(status: u16, status_text: &str, body: &str, source: ResponseSource) -> Self {
    Self {
      status,
      status_text: status_text.to_string(),
      url: String::new(),
      redirected: false,
      content_type: Some("text/plain; charset=utf-8".to_string()),
      body: body.as_bytes().to_vec(),
      source,
    }
  }

  /// Stand-in for a page that could not be fetched or found in cache.
  pub fn offline() -> Self {
    Self::text(404, OFFLINE_MESSAGE, OFFLINE_MESSAGE, ResponseSource::Offline)
  }

  /// Stand-in for an API read that could not be answered.
  pub fn fetch_error() -> Self {
    Self::text(
      500,
      reason(500),
      FETCH_ERROR_MESSAGE,
      ResponseSource::Synthesized,
    )
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Success for replay purposes: 2xx, or anything the server redirected us through.
  pub fn is_ok_or_redirected(&self) -> bool {
    self.is_ok() || self.redirected
  }

  pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Invalid JSON from {}: {}", self.url, e))
  }

  pub fn text_body(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn reason(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}

/// Something that can deliver a request. `Err` means a network-level failure;
/// any HTTP status, including errors, comes back as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response>;
}

/// Transport over real HTTP.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("restocache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    if let Some(body) = &request.body {
      let bytes =
        serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
      builder = builder.header(CONTENT_TYPE, JSON_CONTENT_TYPE).body(bytes);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status();
    let final_url = response.url().clone();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      redirected: final_url != request.url,
      url: final_url.to_string(),
      content_type,
      body: body.to_vec(),
      source: ResponseSource::Network,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_offline_response_is_404_with_message() {
    let response = Response::offline();
    assert_eq!(response.status, 404);
    assert_eq!(response.status_text, OFFLINE_MESSAGE);
    assert_eq!(response.text_body(), OFFLINE_MESSAGE);
    assert_eq!(response.source, ResponseSource::Offline);
    assert!(!response.is_ok());
  }

  #[test]
  fn test_json_response_round_trips_body() {
    let response = Response::json(200, &json!([{"id": 1}]), ResponseSource::Cache).unwrap();
    assert!(response.is_ok());
    assert_eq!(response.status_text, "OK");
    let body: Value = response.json_body().unwrap();
    assert_eq!(body, json!([{"id": 1}]));
  }

  #[test]
  fn test_redirect_counts_as_success_for_replay() {
    let mut response = Response::text(404, "Not Found", "", ResponseSource::Network);
    assert!(!response.is_ok_or_redirected());
    response.redirected = true;
    assert!(response.is_ok_or_redirected());
  }
}
