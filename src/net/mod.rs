//! HTTP request/response types and the network seam.
//!
//! Everything that talks to a server goes through [`Network`], so the cache
//! manager, the sync queue and the facade can be exercised against a fake.

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::{Origin, Url};

pub use reqwest::Method;

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL {}: {}", url, e))?;
    Ok(Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    })
  }

  pub fn get(url: &str) -> Result<Self> {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json<T: Serialize>(self, body: &T) -> Result<Self> {
    let bytes =
      serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    let mut req = self.with_header("content-type", "application/json");
    req.body = Some(bytes);
    Ok(req)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Whether the caller is navigating to a page (HTML accepted).
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|v| v.contains("text/html"))
      .unwrap_or(false)
  }

  /// Stable, fixed-length cache key derived from method and URL.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A received HTTP response. Stored verbatim in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Parsed `Date` header, if present and well-formed.
  pub fn date(&self) -> Option<DateTime<Utc>> {
    self
      .header("date")
      .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
      .map(|d| d.with_timezone(&Utc))
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }

  /// Server-assigned id from a creation response (`{"id": ...}`).
  pub fn server_id(&self) -> Option<String> {
    let body: Value = self.json().ok()?;
    match body.get("id")? {
      Value::String(s) => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Performs a single HTTP exchange.
///
/// Implementations return `Err` for transport failures only; non-2xx statuses
/// come back as a normal [`Response`].
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network implementation backed by reqwest.
///
/// The API token is only attached to requests for the configured server origin.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  auth: Option<(String, Origin)>,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("skysync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, auth: None })
  }

  /// Send `token` as bearer auth to `server`'s origin.
  pub fn with_token(mut self, token: Option<String>, server: &Url) -> Self {
    self.auth = token.map(|t| (t, server.origin()));
    self
  }

  fn build(&self, request: &Request) -> Result<reqwest::Request> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some((token, origin)) = &self.auth {
      if request.url.origin() == *origin {
        builder = builder.bearer_auth(token);
      }
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    builder
      .build()
      .map_err(|e| eyre!("Invalid request to {}: {}", request.url, e))
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let response = self
      .client
      .execute(self.build(request)?)
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body from {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
