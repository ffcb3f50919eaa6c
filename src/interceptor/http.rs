//! Request/response types seen by the interceptor and the transport seam.

use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::storage::CacheEntry;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  #[default]
  Cors,
  NoCors,
  SameOrigin,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub accept: Option<String>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::default(),
      accept: None,
    }
  }

  /// A page navigation accepting HTML.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      accept: Some("text/html,application/xhtml+xml".to_string()),
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Served from one of the named caches
  Cache,
  /// Built locally because neither network nor cache could answer
  Synthetic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn network(status: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
    Self {
      status,
      content_type,
      body,
      source: ResponseSource::Network,
    }
  }

  pub fn synthetic(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: Some(content_type.to_string()),
      body: body.into(),
      source: ResponseSource::Synthetic,
    }
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn to_entry(&self, cache_name: &str, url: &Url) -> CacheEntry {
    CacheEntry {
      cache_name: cache_name.to_string(),
      url: url.to_string(),
      status: self.status,
      content_type: self.content_type.clone(),
      body: self.body.clone(),
      captured_at: Utc::now(),
    }
  }
}

impl From<CacheEntry> for Response {
  fn from(entry: CacheEntry) -> Self {
    Self {
      status: entry.status,
      content_type: entry.content_type,
      body: entry.body,
      source: ResponseSource::Cache,
    }
  }
}

/// Transport failure. An HTTP error status is not a failure; it comes back
/// as a normal `Response`.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),
  #[error("request timed out")]
  Timeout,
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Self::Timeout
    } else {
      Self::Network(e.to_string())
    }
  }
}

/// Something that can put a request on the wire.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  api_key: Option<String>,
  api_hosts: Vec<String>,
}

impl HttpFetcher {
  pub fn new(timeout: Duration, api_key: Option<String>, api_hosts: Vec<String>) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("fieldlink/", env!("CARGO_PKG_VERSION")))
      .build()?;

    Ok(Self {
      client,
      api_key,
      api_hosts: api_hosts.into_iter().map(|h| h.to_lowercase()).collect(),
    })
  }

  fn is_api_host(&self, url: &Url) -> bool {
    url
      .host_str()
      .map(|host| {
        let host = host.to_lowercase();
        self.api_hosts.iter().any(|h| host.contains(h.as_str()))
      })
      .unwrap_or(false)
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    if let Some(accept) = &request.accept {
      builder = builder.header(ACCEPT, accept);
    }
    if let Some(key) = self.api_key.as_deref().filter(|_| self.is_api_host(&request.url)) {
      builder = builder.header("apikey", key);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.bytes().await?.to_vec();

    Ok(Response::network(status, content_type, body))
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_navigate_request_accepts_html() {
    let req = Request::navigate(Url::parse("http://localhost/farms").unwrap());
    assert_eq!(req.mode, RequestMode::Navigate);
    assert!(req.accept.unwrap().contains("text/html"));
    assert_eq!(req.method, Method::GET);
  }

  #[test]
  fn test_success_range() {
    assert!(Response::network(204, None, vec![]).is_success());
    assert!(!Response::network(304, None, vec![]).is_success());
    assert!(!Response::network(500, None, vec![]).is_success());
  }

  #[test]
  fn test_api_key_only_for_api_hosts() {
    let fetcher = HttpFetcher::new(
      Duration::from_secs(1),
      Some("k".to_string()),
      vec!["Supabase.co".to_string()],
    )
    .unwrap();
    assert!(fetcher.is_api_host(&Url::parse("https://abc.supabase.co/rest/v1/farms").unwrap()));
    assert!(!fetcher.is_api_host(&Url::parse("https://cdn.example.com/app.js").unwrap()));
  }
}
