//! Request classification: decides which caching strategy applies.

use super::http::{Request, RequestMode};
use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Build-time asset, served cache-first
  StaticFile,
  /// Data endpoint, served network-first with cache fallback
  Api,
  /// Page load, network-first with an offline page
  Navigation,
  /// Everything else goes to the network only
  Other,
}

/// URL patterns used to classify requests.
#[derive(Debug, Clone)]
pub struct RouteRules {
  static_extensions: Vec<String>,
  api_prefixes: Vec<String>,
  api_hosts: Vec<String>,
}

impl RouteRules {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      static_extensions: config.static_extensions.clone(),
      api_prefixes: config.api_prefixes.clone(),
      api_hosts: config
        .api_hosts
        .iter()
        .map(|h| h.to_lowercase())
        .collect(),
    }
  }

  /// Classify a request. Checked in order: static file, api, navigation.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if self.is_static_file(request) {
      RequestClass::StaticFile
    } else if self.is_api(request) {
      RequestClass::Api
    } else if is_navigation(request) {
      RequestClass::Navigation
    } else {
      RequestClass::Other
    }
  }

  fn is_static_file(&self, request: &Request) -> bool {
    let path = request.url.path();
    let Some((_, ext)) = path.rsplit_once('.') else {
      return false;
    };
    // "/v1.2/farms" has a dot but no file extension
    if ext.contains('/') {
      return false;
    }
    let ext = ext.to_lowercase();
    self.static_extensions.iter().any(|e| *e == ext)
  }

  fn is_api(&self, request: &Request) -> bool {
    let path = request.url.path();
    if path.starts_with("/api/") {
      return true;
    }

    let host_matches = request
      .url
      .host_str()
      .map(|host| {
        let host = host.to_lowercase();
        self.api_hosts.iter().any(|h| host.contains(h.as_str()))
      })
      .unwrap_or(false);

    host_matches || self.api_prefixes.iter().any(|p| path.starts_with(p.as_str()))
  }
}

fn is_navigation(request: &Request) -> bool {
  request.mode == RequestMode::Navigate
    || request
      .accept
      .as_deref()
      .map(|a| a.contains("text/html"))
      .unwrap_or(false)
}
