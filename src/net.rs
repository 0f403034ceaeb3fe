use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::Origin;

use crate::cache::{Fetcher, Request, RequestMode, Response, ResponseKind};
use crate::config::Config;

/// Network fetcher backed by reqwest
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shelfguard/", env!("CARGO_PKG_VERSION")))
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin_url()?.origin(),
    })
  }

  fn kind_for(&self, request: &Request) -> ResponseKind {
    if request.url.origin() == self.origin {
      ResponseKind::Basic
    } else if request.mode == RequestMode::NoCors {
      ResponseKind::Opaque
    } else {
      ResponseKind::Cors
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    let kind = self.kind_for(request);
    if kind == ResponseKind::Opaque {
      // Status and headers of a no-cors response are not visible
      return Ok(Response {
        status: 0,
        status_text: String::new(),
        headers: Vec::new(),
        body,
        kind,
      });
    }

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body,
      kind,
    })
  }
}
