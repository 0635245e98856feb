//! # Scrape Executor
//!
//! Fetches `params.url` and records what came back. The raw body goes to
//! the task's `<key>.scrape` scratch file; the journal patch records the
//! byte size, the MD5 hex digest of the body, and the response headers.
//!
//! Request shape:
//! - `GET params.url` by default.
//! - `POST` with `params.post_payload` as the JSON body when present.
//! - Routed through a proxy from the run's provider when one is configured;
//!   `params.country` selects the proxy bucket. A transport failure through
//!   a proxy marks that proxy bad before the error surfaces.
//!
//! A non-2xx response is a recoverable failure (`HTTP response <code>`), and
//! no scrape file is left on disk for it.

use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Proxy, StatusCode};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{Executor, Patch};
use crate::context::Context;
use crate::errors::ExecError;
use crate::journal::StatusData;

/// Journal key used by the default scrape executor.
pub const DEFAULT_NAME: &str = "scraper";

/// Byte-level acceptance check for a scraped body. Return `Err` with a
/// human-readable reason to reject the body.
pub type ValidateFn = dyn Fn(&[u8]) -> Result<(), String> + Send + Sync;

/// The URL-fetching pipeline step.
pub struct ScrapeExecutor {
    name: String,
    validate: Option<Arc<ValidateFn>>,
}

impl ScrapeExecutor {
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            validate: None,
        }
    }

    /// Scrape plus a caller-supplied body check. On rejection the scrape
    /// file is removed and the executor fails recoverably.
    pub fn with_validation(
        validate: impl Fn(&[u8]) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            validate: Some(Arc::new(validate)),
        }
    }

    /// Overrides the journal key, for pipelines that scrape more than once.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn fetch(
        &self,
        client: &Client,
        url: &str,
        post_payload: Option<&Value>,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>), reqwest::Error> {
        let request = match post_payload {
            Some(payload) => client.post(url).json(payload),
            None => client.get(url),
        };
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok((status, headers, body.to_vec()))
    }
}

impl Default for ScrapeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ScrapeExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        ctx: &Context,
        key: &str,
        status: &StatusData,
    ) -> Result<Patch, ExecError> {
        let params = status
            .params()
            .ok_or_else(|| anyhow!("task '{key}' has no params"))?;
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("task '{key}' has no 'url' param"))?;
        let post_payload = params.get("post_payload");
        let country = params.get("country").and_then(Value::as_str);

        // Pick a proxy up front so a transport failure can be pinned on it.
        let proxy_url = match &ctx.proxy_provider {
            Some(provider) => {
                let picked = provider.get_one_proxy(country).await;
                if picked.is_none() {
                    warn!(key = %key, "no usable proxy, scraping directly");
                }
                picked
            }
            None => None,
        };

        let result = match &proxy_url {
            Some(proxy) => {
                debug!(key = %key, proxy = %proxy, "scraping through proxy");
                let client = Client::builder().proxy(Proxy::all(proxy.as_str())?).build()?;
                self.fetch(&client, url, post_payload).await
            }
            None => self.fetch(&ctx.session, url, post_payload).await,
        };

        let (http_status, headers, body) = match result {
            Ok(parts) => parts,
            Err(err) => {
                if let (Some(proxy), Some(provider)) = (&proxy_url, &ctx.proxy_provider) {
                    warn!(key = %key, proxy = %proxy, "marking proxy bad after transport error");
                    provider.mark_bad(proxy).await;
                }
                return Err(ExecError::Transport(err));
            }
        };

        let scrape_path = ctx.task_file(key, "scrape");
        if !http_status.is_success() {
            // Do not leave a stale body from an earlier run next to an error.
            let _ = fs::remove_file(&scrape_path);
            return Err(ExecError::runtime(format!(
                "HTTP response {}",
                http_status.as_u16()
            )));
        }

        fs::write(&scrape_path, &body)
            .with_context(|| format!("write scrape file {}", scrape_path.display()))?;

        if let Some(validate) = &self.validate {
            if let Err(reason) = validate(&body) {
                let _ = fs::remove_file(&scrape_path);
                return Err(ExecError::runtime(reason));
            }
        }

        let mut response_headers = Map::new();
        for (header_name, header_value) in headers.iter() {
            if let Ok(text) = header_value.to_str() {
                response_headers.insert(
                    header_name.as_str().to_string(),
                    Value::String(text.to_string()),
                );
            }
        }

        let digest = format!("{:x}", md5::compute(&body));
        info!(
            key = %key,
            url = %url,
            status = http_status.as_u16(),
            size = body.len(),
            "scrape finished"
        );

        Ok(Patch::updated(json!({
            "size": body.len(),
            "content": digest,
            "response_headers": Value::Object(response_headers),
        })))
    }
}
