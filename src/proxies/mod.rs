//! # Proxy Providers
//!
//! Scrape-style executors consume proxies through the narrow
//! [`ProxyProvider`] interface: fetch one proxy (optionally constrained by
//! country), mark one bad, probe them all. [`ProxyPool`] is the concrete
//! implementation, with constructors covering the usual sources: a plain
//! list, a country map, a public plain-text API, and an authenticated API.
//!
//! Proxy URLs are fully qualified: `http://[user:password@]host:port`.
//! Country keys are opaque strings from the underlying source; `""` and
//! `"*"` are the reserved wildcard bucket (normalized to `""` internally).
//!
//! Rotation policy: `get_one_proxy` picks uniformly at random among the
//! eligible candidates. The bad set lives in memory only; a new process
//! starts clean and `check_proxies` can rebuild it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::{Client, Proxy};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Key of the wildcard bucket.
pub const WILDCARD: &str = "";

/// Benign URL fetched through each proxy by `check_proxies`.
const PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Supplier of proxy URLs for scrape-style executors.
///
/// All operations must be safe under concurrent use: workers call
/// `get_one_proxy` and `mark_bad` from many tasks at once.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// An arbitrary live proxy from the requested country bucket, falling
    /// back to the wildcard bucket when the country bucket has no
    /// candidates. `None` when nothing usable remains.
    async fn get_one_proxy(&self, country: Option<&str>) -> Option<String>;

    /// Temporarily excludes `proxy` from selection.
    async fn mark_bad(&self, proxy: &str);

    /// Probes every proxy (`1 + retries` attempts each) with a benign
    /// request through it; proxies that never answer join the bad set.
    /// Idempotent; safe to call before a run.
    async fn check_proxies(&self, timeout: Duration, retries: u32);
}

/// Country-bucketed proxy pool with an in-memory bad set.
pub struct ProxyPool {
    buckets: HashMap<String, Vec<String>>,
    bad: Mutex<HashSet<String>>,
    probe_url: String,
}

impl ProxyPool {
    /// Pool with a single wildcard bucket.
    pub fn from_list(proxies: Vec<String>) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(WILDCARD.to_string(), proxies);
        Self::from_buckets(buckets)
    }

    /// Pool bucketed by country code. `""` and `"*"` keys merge into the
    /// wildcard bucket.
    pub fn from_country_map(map: HashMap<String, Vec<String>>) -> Self {
        let mut buckets: HashMap<String, Vec<String>> = HashMap::new();
        for (country, proxies) in map {
            let bucket = if country == "*" {
                WILDCARD.to_string()
            } else {
                country
            };
            buckets.entry(bucket).or_default().extend(proxies);
        }
        Self::from_buckets(buckets)
    }

    /// Pool fetched from a public API returning one `host:port` per line.
    pub async fn fetch_from_url(client: &Client, url: &str) -> Result<Self> {
        let body = client
            .get(url)
            .send()
            .await
            .context("Failed to fetch proxy list")?
            .error_for_status()
            .context("Proxy list endpoint returned an error")?
            .text()
            .await
            .context("Failed to read proxy list body")?;

        let proxies: Vec<String> = body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                if line.starts_with("http") {
                    line.to_string()
                } else {
                    format!("http://{line}")
                }
            })
            .collect();

        info!(count = proxies.len(), url = %url, "fetched proxy list");
        Ok(Self::from_list(proxies))
    }

    /// Pool fetched from an authenticated API returning JSON entries with
    /// host, port, credentials, and an optional country code.
    pub async fn fetch_authenticated(client: &Client, url: &str, api_key: &str) -> Result<Self> {
        let entries: Vec<RemoteProxy> = client
            .get(url)
            .header("Authorization", format!("Token {api_key}"))
            .send()
            .await
            .context("Failed to fetch proxies from provider")?
            .error_for_status()
            .context("Proxy provider returned an error")?
            .json()
            .await
            .context("Failed to parse proxy provider response")?;

        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for entry in entries {
            let bucket = entry.country_code.clone().unwrap_or_default();
            map.entry(bucket).or_default().push(entry.into_url());
        }

        info!(
            buckets = map.len(),
            url = %url,
            "fetched authenticated proxy list"
        );
        Ok(Self::from_country_map(map))
    }

    /// Replaces the liveness-probe URL (the pool default is a well-known
    /// 204 endpoint).
    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = url.into();
        self
    }

    /// Currently excluded proxies, sorted.
    pub async fn bad_proxies(&self) -> Vec<String> {
        let bad = self.bad.lock().await;
        let mut list: Vec<String> = bad.iter().cloned().collect();
        list.sort();
        list
    }

    fn from_buckets(buckets: HashMap<String, Vec<String>>) -> Self {
        Self {
            buckets,
            bad: Mutex::new(HashSet::new()),
            probe_url: PROBE_URL.to_string(),
        }
    }

    fn all_proxies(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut list = Vec::new();
        for proxies in self.buckets.values() {
            for proxy in proxies {
                if seen.insert(proxy.as_str()) {
                    list.push(proxy.clone());
                }
            }
        }
        list
    }
}

#[async_trait]
impl ProxyProvider for ProxyPool {
    async fn get_one_proxy(&self, country: Option<&str>) -> Option<String> {
        let bad = self.bad.lock().await;
        fn live<'a>(bucket: Option<&'a Vec<String>>, bad: &HashSet<String>) -> Vec<&'a String> {
            bucket
                .map(|urls| urls.iter().filter(|p| !bad.contains(p.as_str())).collect())
                .unwrap_or_default()
        }

        let mut candidates = live(country.and_then(|c| self.buckets.get(c)), &bad);
        if candidates.is_empty() {
            candidates = live(self.buckets.get(WILDCARD), &bad);
        }

        candidates
            .choose(&mut rand::thread_rng())
            .map(|proxy| (*proxy).clone())
    }

    async fn mark_bad(&self, proxy: &str) {
        let mut bad = self.bad.lock().await;
        if bad.insert(proxy.to_string()) {
            debug!(proxy = %proxy, "proxy marked bad");
        }
    }

    async fn check_proxies(&self, timeout: Duration, retries: u32) {
        let mut probes = JoinSet::new();
        for proxy in self.all_proxies() {
            let probe_url = self.probe_url.clone();
            probes.spawn(async move {
                let alive = probe_proxy(&proxy, &probe_url, timeout, retries).await;
                (proxy, alive)
            });
        }

        let mut dead = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((proxy, false)) => dead.push(proxy),
                Err(err) => warn!(error = %err, "proxy probe task failed"),
            }
        }

        if !dead.is_empty() {
            info!(count = dead.len(), "proxies failed the liveness probe");
            let mut bad = self.bad.lock().await;
            bad.extend(dead);
        }
    }
}

async fn probe_proxy(proxy: &str, probe_url: &str, timeout: Duration, retries: u32) -> bool {
    let client = match Proxy::all(proxy)
        .and_then(|p| Client::builder().proxy(p).timeout(timeout).build())
    {
        Ok(client) => client,
        Err(err) => {
            warn!(proxy = %proxy, error = %err, "unusable proxy url");
            return false;
        }
    };

    for attempt in 0..=retries {
        match client.get(probe_url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                debug!(proxy = %proxy, status = response.status().as_u16(), attempt, "probe rejected");
            }
            Err(err) => {
                debug!(proxy = %proxy, error = %err, attempt, "probe failed");
            }
        }
    }
    false
}

#[derive(Debug, Deserialize)]
struct RemoteProxy {
    host: String,
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
}

impl RemoteProxy {
    fn into_url(self) -> String {
        match (self.username, self.password) {
            (Some(user), Some(password)) => {
                format!("http://{user}:{password}@{}:{}", self.host, self.port)
            }
            _ => format!("http://{}:{}", self.host, self.port),
        }
    }
}
