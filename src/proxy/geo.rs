//! Geolocation enrichment through a batch IP lookup service

use crate::error::Error;
use crate::proxy::models::{Candidate, GeoRecord};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{info, warn};

/// Default timeout for one batch request in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Most IPs the lookup service accepts per request
pub const DEFAULT_BATCH_LIMIT: usize = 100;

pub const DEFAULT_LOOKUP_URL: &str = "http://ip-api.com/batch";

/// Configuration for geolocation lookups
#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub timeout: Duration,
    pub batch_limit: usize,
    pub lookup_url: String,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            batch_limit: DEFAULT_BATCH_LIMIT,
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
        }
    }
}

impl GeoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    pub fn with_lookup_url(mut self, url: String) -> Self {
        self.lookup_url = url;
        self
    }
}

/// One batch request to a lookup service
#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// One JSON object per IP, each carrying the IP in `query`
    async fn lookup_batch(&self, ips: &[String]) -> Result<Vec<serde_json::Value>>;
}

/// ip-api.com batch endpoint client
#[derive(Debug, Clone)]
pub struct IpApiClient {
    client: Client,
    lookup_url: String,
}

impl IpApiClient {
    pub fn new(config: &GeoConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            lookup_url: config.lookup_url.clone(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiClient {
    async fn lookup_batch(&self, ips: &[String]) -> Result<Vec<serde_json::Value>> {
        let response = self.client.post(&self.lookup_url).json(ips).send().await?;
        if !response.status().is_success() {
            return Err(Error::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

/// Joins usable proxies with batch lookup results
pub struct GeoEnricher<L> {
    lookup: L,
    batch_limit: usize,
}

impl<L: GeoLookup> GeoEnricher<L> {
    pub fn new(lookup: L, batch_limit: usize) -> Self {
        Self {
            lookup,
            batch_limit: batch_limit.max(1),
        }
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    /// Look up every candidate's IP in batches and join results back by IP.
    ///
    /// A failed batch is skipped. Candidates without a matching result are
    /// left out.
    pub async fn enrich(&self, proxies: &[Candidate]) -> Vec<GeoRecord> {
        let ips: Vec<String> = proxies.iter().map(|p| p.ip.clone()).collect();
        let batches = ips.len().div_ceil(self.batch_limit);

        let mut results = Vec::new();
        for (index, batch) in ips.chunks(self.batch_limit).enumerate() {
            match self.lookup.lookup_batch(batch).await {
                Ok(found) => {
                    info!("Geolocation batch {}/{}: {} results", index + 1, batches, found.len());
                    results.extend(found);
                }
                Err(e) => warn!("Geolocation batch {}/{} failed: {}", index + 1, batches, e),
            }
        }

        join_by_ip(proxies, results)
    }
}

/// Match each result's `query` IP to a candidate port, one port per result
fn join_by_ip(proxies: &[Candidate], results: Vec<serde_json::Value>) -> Vec<GeoRecord> {
    let mut ports: HashMap<&str, VecDeque<u16>> = HashMap::new();
    for proxy in proxies {
        ports.entry(proxy.ip.as_str()).or_default().push_back(proxy.port);
    }

    results
        .into_iter()
        .filter_map(|geolocation| {
            let ip = geolocation.get("query")?.as_str()?.to_string();
            let port = ports.get_mut(ip.as_str())?.pop_front()?;
            Some(GeoRecord {
                ip,
                port,
                geolocation,
            })
        })
        .collect()
}
