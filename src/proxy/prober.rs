//! Reachability probing through an IP-echo endpoint

use crate::error::Error;
use crate::proxy::models::{Candidate, ProbeOutcome};
use crate::proxy::sink::UsablePool;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::time::Duration;
use tracing::{debug, info};

/// Default timeout for a reachability probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default endpoint echoing the caller's IP
pub const DEFAULT_ECHO_URL: &str = "https://ipecho.net/plain";

/// Configuration for the reachability prober
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Timeout for the whole probe request
    pub timeout: Duration,
    /// URL fetched through each candidate
    pub echo_url: String,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            echo_url: DEFAULT_ECHO_URL.to_string(),
        }
    }
}

impl ProberConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }
}

/// Liveness check for a single candidate
#[async_trait]
pub trait Probe: Send + Sync {
    /// `false` for any failure: refusal, timeout, bad status alike
    async fn is_reachable(&self, candidate: &Candidate) -> bool;
}

/// Probes candidates as plain HTTP forward proxies
#[derive(Debug, Clone, Default)]
pub struct ReachabilityProber {
    config: ProberConfig,
}

impl ReachabilityProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ProberConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    async fn request(&self, candidate: &Candidate) -> Result<()> {
        let client = self.create_client(candidate)?;

        let response = tokio::time::timeout(
            self.config.timeout,
            client.get(&self.config.echo_url).send(),
        )
        .await
        .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??;

        if !response.status().is_success() {
            return Err(Error::Status(response.status().as_u16()));
        }
        Ok(())
    }

    /// Both http and https traffic go through `http://ip:port`
    fn create_client(&self, candidate: &Candidate) -> Result<Client> {
        let client = Client::builder()
            .proxy(ReqwestProxy::all(candidate.proxy_url())?)
            .timeout(self.config.timeout)
            .build()?;
        Ok(client)
    }
}

#[async_trait]
impl Probe for ReachabilityProber {
    async fn is_reachable(&self, candidate: &Candidate) -> bool {
        match self.request(candidate).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Proxy {} unreachable: {}", candidate, e);
                false
            }
        }
    }
}

/// Probe one candidate, adding it to the pool when reachable
pub async fn probe_candidate<P>(prober: &P, candidate: Candidate, pool: &UsablePool) -> ProbeOutcome
where
    P: Probe + ?Sized,
{
    let reachable = prober.is_reachable(&candidate).await;
    if reachable {
        pool.push(candidate.clone());
    }
    info!("Checking Proxy: {} | usable: {}", candidate, reachable);

    ProbeOutcome {
        candidate,
        reachable,
    }
}

/// Public IP of this host as reported by the echo endpoint, no proxy involved
pub async fn current_ip(echo_url: &str, timeout: Duration) -> Result<String> {
    let client = Client::builder().timeout(timeout).build()?;
    let body = client
        .get(echo_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body.trim().to_string())
}
