//! Protocol classification against a target site

use crate::error::Error;
use crate::proxy::agent::random_user_agent;
use crate::proxy::models::{ClassificationOutcome, Protocol, ProtocolHint, ProxyEntry};
use crate::Result;
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::{Client, Proxy as ReqwestProxy, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default timeout for one classification attempt in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default site proxies are validated against
pub const DEFAULT_TARGET_URL: &str = "https://www.youtube.com/";

/// Configuration for protocol classification
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Timeout for each attempt
    pub timeout: Duration,
    /// URL that must answer 200 through the proxy
    pub target_url: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            target_url: DEFAULT_TARGET_URL.to_string(),
        }
    }
}

impl ClassifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_target_url(mut self, url: String) -> Self {
        self.target_url = url;
        self
    }
}

/// A single request through a proxy speaking one protocol
#[async_trait]
pub trait ProtocolCheck: Send + Sync {
    /// `Ok(200)` on success; any other status is `Error::Status`
    async fn attempt(&self, entry: &ProxyEntry, protocol: Protocol) -> Result<u16>;
}

/// Real attempts over reqwest, random User-Agent per request
#[derive(Debug, Clone, Default)]
pub struct HttpProtocolCheck {
    config: ClassifierConfig,
}

impl HttpProtocolCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn create_client(&self, entry: &ProxyEntry, protocol: Protocol) -> Result<Client> {
        let client = Client::builder()
            .proxy(ReqwestProxy::all(entry.url(protocol))?)
            .timeout(self.config.timeout)
            .build()?;
        Ok(client)
    }
}

#[async_trait]
impl ProtocolCheck for HttpProtocolCheck {
    async fn attempt(&self, entry: &ProxyEntry, protocol: Protocol) -> Result<u16> {
        let client = self.create_client(entry, protocol)?;
        let response = client
            .get(&self.config.target_url)
            .header(USER_AGENT, random_user_agent())
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Status(status.as_u16()));
        }
        Ok(status.as_u16())
    }
}

/// Walks the protocol fallback chain for one proxy entry
pub struct Classifier<C> {
    check: C,
}

impl<C: ProtocolCheck> Classifier<C> {
    pub fn new(check: C) -> Self {
        Self { check }
    }

    pub fn check(&self) -> &C {
        &self.check
    }

    /// Classify one entry.
    ///
    /// A hinted entry gets exactly one attempt. An unhinted one tries http,
    /// socks4 and socks5 in turn and stops at the first success. No new
    /// attempt starts once `cancel` is raised.
    pub async fn classify(
        &self,
        position: usize,
        entry: &ProxyEntry,
        cancel: &CancellationToken,
    ) -> ClassificationOutcome {
        let worker = position + 1;
        let (mut protocol, fallback) = match &entry.hint {
            ProtocolHint::None => (Protocol::Http, true),
            ProtocolHint::Known(protocol) => (*protocol, false),
            ProtocolHint::Unknown(hint) => {
                warn!("Worker {} | {} | unsupported protocol {}", worker, entry.address, hint);
                return ClassificationOutcome::failed(entry.address.clone());
            }
        };

        loop {
            match self.check.attempt(entry, protocol).await {
                Ok(status) => {
                    info!(
                        "Worker {} | {} | GOOD | Type : {} | Response : {}",
                        worker, entry.address, protocol, status
                    );
                    return ClassificationOutcome::functional(entry.address.clone(), protocol);
                }
                Err(e) => {
                    let status = e.status().map(|s| s.to_string()).unwrap_or_default();
                    info!(
                        "Worker {} | {} | {} | BAD | {}",
                        worker, entry.address, protocol, status
                    );
                    debug!("Worker {} | {} | {} | {}", worker, entry.address, protocol, e);
                }
            }

            let last_failed = protocol;
            let Some(next) = last_failed.next().filter(|_| fallback) else {
                break;
            };
            if cancel.is_cancelled() {
                debug!("Worker {} | {} | cancelled before {}", worker, entry.address, next);
                break;
            }
            protocol = next;
        }

        ClassificationOutcome::failed(entry.address.clone())
    }
}
