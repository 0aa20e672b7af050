//! Proxy crawler module for fetching candidates from listing sources
//!
//! This module provides functionality for:
//! - Describing listing sources (URL, method, response parser)
//! - Parsing HTML tables, JSON documents and plain `ip:port` text
//! - Crawling every source while tolerating individual failures

use crate::error::Error;
use crate::proxy::agent::random_user_agent;
use crate::proxy::models::Candidate;
use crate::Result;
use futures::stream::{self, StreamExt};
use reqwest::header::USER_AGENT;
use reqwest::{Client, Method};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default timeout for source requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Sources fetched at the same time
const DEFAULT_SOURCE_CONCURRENCY: usize = 4;

/// Column mapping for HTML table sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableParser {
    /// Index of the table in the document
    #[serde(default)]
    pub table_index: usize,
    /// Header of the IP column
    pub ip: Option<String>,
    /// Header of the port column
    pub port: Option<String>,
    /// Header of a single `ip:port` column, used instead of `ip`/`port`
    pub combined: Option<String>,
}

/// Field mapping for JSON sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonParser {
    /// Dotted path to the array of records, empty for a top-level array
    #[serde(default)]
    pub data: String,
    pub ip: String,
    pub port: String,
}

/// How a source's response body is turned into candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserConfig {
    Table(TableParser),
    Json(JsonParser),
    /// One `ip:port` per line
    Text,
}

impl ParserConfig {
    pub fn parse(&self, body: &str) -> Result<Vec<Candidate>> {
        match self {
            ParserConfig::Table(table) => parse_table(body, table),
            ParserConfig::Json(json) => parse_json(body, json),
            ParserConfig::Text => Ok(parse_text(body)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParserConfig::Table(_) => "table",
            ParserConfig::Json(_) => "json",
            ParserConfig::Text => "text",
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// A listing source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub id: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub parser: ParserConfig,
}

impl SourceDefinition {
    pub fn new(id: &str, url: &str, parser: ParserConfig) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            method: default_method(),
            parser,
        }
    }

    pub fn http_method(&self) -> Result<Method> {
        Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| {
                Error::Config(format!("source {}: invalid method {}", self.id, self.method))
            })
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(rename = "source", default)]
    sources: Vec<SourceDefinition>,
}

/// Load source definitions from a TOML file of `[[source]]` tables
pub fn load_sources<P: AsRef<Path>>(path: P) -> Result<Vec<SourceDefinition>> {
    let content = std::fs::read_to_string(path)?;
    parse_sources(&content)
}

pub fn parse_sources(content: &str) -> Result<Vec<SourceDefinition>> {
    let file: SourcesFile = toml::from_str(content)?;
    for source in &file.sources {
        source.http_method()?;
        if let ParserConfig::Table(table) = &source.parser {
            let split = table.ip.is_some() && table.port.is_some();
            if !split && table.combined.is_none() {
                return Err(Error::Config(format!(
                    "source {}: table parser needs `ip` and `port`, or `combined`",
                    source.id
                )));
            }
        }
    }
    Ok(file.sources)
}

/// Result of crawling a single source
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// Source id
    pub source: String,
    pub url: String,
    /// Candidates extracted from the source
    pub proxies: Vec<Candidate>,
    /// Error message if crawling failed
    pub error: Option<String>,
}

/// Per-source line of the source report artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub id: String,
    pub url: String,
    pub succeeded: bool,
    pub count: usize,
}

impl CrawlResult {
    pub fn success(source: &SourceDefinition, proxies: Vec<Candidate>) -> Self {
        Self {
            source: source.id.clone(),
            url: source.url.clone(),
            proxies,
            error: None,
        }
    }

    pub fn failure(source: &SourceDefinition, error: String) -> Self {
        Self {
            source: source.id.clone(),
            url: source.url.clone(),
            proxies: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn report(&self) -> SourceReport {
        SourceReport {
            id: self.source.clone(),
            url: self.url.clone(),
            succeeded: self.is_success(),
            count: self.proxies.len(),
        }
    }
}

/// Configuration for proxy crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Timeout for each source request
    pub timeout: Duration,
    /// Fixed User-Agent; a random browser one is used per request when unset
    pub user_agent: Option<String>,
    /// Number of sources fetched concurrently
    pub concurrency: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: None,
            concurrency: DEFAULT_SOURCE_CONCURRENCY,
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Proxy crawler for fetching candidates from listing sources
pub struct ProxyCrawler {
    config: CrawlerConfig,
    client: Client,
}

impl ProxyCrawler {
    /// Create a new proxy crawler with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(CrawlerConfig::default())
    }

    /// Create a new proxy crawler with custom configuration
    pub fn with_config(config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Fetch and parse candidates from one source
    pub async fn crawl_source(&self, source: &SourceDefinition) -> Result<Vec<Candidate>> {
        info!("Source: {} has started.", source.id);

        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(random_user_agent);

        let response = self
            .client
            .request(source.http_method()?, &source.url)
            .header(USER_AGENT, user_agent)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;

        source
            .parser
            .parse(&body)
            .map_err(|e| Error::source_failure(&source.id, e.to_string()))
    }

    /// Crawl every source; a failing source contributes zero candidates
    pub async fn crawl_sources_with_results(
        &self,
        sources: &[SourceDefinition],
    ) -> Vec<CrawlResult> {
        stream::iter(sources)
            .map(|source| async move {
                match self.crawl_source(source).await {
                    Ok(proxies) => {
                        info!("Source: {} yielded {} proxies", source.id, proxies.len());
                        CrawlResult::success(source, proxies)
                    }
                    Err(e) => {
                        error!("Source: {} failed: {}", source.id, e);
                        CrawlResult::failure(source, e.to_string())
                    }
                }
            })
            .buffered(self.config.concurrency)
            .collect()
            .await
    }

    /// Built-in listing sources
    pub fn default_sources() -> Vec<SourceDefinition> {
        let table = |ip: &str, port: &str| {
            ParserConfig::Table(TableParser {
                table_index: 0,
                ip: Some(ip.to_string()),
                port: Some(port.to_string()),
                combined: None,
            })
        };

        vec![
            SourceDefinition::new(
                "free-proxy-list",
                "https://free-proxy-list.net/",
                table("IP Address", "Port"),
            ),
            SourceDefinition::new(
                "sslproxies",
                "https://www.sslproxies.org/",
                table("IP Address", "Port"),
            ),
            SourceDefinition::new(
                "us-proxy",
                "https://www.us-proxy.org/",
                table("IP Address", "Port"),
            ),
            SourceDefinition::new(
                "geonode",
                "https://proxylist.geonode.com/api/proxy-list?limit=500&page=1&sort_by=lastChecked&sort_type=desc",
                ParserConfig::Json(JsonParser {
                    data: "data".to_string(),
                    ip: "ip".to_string(),
                    port: "port".to_string(),
                }),
            ),
            SourceDefinition::new(
                "proxyscrape",
                "https://api.proxyscrape.com/v2/?request=displayproxies&protocol=http&timeout=10000&country=all&ssl=all&anonymity=all",
                ParserConfig::Text,
            ),
            SourceDefinition::new(
                "thespeedx-http",
                "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
                ParserConfig::Text,
            ),
        ]
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::Parse(format!("invalid selector {}: {}", css, e)))
}

fn cell_texts(row: ElementRef<'_>, cells: &Selector) -> Vec<String> {
    row.select(cells)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect()
}

/// Extract candidates from the configured HTML table, columns matched by header text
fn parse_table(body: &str, config: &TableParser) -> Result<Vec<Candidate>> {
    let document = Html::parse_document(body);
    let table_selector = selector("table")?;
    let row_selector = selector("tr")?;
    let cell_selector = selector("th, td")?;

    let table = document
        .select(&table_selector)
        .nth(config.table_index)
        .ok_or_else(|| Error::Parse(format!("no table at index {}", config.table_index)))?;

    let mut rows = table.select(&row_selector);
    let header = rows
        .next()
        .map(|row| cell_texts(row, &cell_selector))
        .ok_or_else(|| Error::Parse("table has no rows".to_string()))?;

    let column = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::Parse(format!("column {} not found", name)))
    };

    let mut proxies = Vec::new();
    match (&config.combined, &config.ip, &config.port) {
        (Some(combined), _, _) => {
            let idx = column(combined)?;
            for row in rows {
                let cells = cell_texts(row, &cell_selector);
                if let Some(candidate) = cells.get(idx).and_then(|c| parse_ip_port(c)) {
                    proxies.push(candidate);
                }
            }
        }
        (None, Some(ip), Some(port)) => {
            let (ip_idx, port_idx) = (column(ip)?, column(port)?);
            for row in rows {
                let cells = cell_texts(row, &cell_selector);
                let (Some(ip), Some(port)) = (cells.get(ip_idx), cells.get(port_idx)) else {
                    continue;
                };
                match port.parse::<u16>() {
                    Ok(port) if !ip.is_empty() => proxies.push(Candidate::new(ip.as_str(), port)),
                    _ => debug!("Skipping table row {}:{}", ip, port),
                }
            }
        }
        _ => {
            return Err(Error::Config(
                "table parser needs `ip` and `port`, or `combined`".to_string(),
            ))
        }
    }

    Ok(proxies)
}

/// Extract candidates from an array of JSON records
fn parse_json(body: &str, config: &JsonParser) -> Result<Vec<Candidate>> {
    let root: serde_json::Value = serde_json::from_str(body)?;

    let data = config
        .data
        .split('.')
        .filter(|key| !key.is_empty())
        .try_fold(&root, |value, key| value.get(key))
        .and_then(|value| value.as_array())
        .ok_or_else(|| Error::Parse(format!("no array at `{}`", config.data)))?;

    let proxies = data
        .iter()
        .filter_map(|record| {
            let ip = json_text(record.get(&config.ip)?)?;
            let port = json_text(record.get(&config.port)?)?.parse::<u16>().ok()?;
            (!ip.is_empty()).then(|| Candidate::new(ip, port))
        })
        .collect();

    Ok(proxies)
}

fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract candidates from `ip:port` lines, ignoring anything else
fn parse_text(body: &str) -> Vec<Candidate> {
    body.lines().filter_map(parse_ip_port).collect()
}

fn parse_ip_port(line: &str) -> Option<Candidate> {
    let (ip, port) = line.trim().split_once(':')?;
    if port.contains(':') {
        return None;
    }
    let ip = ip.trim();
    let port = port.trim().parse::<u16>().ok()?;
    (!ip.is_empty()).then(|| Candidate::new(ip, port))
}
