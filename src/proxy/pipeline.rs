//! Harvest and check runs

use crate::error::Error;
use crate::proxy::checker::{Classifier, ClassifierConfig, HttpProtocolCheck, ProtocolCheck};
use crate::proxy::coordinator::{Coordinator, CoordinatorConfig};
use crate::proxy::crawler::{CrawlerConfig, ProxyCrawler, SourceDefinition, SourceReport};
use crate::proxy::geo::{GeoConfig, GeoEnricher, GeoLookup, IpApiClient};
use crate::proxy::models::{Candidate, ClassificationOutcome, ProbeOutcome, Protocol, ProxyEntry};
use crate::proxy::parser::{dedup_candidates, ProxyParser};
use crate::proxy::prober::{current_ip, probe_candidate, Probe, ProberConfig, ReachabilityProber};
use crate::proxy::sink::{self, GoodProxySink, OutputPaths, UsablePool};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default worker count for reachability probing
pub const DEFAULT_PROBE_CONCURRENCY: usize = 300;

/// Default worker count for protocol classification
pub const DEFAULT_CHECK_CONCURRENCY: usize = 100;

/// Configuration for a harvest run
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub crawler: CrawlerConfig,
    pub prober: ProberConfig,
    pub coordinator: CoordinatorConfig,
    /// Geolocation stage, skipped when `None`
    pub geo: Option<GeoConfig>,
    /// Log this host's public IP at the end of the run
    pub report_ip: bool,
    pub output: OutputPaths,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerConfig::default(),
            prober: ProberConfig::default(),
            coordinator: CoordinatorConfig::default().with_concurrency(DEFAULT_PROBE_CONCURRENCY),
            geo: Some(GeoConfig::default()),
            report_ip: false,
            output: OutputPaths::in_dir("."),
        }
    }
}

impl HarvestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crawler(mut self, crawler: CrawlerConfig) -> Self {
        self.crawler = crawler;
        self
    }

    pub fn with_prober(mut self, prober: ProberConfig) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_geo(mut self, geo: Option<GeoConfig>) -> Self {
        self.geo = geo;
        self
    }

    pub fn with_report_ip(mut self, report_ip: bool) -> Self {
        self.report_ip = report_ip;
        self
    }

    pub fn with_output(mut self, output: OutputPaths) -> Self {
        self.output = output;
        self
    }
}

/// Summary of a harvest run
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    pub sources: Vec<SourceReport>,
    /// Unique candidates probed
    pub crawled: usize,
    pub usable: usize,
    pub geolocated: usize,
}

/// Crawl → de-duplicate → probe → persist → enrich
pub struct Harvester<P, L> {
    config: HarvestConfig,
    prober: Arc<P>,
    geo: Option<GeoEnricher<L>>,
}

impl Harvester<ReachabilityProber, IpApiClient> {
    /// Harvester backed by real network clients
    pub fn from_config(config: HarvestConfig) -> Result<Self> {
        let prober = ReachabilityProber::with_config(config.prober.clone());
        let geo = config
            .geo
            .as_ref()
            .map(|geo| {
                IpApiClient::new(geo).map(|client| GeoEnricher::new(client, geo.batch_limit))
            })
            .transpose()?;
        Ok(Self::new(config, prober, geo))
    }
}

impl<P, L> Harvester<P, L>
where
    P: Probe + 'static,
    L: GeoLookup,
{
    pub fn new(config: HarvestConfig, prober: P, geo: Option<GeoEnricher<L>>) -> Self {
        Self {
            config,
            prober: Arc::new(prober),
            geo,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    pub fn geo(&self) -> Option<&GeoEnricher<L>> {
        self.geo.as_ref()
    }

    /// Full run over the given listing sources
    pub async fn run(
        &self,
        sources: &[SourceDefinition],
        cancel: CancellationToken,
    ) -> Result<HarvestReport> {
        let crawler = ProxyCrawler::with_config(self.config.crawler.clone())?;
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Interrupted while crawling, nothing written");
                return Err(Error::Cancelled {
                    finished: 0,
                    total: sources.len(),
                });
            }
            results = crawler.crawl_sources_with_results(sources) => results,
        };

        let reports: Vec<SourceReport> = results.iter().map(|r| r.report()).collect();
        sink::write_source_report(&self.config.output.source_report, &reports)?;

        let candidates = results.into_iter().flat_map(|r| r.proxies).collect();
        let mut report = self.process(candidates, cancel).await?;
        report.sources = reports;
        Ok(report)
    }

    /// Probe already-collected candidates and write the artifacts.
    ///
    /// On cancellation the usable proxies found so far are written when there
    /// are any, then `Error::Cancelled` is returned. Existing artifacts are
    /// left alone when nothing usable was found.
    pub async fn process(
        &self,
        candidates: Vec<Candidate>,
        cancel: CancellationToken,
    ) -> Result<HarvestReport> {
        let candidates = dedup_candidates(candidates);
        let crawled = candidates.len();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                finished: 0,
                total: crawled,
            });
        }
        info!("{} unique proxies to probe", crawled);

        let pool = UsablePool::new();
        let coordinator = Coordinator::new(self.config.coordinator.clone(), cancel);
        let probed =
            probe_all(&coordinator, candidates, Arc::clone(&self.prober), pool.clone()).await;

        let usable = pool.snapshot();
        if let Err(e) = probed {
            if usable.is_empty() {
                warn!("Stopped early, no usable proxies found, artifacts untouched");
            } else {
                self.write_usable(&usable)?;
                warn!("Stopped early, {} usable proxies saved", usable.len());
            }
            return Err(e);
        }
        self.write_usable(&usable)?;

        let mut geolocated = 0;
        if let Some(geo) = &self.geo {
            let records = geo.enrich(&usable).await;
            geolocated = records.len();
            if sink::write_geo_json(&self.config.output.geo_json, &records)? {
                info!("{} proxies geolocated", geolocated);
            }
        }

        info!("{} proxies are crawled.", crawled);
        info!("{} proxies are usable.", usable.len());

        if self.config.report_ip {
            match current_ip(&self.config.prober.echo_url, self.config.prober.timeout).await {
                Ok(ip) => info!("Current IP Address: {}", ip),
                Err(e) => warn!("Could not determine current IP address: {}", e),
            }
        }

        Ok(HarvestReport {
            sources: Vec::new(),
            crawled,
            usable: usable.len(),
            geolocated,
        })
    }

    fn write_usable(&self, usable: &[Candidate]) -> Result<()> {
        sink::write_usable_json(&self.config.output.usable_json, usable)?;
        sink::write_usable_text(&self.config.output.usable_text, usable)
    }
}

/// Probe every candidate under the coordinator's bound
pub async fn probe_all<P>(
    coordinator: &Coordinator,
    candidates: Vec<Candidate>,
    prober: Arc<P>,
    pool: UsablePool,
) -> Result<Vec<ProbeOutcome>>
where
    P: Probe + 'static,
{
    coordinator
        .run(candidates, move |_, candidate, _| {
            let prober = Arc::clone(&prober);
            let pool = pool.clone();
            async move { probe_candidate(prober.as_ref(), candidate, &pool).await }
        })
        .await
}

/// Configuration for a check run
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Proxy list to classify
    pub input: PathBuf,
    pub classifier: ClassifierConfig,
    pub coordinator: CoordinatorConfig,
    pub output: OutputPaths,
}

impl Default for CheckConfig {
    fn default() -> Self {
        let output = OutputPaths::in_dir(".");
        Self {
            input: output.usable_text.clone(),
            classifier: ClassifierConfig::default(),
            coordinator: CoordinatorConfig::default().with_concurrency(DEFAULT_CHECK_CONCURRENCY),
            output,
        }
    }
}

impl CheckConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_output(mut self, output: OutputPaths) -> Self {
        self.output = output;
        self
    }
}

/// Summary of a check run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub total: usize,
    pub functional: usize,
    pub http: usize,
    pub socks4: usize,
    pub socks5: usize,
}

impl CheckReport {
    fn from_outcomes(total: usize, outcomes: &[ClassificationOutcome]) -> Self {
        let mut report = Self {
            total,
            ..Self::default()
        };
        for protocol in outcomes.iter().filter(|o| o.functional).filter_map(|o| o.protocol) {
            report.functional += 1;
            match protocol {
                Protocol::Http => report.http += 1,
                Protocol::Socks4 => report.socks4 += 1,
                Protocol::Socks5 => report.socks5 += 1,
            }
        }
        report
    }
}

/// Load → de-duplicate → classify → append good proxies
pub struct Checker<C> {
    config: CheckConfig,
    classifier: Arc<Classifier<C>>,
}

impl Checker<HttpProtocolCheck> {
    /// Checker backed by real network requests
    pub fn from_config(config: CheckConfig) -> Self {
        let check = HttpProtocolCheck::with_config(config.classifier.clone());
        Self::new(config, check)
    }
}

impl<C> Checker<C>
where
    C: ProtocolCheck + 'static,
{
    pub fn new(config: CheckConfig, check: C) -> Self {
        Self {
            config,
            classifier: Arc::new(Classifier::new(check)),
        }
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier<C> {
        &self.classifier
    }

    /// Classify the configured input file; an unreadable input is fatal
    pub async fn run(&self, cancel: CancellationToken) -> Result<CheckReport> {
        let entries = ProxyParser::parse_file(&self.config.input).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", self.config.input.display(), e))
        })?;
        self.process(entries, cancel).await
    }

    /// Classify entries, appending every success to the good-proxy file
    pub async fn process(
        &self,
        entries: Vec<ProxyEntry>,
        cancel: CancellationToken,
    ) -> Result<CheckReport> {
        let total = entries.len();
        info!("Total unique proxies : {}", total);
        if total < self.config.coordinator.concurrency {
            info!(
                "Fewer proxies than workers ({} < {})",
                total, self.config.coordinator.concurrency
            );
        }

        let output = &self.config.output;
        let sink = Arc::new(GoodProxySink::create(
            &output.good_proxies,
            Some(output.good_backup.as_path()),
        )?);

        let coordinator = Coordinator::new(self.config.coordinator.clone(), cancel);
        let outcomes = classify_all(
            &coordinator,
            entries,
            Arc::clone(&self.classifier),
            Arc::clone(&sink),
        )
        .await?;

        let report = CheckReport::from_outcomes(total, &outcomes);
        info!(
            "{} of {} proxies are functional ({} written to {})",
            report.functional,
            total,
            sink.written(),
            sink.path().display()
        );
        Ok(report)
    }
}

/// Classify every entry under the coordinator's bound
pub async fn classify_all<C>(
    coordinator: &Coordinator,
    entries: Vec<ProxyEntry>,
    classifier: Arc<Classifier<C>>,
    sink: Arc<GoodProxySink>,
) -> Result<Vec<ClassificationOutcome>>
where
    C: ProtocolCheck + 'static,
{
    coordinator
        .run(entries, move |position, entry, cancel| {
            let classifier = Arc::clone(&classifier);
            let sink = Arc::clone(&sink);
            async move {
                let outcome = classifier.classify(position, &entry, &cancel).await;
                if let Some(line) = outcome.good_line() {
                    if let Err(e) = sink.record(&line) {
                        error!("Failed to record {}: {}", line, e);
                    }
                }
                outcome
            }
        })
        .await
}
