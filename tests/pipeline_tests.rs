use async_trait::async_trait;
use parking_lot::Mutex;
use proxy_harvest::proxy::pipeline::probe_all;
use proxy_harvest::{
    Candidate, CheckConfig, Checker, Coordinator, CoordinatorConfig, Error, GeoEnricher,
    GeoLookup, HarvestConfig, Harvester, OutputPaths, ParserConfig, Probe, Protocol,
    ProtocolCheck, ProxyEntry, Result, SourceDefinition, UsablePool,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tracks how many probes run at once; even ports are reachable
#[derive(Default)]
struct GaugeProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Probe for GaugeProbe {
    async fn is_reachable(&self, candidate: &Candidate) -> bool {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        candidate.port % 2 == 0
    }
}

struct AlwaysReachable;

#[async_trait]
impl Probe for AlwaysReachable {
    async fn is_reachable(&self, _candidate: &Candidate) -> bool {
        true
    }
}

/// Echoes each IP back, failing the second batch
#[derive(Default)]
struct FlakyGeo {
    batches: AtomicUsize,
}

#[async_trait]
impl GeoLookup for FlakyGeo {
    async fn lookup_batch(&self, ips: &[String]) -> Result<Vec<serde_json::Value>> {
        if self.batches.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(Error::Status(503));
        }
        Ok(ips
            .iter()
            .map(|ip| serde_json::json!({"query": ip, "countryCode": "NL"}))
            .collect())
    }
}

/// Raises the token once `cancel_at` probes have started and holds every
/// probe open until then
struct CancellingProbe {
    cancel: CancellationToken,
    cancel_at: usize,
    reachable: bool,
    started: AtomicUsize,
}

impl CancellingProbe {
    fn new(cancel: &CancellationToken, cancel_at: usize, reachable: bool) -> Self {
        Self {
            cancel: cancel.clone(),
            cancel_at,
            reachable,
            started: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Probe for CancellingProbe {
    async fn is_reachable(&self, _candidate: &Candidate) -> bool {
        if self.started.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_at {
            self.cancel.cancel();
        }
        self.cancel.cancelled().await;
        self.reachable
    }
}

/// Counts lookups and answers every IP
#[derive(Default)]
struct CountingGeo {
    calls: AtomicUsize,
}

#[async_trait]
impl GeoLookup for CountingGeo {
    async fn lookup_batch(&self, ips: &[String]) -> Result<Vec<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ips.iter().map(|ip| serde_json::json!({"query": ip})).collect())
    }
}

/// Raises the token once `cancel_at` attempts have started and holds every
/// attempt open until then
struct CancellingCheck {
    cancel: CancellationToken,
    cancel_at: usize,
    attempts: Mutex<Vec<(String, Protocol)>>,
}

#[async_trait]
impl ProtocolCheck for CancellingCheck {
    async fn attempt(&self, entry: &ProxyEntry, protocol: Protocol) -> Result<u16> {
        let started = {
            let mut attempts = self.attempts.lock();
            attempts.push((entry.address.clone(), protocol));
            attempts.len()
        };
        if started == self.cancel_at {
            self.cancel.cancel();
        }
        self.cancel.cancelled().await;
        Err(Error::Status(403))
    }
}

/// Accepts socks5 for ports ending in 5, http for everything else even
struct PortCheck;

#[async_trait]
impl ProtocolCheck for PortCheck {
    async fn attempt(&self, entry: &ProxyEntry, protocol: Protocol) -> Result<u16> {
        let port: u16 = entry
            .address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        let accepted = match protocol {
            Protocol::Socks5 => port % 10 == 5,
            Protocol::Http => port % 2 == 0,
            Protocol::Socks4 => false,
        };
        if accepted {
            Ok(200)
        } else {
            Err(Error::Status(407))
        }
    }
}

fn no_stagger(concurrency: usize) -> CoordinatorConfig {
    CoordinatorConfig::new()
        .with_concurrency(concurrency)
        .with_stagger(Duration::ZERO)
}

#[tokio::test]
async fn harvest_dedups_and_persists_usable_pool() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    let config = HarvestConfig::new()
        .with_coordinator(no_stagger(50))
        .with_geo(None)
        .with_output(output.clone());
    let harvester = Harvester::new(config, GaugeProbe::default(), None::<GeoEnricher<FlakyGeo>>);

    let mut candidates: Vec<Candidate> = (0..300u16)
        .map(|i| Candidate::new("192.0.2.1", 1000 + i))
        .collect();
    candidates.extend((0..20u16).map(|i| Candidate::new("192.0.2.1", 1000 + i)));

    let report = harvester
        .process(candidates, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.crawled, 300);
    assert_eq!(report.usable, 150);

    let text = std::fs::read_to_string(&output.usable_text).unwrap();
    assert_eq!(text.lines().count(), 150);
    let json: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&output.usable_json).unwrap()).unwrap();
    assert_eq!(json.len(), 150);
    assert_eq!(json[0]["ip"], "192.0.2.1");
}

#[tokio::test]
async fn probes_never_exceed_concurrency_bound() {
    let probe = Arc::new(GaugeProbe::default());
    let coordinator = Coordinator::new(no_stagger(50), CancellationToken::new());
    let pool = UsablePool::new();
    let candidates: Vec<Candidate> = (0..300u16)
        .map(|i| Candidate::new("203.0.113.5", 3000 + i))
        .collect();

    let outcomes = probe_all(&coordinator, candidates, Arc::clone(&probe), pool.clone())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 300);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 300);
    let max = probe.max.load(Ordering::SeqCst);
    assert!(max <= 50, "{max} probes in flight");
    assert!(max > 1);
    assert_eq!(pool.len(), outcomes.iter().filter(|o| o.reachable).count());
    assert_eq!(pool.len(), 150);
}

#[tokio::test]
async fn harvest_skips_failed_geo_batch() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    let config = HarvestConfig::new()
        .with_coordinator(no_stagger(20))
        .with_output(output.clone());
    let harvester = Harvester::new(
        config,
        AlwaysReachable,
        Some(GeoEnricher::new(FlakyGeo::default(), 100)),
    );

    let candidates: Vec<Candidate> = (0..250usize)
        .map(|i| Candidate::new(format!("10.0.{}.{}", i / 100, i % 100), 8080))
        .collect();
    let report = harvester
        .process(candidates, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.usable, 250);
    assert_eq!(report.geolocated, 150);
    let records: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&output.geo_json).unwrap()).unwrap();
    assert_eq!(records.len(), 150);
    assert!(records.iter().all(|r| r["geolocation"]["countryCode"] == "NL"));
}

#[tokio::test]
async fn harvest_without_usable_proxies_writes_no_geo_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    let config = HarvestConfig::new()
        .with_coordinator(no_stagger(4))
        .with_output(output.clone());
    let harvester = Harvester::new(
        config,
        GaugeProbe::default(),
        Some(GeoEnricher::new(FlakyGeo::default(), 100)),
    );

    let candidates = vec![Candidate::new("192.0.2.7", 81), Candidate::new("192.0.2.8", 83)];
    let report = harvester
        .process(candidates, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.usable, 0);
    assert_eq!(std::fs::read_to_string(&output.usable_text).unwrap(), "");
    assert!(!output.geo_json.exists());
}

#[tokio::test]
async fn check_cancellation_stops_after_in_flight_units() {
    const WORKERS: usize = 5;
    const TOTAL: usize = 30;

    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    let cancel = CancellationToken::new();
    let check = CancellingCheck {
        cancel: cancel.clone(),
        cancel_at: WORKERS,
        attempts: Mutex::new(Vec::new()),
    };
    let checker = Checker::new(
        CheckConfig::new()
            .with_coordinator(no_stagger(WORKERS))
            .with_output(output.clone()),
        check,
    );

    let entries = (0..TOTAL)
        .map(|i| ProxyEntry::from_line(format!("192.0.2.{}:8080", i)))
        .collect();
    let err = checker.process(entries, cancel).await.unwrap_err();

    match err {
        Error::Cancelled { finished, total } => {
            assert_eq!(finished, WORKERS);
            assert_eq!(total, TOTAL);
        }
        other => panic!("expected cancellation, got {other}"),
    }

    let attempts = checker_attempts(&checker);
    assert_eq!(attempts.len(), WORKERS);
    assert!(attempts.iter().all(|(_, protocol)| *protocol == Protocol::Http));
    let distinct: HashSet<_> = attempts.iter().map(|(address, _)| address).collect();
    assert_eq!(distinct.len(), WORKERS);
    assert_eq!(std::fs::read_to_string(&output.good_proxies).unwrap(), "");
}

fn checker_attempts(checker: &Checker<CancellingCheck>) -> Vec<(String, Protocol)> {
    checker.classifier().check().attempts.lock().clone()
}

#[tokio::test]
async fn check_end_to_end_writes_good_proxies_and_backup() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    std::fs::write(&output.good_proxies, "203.0.113.1:80|http\n").unwrap();

    let input = dir.path().join("data.txt");
    std::fs::write(
        &input,
        "192.0.2.1:8080\n\
         192.0.2.2:1085\n\
         192.0.2.3:8081\n\
         192.0.2.1:8080\n\
         192.0.2.4:9000|socks5\n\
         192.0.2.5:9002|https\n\
         \n",
    )
    .unwrap();

    let checker = Checker::new(
        CheckConfig::new()
            .with_input(&input)
            .with_coordinator(no_stagger(3))
            .with_output(output.clone()),
        PortCheck,
    );
    let report = checker.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.total, 5);
    assert_eq!(report.functional, 2);
    assert_eq!(report.http, 1);
    assert_eq!(report.socks5, 1);

    let good = std::fs::read_to_string(&output.good_proxies).unwrap();
    let mut lines: Vec<&str> = good.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["192.0.2.1:8080|http", "192.0.2.2:1085|socks5"]);

    assert_eq!(
        std::fs::read_to_string(&output.good_backup).unwrap(),
        "203.0.113.1:80|http\n"
    );
}

fn seed_artifacts(output: &OutputPaths) {
    std::fs::write(&output.usable_text, "1.1.1.1:80\n2.2.2.2:81\n").unwrap();
    std::fs::write(&output.usable_json, "[]").unwrap();
}

fn assert_seeded(output: &OutputPaths) {
    assert_eq!(
        std::fs::read_to_string(&output.usable_text).unwrap(),
        "1.1.1.1:80\n2.2.2.2:81\n"
    );
    assert_eq!(std::fs::read_to_string(&output.usable_json).unwrap(), "[]");
}

fn harvest_candidates(n: u16) -> Vec<Candidate> {
    (0..n).map(|i| Candidate::new("198.51.100.1", 4000 + i)).collect()
}

#[tokio::test]
async fn harvest_cancellation_keeps_probed_and_skips_geo() {
    const WORKERS: usize = 4;
    const TOTAL: u16 = 40;

    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    seed_artifacts(&output);

    let cancel = CancellationToken::new();
    let harvester = Harvester::new(
        HarvestConfig::new()
            .with_coordinator(no_stagger(WORKERS))
            .with_output(output.clone()),
        CancellingProbe::new(&cancel, WORKERS, true),
        Some(GeoEnricher::new(CountingGeo::default(), 100)),
    );

    let err = harvester
        .process(harvest_candidates(TOTAL), cancel)
        .await
        .unwrap_err();

    match err {
        Error::Cancelled { finished, total } => {
            assert_eq!(finished, WORKERS);
            assert_eq!(total, TOTAL as usize);
        }
        other => panic!("expected cancellation, got {other}"),
    }
    assert_eq!(harvester_probes(&harvester), WORKERS);
    assert_eq!(harvester_geo_calls(&harvester), 0);
    assert!(!output.geo_json.exists());

    let text = std::fs::read_to_string(&output.usable_text).unwrap();
    assert_eq!(text.lines().count(), WORKERS);
    assert!(text.lines().all(|line| line.starts_with("198.51.100.1:")));
}

#[tokio::test]
async fn harvest_cancelled_without_usable_proxies_leaves_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    seed_artifacts(&output);

    let cancel = CancellationToken::new();
    let harvester = Harvester::new(
        HarvestConfig::new()
            .with_coordinator(no_stagger(2))
            .with_geo(None)
            .with_output(output.clone()),
        CancellingProbe::new(&cancel, 2, false),
        None::<GeoEnricher<CountingGeo>>,
    );

    let err = harvester
        .process(harvest_candidates(10), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled { finished: 2, total: 10 }));
    assert_seeded(&output);
}

#[tokio::test]
async fn harvest_cancelled_before_probing_leaves_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    seed_artifacts(&output);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let harvester = Harvester::new(
        HarvestConfig::new()
            .with_coordinator(no_stagger(8))
            .with_output(output.clone()),
        CancellingProbe::new(&cancel, usize::MAX, true),
        Some(GeoEnricher::new(CountingGeo::default(), 100)),
    );

    let err = harvester
        .process(vec![Candidate::new("3.3.3.3", 80)], cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled { finished: 0, total: 1 }));
    assert_eq!(harvester_probes(&harvester), 0);
    assert_eq!(harvester_geo_calls(&harvester), 0);
    assert_seeded(&output);
}

#[tokio::test]
async fn harvest_interrupted_during_crawl_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputPaths::in_dir(dir.path());
    seed_artifacts(&output);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let harvester = Harvester::new(
        HarvestConfig::new()
            .with_geo(None)
            .with_output(output.clone()),
        CancellingProbe::new(&cancel, usize::MAX, true),
        None::<GeoEnricher<CountingGeo>>,
    );
    let sources = vec![SourceDefinition::new(
        "unreachable",
        "http://127.0.0.1:9/list.txt",
        ParserConfig::Text,
    )];

    let err = harvester.run(&sources, cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(!output.source_report.exists());
    assert_eq!(harvester_probes(&harvester), 0);
    assert_seeded(&output);
}

fn harvester_probes(harvester: &Harvester<CancellingProbe, CountingGeo>) -> usize {
    harvester.prober().started.load(Ordering::SeqCst)
}

fn harvester_geo_calls(harvester: &Harvester<CancellingProbe, CountingGeo>) -> usize {
    harvester
        .geo()
        .map_or(0, |geo| geo.lookup().calls.load(Ordering::SeqCst))
}
