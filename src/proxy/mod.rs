//! Proxy module for harvesting, probing and classifying proxies
//!
//! This module provides functionality for:
//! - Crawling listing sources for candidate `(ip, port)` pairs
//! - Normalizing and de-duplicating proxy lists
//! - Probing reachability through an IP-echo endpoint
//! - Classifying proxies by protocol with http → socks4 → socks5 fallback
//! - Bounded, cancellable concurrent execution of all of the above
//! - Geolocation enrichment and output artifacts

pub mod agent;
pub mod checker;
pub mod coordinator;
pub mod crawler;
pub mod geo;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod prober;
pub mod sink;

pub use checker::{Classifier, ClassifierConfig, HttpProtocolCheck, ProtocolCheck};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use crawler::{CrawlResult, CrawlerConfig, ParserConfig, ProxyCrawler, SourceDefinition};
pub use geo::{GeoConfig, GeoEnricher, GeoLookup, IpApiClient};
pub use models::{
    Candidate, ClassificationOutcome, GeoRecord, ProbeOutcome, Protocol, ProtocolHint, ProxyEntry,
};
pub use parser::ProxyParser;
pub use pipeline::{CheckConfig, CheckReport, Checker, HarvestConfig, HarvestReport, Harvester};
pub use prober::{Probe, ProberConfig, ReachabilityProber};
pub use sink::{GoodProxySink, OutputPaths, UsablePool};

/// Local TCP fixtures standing in for proxies and listing sites
#[cfg(test)]
pub(crate) mod testutil {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Server answering every request with a fixed status and body.
    /// Also works as a plain HTTP forward proxy for `http://` targets.
    pub async fn serve_http(status: u16, body: &'static str) -> SocketAddr {
        serve_http_counted(status, body).await.0
    }

    pub async fn serve_http_counted(
        status: u16,
        body: &'static str,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let mut read = 0;
                    while let Ok(n) = stream.read(&mut buf[read..]).await {
                        if n == 0 {
                            return;
                        }
                        read += n;
                        if read == buf.len() || request_complete(&buf[..read]) {
                            break;
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let reason = if status == 200 { "OK" } else { "Error" };
                    let response = format!(
                        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        reason,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (addr, hits)
    }

    /// Headers received and, when announced, the whole body
    fn request_complete(data: &[u8]) -> bool {
        let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        data.len() >= end + 4 + length
    }

    /// Server that accepts connections and never answers
    pub async fn silent_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        addr
    }

    /// Address nothing listens on
    pub async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }
}
