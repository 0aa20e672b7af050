use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxy_harvest::{
    proxy::crawler::load_sources, CheckConfig, Checker, ClassifierConfig, CoordinatorConfig,
    CrawlerConfig, GeoConfig, HarvestConfig, Harvester, OutputPaths, ProberConfig, ProxyCrawler,
    ProxyParser, SourceDefinition,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status after an operator interrupt
const INTERRUPTED: u8 = 130;

/// Harvests public proxies and classifies proxy lists by protocol
#[derive(Parser)]
#[command(name = "proxy-harvest")]
#[command(about = "Harvests public proxies and classifies proxy lists by protocol")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl listing sources, probe reachability and write the usable pool
    Harvest {
        /// Number of concurrent probes
        #[arg(short = 'n', long, default_value = "300")]
        threads: usize,
        /// TOML file with [[source]] definitions, built-in sources otherwise
        #[arg(short, long)]
        sources: Option<PathBuf>,
        /// Directory the artifacts are written into
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Skip geolocation enrichment
        #[arg(long)]
        no_geo: bool,
        /// Log this host's public IP when done
        #[arg(long)]
        report_ip: bool,
        /// Endpoint fetched through each candidate
        #[arg(long, default_value = proxy_harvest::proxy::prober::DEFAULT_ECHO_URL)]
        echo_url: String,
        /// Probe timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: u64,
        /// Delay before each probe in milliseconds
        #[arg(long, default_value = "2000")]
        stagger_ms: u64,
    },
    /// Classify a proxy list by protocol against a target site
    Check {
        /// Proxy list, one entry per line
        #[arg(default_value = "data.txt")]
        input: PathBuf,
        /// Number of concurrent workers
        #[arg(short = 'n', long, default_value = "100")]
        threads: usize,
        /// URL that must answer 200 through a working proxy
        #[arg(long, default_value = proxy_harvest::proxy::checker::DEFAULT_TARGET_URL)]
        target_url: String,
        /// Directory GoodProxy.txt and its backup live in
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Timeout per attempt in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
        /// Delay before each classification in milliseconds
        #[arg(long, default_value = "2000")]
        stagger_ms: u64,
    },
    /// Normalize and de-duplicate a proxy list
    Parse {
        /// Input file containing proxies
        input: PathBuf,
        /// Output file, stdout otherwise
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the listing sources a harvest would crawl
    Sources {
        /// TOML file with [[source]] definitions
        #[arg(short, long)]
        sources: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve_sources(path: Option<&PathBuf>) -> Result<Vec<SourceDefinition>> {
    match path {
        Some(path) => load_sources(path)
            .with_context(|| format!("Failed to load sources from {}", path.display())),
        None => Ok(ProxyCrawler::default_sources()),
    }
}

/// Cancel the token on Ctrl-C so in-flight work can drain
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Hold on, finishing in-flight work...");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match run(cli.command, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let cancelled = e
                .downcast_ref::<proxy_harvest::Error>()
                .is_some_and(|e| e.is_cancelled());
            if cancelled {
                warn!("{}", e);
                ExitCode::from(INTERRUPTED)
            } else {
                error!("{:#}", e);
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(command: Commands, cancel: CancellationToken) -> Result<()> {
    match command {
        Commands::Harvest {
            threads,
            sources,
            output_dir,
            no_geo,
            report_ip,
            echo_url,
            timeout,
            stagger_ms,
        } => {
            let sources = resolve_sources(sources.as_ref())?;
            std::fs::create_dir_all(&output_dir)
                .with_context(|| format!("Cannot create {}", output_dir.display()))?;

            let config = HarvestConfig::new()
                .with_crawler(CrawlerConfig::new())
                .with_prober(
                    ProberConfig::new()
                        .with_timeout(Duration::from_secs(timeout))
                        .with_echo_url(echo_url),
                )
                .with_coordinator(
                    CoordinatorConfig::new()
                        .with_concurrency(threads)
                        .with_stagger(Duration::from_millis(stagger_ms)),
                )
                .with_geo((!no_geo).then(GeoConfig::new))
                .with_report_ip(report_ip)
                .with_output(OutputPaths::in_dir(&output_dir));

            info!("Harvesting from {} sources with {} workers", sources.len(), threads);
            let harvester = Harvester::from_config(config)?;
            let report = harvester.run(&sources, cancel).await?;

            let failed = report.sources.iter().filter(|s| !s.succeeded).count();
            if failed > 0 {
                warn!("{} of {} sources failed", failed, report.sources.len());
            }
        }
        Commands::Check {
            input,
            threads,
            target_url,
            output_dir,
            timeout,
            stagger_ms,
        } => {
            let config = CheckConfig::new()
                .with_input(input)
                .with_classifier(
                    ClassifierConfig::new()
                        .with_timeout(Duration::from_secs(timeout))
                        .with_target_url(target_url),
                )
                .with_coordinator(
                    CoordinatorConfig::new()
                        .with_concurrency(threads)
                        .with_stagger(Duration::from_millis(stagger_ms)),
                )
                .with_output(OutputPaths::in_dir(&output_dir));

            let checker = Checker::from_config(config);
            let report = checker.run(cancel).await?;
            info!(
                "http: {} | socks4: {} | socks5: {}",
                report.http, report.socks4, report.socks5
            );
        }
        Commands::Parse { input, output } => {
            let entries = ProxyParser::parse_file(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            info!("Parsed {} unique proxies from {}", entries.len(), input.display());

            match output {
                Some(path) => {
                    ProxyParser::save_to_file(&entries, &path)?;
                    info!("Saved parsed proxies to {}", path.display());
                }
                None => {
                    for entry in &entries {
                        println!("{}", entry.line);
                    }
                }
            }
        }
        Commands::Sources { sources } => {
            for source in resolve_sources(sources.as_ref())? {
                println!(
                    "{:<20} {:<6} {:<5} {}",
                    source.id,
                    source.method,
                    source.parser.kind(),
                    source.url
                );
            }
        }
    }

    Ok(())
}
