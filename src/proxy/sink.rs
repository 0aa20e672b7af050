//! Shared accumulators and output artifacts

use crate::proxy::crawler::SourceReport;
use crate::proxy::models::{Candidate, GeoRecord};
use crate::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Usable-proxy JSON artifact
pub const USABLE_JSON: &str = "data.json";
/// Usable-proxy text artifact, also the default check input
pub const USABLE_TEXT: &str = "data.txt";
pub const GEO_JSON: &str = "data-with-geolocation.json";
pub const SOURCE_REPORT: &str = "source-report.json";
pub const GOOD_PROXIES: &str = "GoodProxy.txt";
pub const GOOD_BACKUP: &str = "ProxyBackup.txt";

/// Locations of every artifact a run writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub usable_json: PathBuf,
    pub usable_text: PathBuf,
    pub geo_json: PathBuf,
    pub source_report: PathBuf,
    pub good_proxies: PathBuf,
    pub good_backup: PathBuf,
}

impl OutputPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            usable_json: dir.join(USABLE_JSON),
            usable_text: dir.join(USABLE_TEXT),
            geo_json: dir.join(GEO_JSON),
            source_report: dir.join(SOURCE_REPORT),
            good_proxies: dir.join(GOOD_PROXIES),
            good_backup: dir.join(GOOD_BACKUP),
        }
    }
}

/// Reachable candidates, appended concurrently by probe workers
#[derive(Debug, Clone, Default)]
pub struct UsablePool {
    inner: Arc<Mutex<Vec<Candidate>>>,
}

impl UsablePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, candidate: Candidate) {
        self.inner.lock().push(candidate);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Candidate> {
        self.inner.lock().clone()
    }
}

/// Appending good-proxy output shared by classifier workers
pub struct GoodProxySink {
    path: PathBuf,
    file: Mutex<File>,
    written: AtomicUsize,
}

impl GoodProxySink {
    /// Back up any previous output, then start from an empty file.
    /// A failed backup (e.g. first run) is not an error.
    pub fn create(path: impl Into<PathBuf>, backup: Option<&Path>) -> Result<Self> {
        let path = path.into();

        if let Some(backup) = backup {
            match fs::copy(&path, backup) {
                Ok(_) => info!("{} backed up in {}", path.display(), backup.display()),
                Err(e) => debug!("No backup of {}: {}", path.display(), e),
            }
        }

        File::create(&path)?;
        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            written: AtomicUsize::new(0),
        })
    }

    /// Append one complete line
    pub fn record(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock();
        writeln!(file, "{}", line)?;
        file.flush()?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    fs::write(path, buf)?;
    Ok(())
}

/// `[{ip, port}, ...]`
pub fn write_usable_json(path: &Path, proxies: &[Candidate]) -> Result<()> {
    write_json_pretty(path, proxies)
}

/// One `ip:port` per line
pub fn write_usable_text(path: &Path, proxies: &[Candidate]) -> Result<()> {
    let content: String = proxies.iter().map(|p| format!("{}\n", p)).collect();
    fs::write(path, content)?;
    Ok(())
}

/// Writes nothing for an empty set; returns whether the file was written
pub fn write_geo_json(path: &Path, records: &[GeoRecord]) -> Result<bool> {
    if records.is_empty() {
        return Ok(false);
    }
    write_json_pretty(path, records)?;
    Ok(true)
}

pub fn write_source_report(path: &Path, reports: &[SourceReport]) -> Result<()> {
    write_json_pretty(path, reports)
}
