//! Proxy Harvest - Proxy Harvester and Protocol Classifier
//!
//! Crawls public proxy listings, probes which candidates are reachable,
//! enriches the usable ones with geolocation data, and classifies proxy
//! lists by protocol against a target site.

pub mod error;
pub mod proxy;

pub use error::{Error, Result};
pub use proxy::*;
