//! Browser-like User-Agent strings

use rand::seq::IndexedRandom;
use rand::Rng;

const PLATFORMS: &[&str] = &[
    "Windows NT 10.0; Win64; x64",
    "Macintosh; Intel Mac OS X 10_15_7",
    "X11; Linux x86_64",
    "Windows NT 6.1; Win64; x64",
];

/// Random Chrome User-Agent, a fresh one per request
pub fn random_user_agent() -> String {
    let mut rng = rand::rng();
    let platform = PLATFORMS.choose(&mut rng).copied().unwrap_or(PLATFORMS[0]);
    let major = rng.random_range(100..=126);
    let build = rng.random_range(0..10_000);
    let webkit = rng.random_range(0..100);

    format!(
        "Mozilla/5.0 ({platform}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.{build}.0 Safari/537.{webkit}"
    )
}
