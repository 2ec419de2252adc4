//! Test utilities & fixtures shared by the integration tests.

use tempfile::TempDir;
use townward::claims::{ClaimStore, ClaimStoreBuilder};
use townward::config::{Config, WorldRules};

/// A store in a fresh temp dir. Keep the `TempDir` alive for the test.
pub fn open_store() -> (TempDir, ClaimStore) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = ClaimStoreBuilder::new(tmp.path().join("claims"))
        .open()
        .expect("open store");
    (tmp, store)
}

/// Default configuration with empty allow-lists and no overlay.
#[allow(dead_code)] // not every test binary needs it
pub fn bare_config() -> Config {
    let mut config = Config::default();
    config.rules = WorldRules::default();
    config
}
