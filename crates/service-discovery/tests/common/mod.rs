//! Common test utilities for service discovery integration tests

#![allow(dead_code)]

use service_discovery::{
    AddressEntry, AddressUpdater, BackoffConfig, RegistrarOptions, ResolverOptions,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Test timeout for async operations
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint list accepted by the in-memory cluster
pub fn endpoints() -> Vec<String> {
    vec!["memory://local".to_string()]
}

/// Registrar options with short intervals
pub fn fast_registrar() -> RegistrarOptions {
    RegistrarOptions {
        request_timeout: Duration::from_secs(1),
        check_interval: Duration::from_millis(20),
        backoff: BackoffConfig {
            initial_ms: 20,
            max_ms: 200,
            multiplier: 2.0,
            jitter: 0.1,
        },
    }
}

/// Resolver options with the given resync interval
pub fn resolver_options(resync_interval: Duration) -> ResolverOptions {
    ResolverOptions {
        request_timeout: Duration::from_secs(1),
        resync_interval,
    }
}

/// Records every address list pushed to it
#[derive(Default)]
pub struct RecordingUpdater {
    updates: Mutex<Vec<Vec<AddressEntry>>>,
}

impl RecordingUpdater {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Vec<AddressEntry>> {
        self.updates.lock().unwrap().last().cloned()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.last()
            .unwrap_or_default()
            .into_iter()
            .map(|entry| entry.address)
            .collect()
    }
}

impl AddressUpdater for RecordingUpdater {
    fn update_addresses(&self, addresses: Arc<[AddressEntry]>) {
        self.updates.lock().unwrap().push(addresses.to_vec());
    }
}

/// Poll `check` until it holds or [`TEST_TIMEOUT`] passes
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(20)).await;
    }
    false
}
