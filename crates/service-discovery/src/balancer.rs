//! Weighted address picker fed by a resolver

use crate::address_set::AddressUpdater;
use crate::models::AddressEntry;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Smooth weighted round-robin over the latest address snapshot
///
/// With load balancing disabled every pick returns the first address of the
/// snapshot.
pub struct WeightedBalancer {
    load_balance: bool,
    state: Mutex<BalancerState>,
}

#[derive(Default)]
struct BalancerState {
    entries: Vec<AddressEntry>,
    current: Vec<i64>,
}

impl WeightedBalancer {
    /// Create a balancer with no addresses
    pub fn new(load_balance: bool) -> Self {
        Self {
            load_balance,
            state: Mutex::new(BalancerState::default()),
        }
    }

    /// Choose the next address, or `None` when no address is live
    pub fn pick(&self) -> Option<AddressEntry> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.is_empty() {
            return None;
        }
        if !self.load_balance {
            return state.entries.first().cloned();
        }

        let BalancerState { entries, current } = &mut *state;
        let mut total = 0i64;
        let mut best = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            let weight = i64::from(entry.weight.max(1));
            current[i] += weight;
            total += weight;
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        Some(entries[best].clone())
    }

    /// Addresses currently known
    pub fn addresses(&self) -> Vec<AddressEntry> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }
}

impl AddressUpdater for WeightedBalancer {
    fn update_addresses(&self, addresses: Arc<[AddressEntry]>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Balancer updated to {} addresses", addresses.len());
        state.current = vec![0; addresses.len()];
        state.entries = addresses.to_vec();
    }
}
