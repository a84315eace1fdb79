//! Resolver-side view of live addresses

use crate::models::{AddressEntry, AddressKey};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Receives the full address list every time it changes
///
/// Each call carries a complete replacement, never a delta. The list may be
/// empty.
pub trait AddressUpdater: Send + Sync {
    /// Replace the consumer's address list
    fn update_addresses(&self, addresses: Arc<[AddressEntry]>);
}

impl<F> AddressUpdater for F
where
    F: Fn(Arc<[AddressEntry]>) + Send + Sync,
{
    fn update_addresses(&self, addresses: Arc<[AddressEntry]>) {
        self(addresses)
    }
}

/// Live addresses keyed by `(name, version, address)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    entries: BTreeMap<AddressKey, AddressEntry>,
}

impl AddressSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set; returns whether anything changed
    pub fn replace(&mut self, entries: BTreeMap<AddressKey, AddressEntry>) -> bool {
        if self.entries == entries {
            return false;
        }
        self.entries = entries;
        true
    }

    /// Add an identity that is not present yet; returns whether it was added
    pub fn insert(&mut self, key: AddressKey, entry: AddressEntry) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, entry);
        true
    }

    /// Remove an identity; returns whether it was present
    pub fn remove(&mut self, key: &AddressKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Number of addresses
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Immutable snapshot ordered by identity
    pub fn snapshot(&self) -> Arc<[AddressEntry]> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceDescriptor;

    fn entry(address: &str, version: &str, weight: u32) -> (AddressKey, AddressEntry) {
        let descriptor = ServiceDescriptor::new("user", address, weight, 10).with_version(version);
        (descriptor.identity(), descriptor.to_entry())
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut set = AddressSet::new();
        let (key, value) = entry("10.0.0.1:9000", "v1", 10);

        assert!(set.insert(key.clone(), value.clone()));
        assert!(!set.insert(key.clone(), value));
        assert_eq!(set.len(), 1);

        assert!(set.remove(&key));
        assert!(!set.remove(&key));
        assert!(set.is_empty());
    }

    #[test]
    fn test_versions_of_same_address_coexist() {
        let mut set = AddressSet::new();
        let (k1, v1) = entry("10.0.0.1:9000", "v1", 10);
        let (k2, v2) = entry("10.0.0.1:9000", "v2", 5);
        assert!(set.insert(k1, v1));
        assert!(set.insert(k2, v2));

        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].version, "v1");
        assert_eq!(snapshot[1].version, "v2");
    }

    #[test]
    fn test_replace_reports_changes() {
        let mut set = AddressSet::new();
        assert!(!set.replace(BTreeMap::new()));

        let full: BTreeMap<_, _> = [entry("a:1", "v1", 1), entry("b:1", "v1", 1)].into_iter().collect();
        assert!(set.replace(full.clone()));
        assert!(!set.replace(full));

        // A weight change is a change
        let reweighted: BTreeMap<_, _> = [entry("a:1", "v1", 7), entry("b:1", "v1", 1)].into_iter().collect();
        assert!(set.replace(reweighted));
        assert_eq!(set.snapshot()[0].weight, 7);

        assert!(set.replace(BTreeMap::new()));
        assert!(set.is_empty());
    }

    #[test]
    fn test_closure_updater() {
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let updater = move |addresses: Arc<[AddressEntry]>| sink.lock().unwrap().push(addresses.len());

        updater.update_addresses(Arc::from(Vec::new()));
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }
}
