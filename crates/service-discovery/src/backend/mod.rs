//! Coordination service backends
//!
//! The registrar and resolver only talk to the coordination service through
//! the [`Connector`] and [`CoordinationClient`] traits. Any store offering
//! leases, prefix scans and prefix watches can back them; [`memory`] is a
//! complete in-process implementation.

pub mod memory;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Lease identifier handed out by the coordination service
pub type LeaseId = i64;

/// Stream of lease renewal acknowledgements; ends when the lease is lost or
/// the connection drops
pub type KeepAliveStream = async_channel::Receiver<KeepAliveResponse>;

/// Stream of change events under a prefix; ends when the connection drops
pub type WatchStream = async_channel::Receiver<WatchEvent>;

/// Trait for establishing sessions with a coordination service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session against one of `endpoints`
    async fn connect(
        &self,
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> Result<Arc<dyn CoordinationClient>>;
}

/// Operations required from the coordination service
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Grant a lease valid for `ttl` seconds unless renewed
    async fn grant(&self, ttl: u64) -> Result<LeaseId>;

    /// Store `value` under `key`, bound to `lease` when given
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    /// Open a long-lived renewal stream for `lease`
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Expire `lease` immediately, removing every key bound to it
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Remove `key` regardless of lease; returns the number of keys removed
    async fn delete(&self, key: &str) -> Result<u64>;

    /// All current key/value pairs under `prefix`
    async fn get(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Subscribe to change events under `prefix`
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Release the session; open streams end
    async fn close(&self);
}

/// A stored key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Registry key
    pub key: String,
    /// Encoded record
    pub value: Vec<u8>,
}

/// Lease renewal acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    /// Renewed lease
    pub lease: LeaseId,
    /// Remaining time-to-live in seconds
    pub ttl: u64,
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Key created or overwritten
    Put,
    /// Key removed, explicitly or by lease expiry
    Delete,
}

/// Change event under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened
    pub kind: EventKind,
    /// Affected key
    pub key: String,
    /// New value; empty for deletes
    pub value: Vec<u8>,
}

/// Bound a single coordination request by `timeout`
pub async fn with_timeout<T, F>(timeout: Duration, request: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    smol::future::or(request, async move {
        smol::Timer::after(timeout).await;
        Err(Error::Timeout(timeout))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_with_timeout_passes_through_fast_requests() {
        let value = with_timeout(Duration::from_secs(1), async { Ok::<_, Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[smol_potat::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(20), async {
            smol::Timer::after(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
