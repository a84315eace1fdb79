//! In-memory coordination service
//!
//! A single [`MemoryCoordinator`] plays the role of the whole coordination
//! cluster. Each [`MemoryConnector`] obtained from it opens independent
//! sessions, so tests can fail one participant's connection while the rest
//! keep running.

use super::{
    Connector, CoordinationClient, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue,
    LeaseId, WatchEvent, WatchStream,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::lock::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

type SessionId = u64;
type ConnectorId = u64;

const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(100);
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// In-memory coordination cluster
#[derive(Clone)]
pub struct MemoryCoordinator {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ClusterState>,
    ids: AtomicU64,
}

#[derive(Default)]
struct ClusterState {
    kv: BTreeMap<String, Stored>,
    leases: HashMap<LeaseId, LeaseRecord>,
    watchers: Vec<Watcher>,
    keepalives: Vec<KeepAliveSender>,
    /// Live sessions and the connector that opened them
    sessions: HashMap<SessionId, ConnectorId>,
    severed: HashSet<ConnectorId>,
    unreachable: bool,
    watch_muted: bool,
    last_lease: LeaseId,
}

struct Stored {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct LeaseRecord {
    ttl: u64,
    deadline: Instant,
}

struct Watcher {
    session: SessionId,
    prefix: String,
    tx: async_channel::Sender<WatchEvent>,
}

struct KeepAliveSender {
    session: SessionId,
    lease: LeaseId,
    tx: async_channel::Sender<KeepAliveResponse>,
}

impl ClusterState {
    fn check_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(Error::Connection(format!("session {} is closed", session)))
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease in expired {
            debug!("Lease {} expired", lease);
            self.drop_lease(lease);
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }

        let bound: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, stored)| stored.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        for key in bound {
            self.kv.remove(&key);
            self.emit(WatchEvent {
                kind: EventKind::Delete,
                key,
                value: Vec::new(),
            });
        }

        self.keepalives.retain(|keepalive| {
            if keepalive.lease == lease {
                keepalive.tx.close();
                false
            } else {
                true
            }
        });
        true
    }

    fn drop_session(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        self.watchers.retain(|watcher| watcher.session != session);
        self.keepalives.retain(|keepalive| {
            if keepalive.session == session {
                keepalive.tx.close();
                false
            } else {
                true
            }
        });
    }

    fn emit(&mut self, event: WatchEvent) {
        if self.watch_muted {
            debug!("Dropping {:?} event for {} (watch muted)", event.kind, event.key);
            return;
        }
        self.watchers.retain(|watcher| {
            !event.key.starts_with(&watcher.prefix) || watcher.tx.try_send(event.clone()).is_ok()
        });
    }
}

impl MemoryCoordinator {
    /// Create a new in-memory cluster
    pub fn new() -> Self {
        Self::with_reap_interval(DEFAULT_REAP_INTERVAL)
    }

    /// Create a cluster whose expired leases are reaped every `interval`
    pub fn with_reap_interval(interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ClusterState::default()),
            ids: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&shared);
        smol::spawn(async move {
            loop {
                smol::Timer::after(interval).await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.state.lock().await.purge_expired(Instant::now());
            }
        })
        .detach();

        Self { shared }
    }

    /// Create a connector whose sessions can be severed independently
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            shared: self.shared.clone(),
            id: self.shared.ids.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Make the whole cluster reject (or accept again) new connections
    pub async fn set_reachable(&self, reachable: bool) {
        self.shared.state.lock().await.unreachable = !reachable;
    }

    /// Drop every watch event while muted, simulating missed notifications
    pub async fn set_watch_muted(&self, muted: bool) {
        self.shared.state.lock().await.watch_muted = muted;
    }

    /// Current value stored under `key`
    pub async fn value(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.shared.state.lock().await;
        state.purge_expired(Instant::now());
        state.kv.get(key).map(|stored| stored.value.clone())
    }

    /// Keys currently stored under `prefix`
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let mut state = self.shared.state.lock().await;
        state.purge_expired(Instant::now());
        state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Lease the value under `key` is bound to
    pub async fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.shared.state.lock().await;
        state.purge_expired(Instant::now());
        state.kv.get(key).and_then(|stored| stored.lease)
    }

    /// Whether `lease` is still alive
    pub async fn lease_alive(&self, lease: LeaseId) -> bool {
        let mut state = self.shared.state.lock().await;
        state.purge_expired(Instant::now());
        state.leases.contains_key(&lease)
    }

    /// Number of leases currently alive
    pub async fn lease_count(&self) -> usize {
        let mut state = self.shared.state.lock().await;
        state.purge_expired(Instant::now());
        state.leases.len()
    }

    /// Number of open sessions
    pub async fn session_count(&self) -> usize {
        self.shared.state.lock().await.sessions.len()
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens sessions against a [`MemoryCoordinator`]
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
    id: ConnectorId,
}

impl MemoryConnector {
    /// Kill every session opened through this connector and refuse new ones
    /// until [`restore`](Self::restore) is called
    ///
    /// Requests on killed sessions fail with [`Error::Connection`], their
    /// keep-alive and watch streams end, and their leases are no longer
    /// renewed.
    pub async fn sever(&self) {
        let mut state = self.shared.state.lock().await;
        state.severed.insert(self.id);
        let sessions: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, connector)| **connector == self.id)
            .map(|(session, _)| *session)
            .collect();
        for session in sessions {
            state.drop_session(session);
        }
        info!("Severed connector {}", self.id);
    }

    /// Accept new sessions again after [`sever`](Self::sever)
    pub async fn restore(&self) {
        self.shared.state.lock().await.severed.remove(&self.id);
        info!("Restored connector {}", self.id);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoints: &[String],
        _dial_timeout: Duration,
    ) -> Result<Arc<dyn CoordinationClient>> {
        if endpoints.is_empty() {
            return Err(Error::Connection(
                "no coordination endpoints configured".to_string(),
            ));
        }

        let mut state = self.shared.state.lock().await;
        if state.unreachable || state.severed.contains(&self.id) {
            return Err(Error::Connection(format!(
                "coordination service at {} is unreachable",
                endpoints.join(",")
            )));
        }

        let session = self.shared.ids.fetch_add(1, Ordering::Relaxed);
        state.sessions.insert(session, self.id);
        debug!("Opened session {} via connector {}", session, self.id);

        Ok(Arc::new(MemoryClient {
            shared: self.shared.clone(),
            session,
        }))
    }
}

/// One session with a [`MemoryCoordinator`]
pub struct MemoryClient {
    shared: Arc<Shared>,
    session: SessionId,
}

impl MemoryClient {
    async fn state(&self) -> Result<futures::lock::MutexGuard<'_, ClusterState>> {
        let mut state = self.shared.state.lock().await;
        state.purge_expired(Instant::now());
        state.check_session(self.session)?;
        Ok(state)
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn grant(&self, ttl: u64) -> Result<LeaseId> {
        if ttl == 0 {
            return Err(Error::Lease("ttl must be at least 1 second".to_string()));
        }
        let mut state = self.state().await?;
        state.last_lease += 1;
        let lease = state.last_lease;
        state.leases.insert(
            lease,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl),
            },
        );
        debug!("Granted lease {} (ttl {}s)", lease, ttl);
        Ok(lease)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.state().await?;
        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                return Err(Error::Lease(format!("lease {} not found", lease)));
            }
        }
        state.kv.insert(
            key.to_string(),
            Stored {
                value: value.clone(),
                lease,
            },
        );
        state.emit(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut state = self.state().await?;
        let ttl = state
            .leases
            .get(&lease)
            .map(|record| record.ttl)
            .ok_or_else(|| Error::Lease(format!("lease {} not found", lease)))?;

        let (tx, rx) = async_channel::unbounded();
        state.keepalives.push(KeepAliveSender {
            session: self.session,
            lease,
            tx: tx.clone(),
        });
        drop(state);

        spawn_keep_alive(Arc::downgrade(&self.shared), self.session, lease, ttl, tx);
        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state().await?;
        if state.drop_lease(lease) {
            debug!("Revoked lease {}", lease);
            Ok(())
        } else {
            Err(Error::Lease(format!("lease {} not found", lease)))
        }
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut state = self.state().await?;
        if state.kv.remove(key).is_none() {
            return Ok(0);
        }
        state.emit(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
        });
        Ok(1)
    }

    async fn get(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.state().await?;
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KeyValue {
                key: key.clone(),
                value: stored.value.clone(),
            })
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let mut state = self.state().await?;
        let (tx, rx) = async_channel::unbounded();
        state.watchers.push(Watcher {
            session: self.session,
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.shared.state.lock().await.drop_session(self.session);
        debug!("Closed session {}", self.session);
    }
}

fn renew_interval(ttl: u64) -> Duration {
    (Duration::from_secs(ttl) / 3).max(MIN_RENEW_INTERVAL)
}

/// Renew `lease` at a third of its TTL until the lease, the session or the
/// receiving side goes away
fn spawn_keep_alive(
    weak: Weak<Shared>,
    session: SessionId,
    lease: LeaseId,
    ttl: u64,
    tx: async_channel::Sender<KeepAliveResponse>,
) {
    let interval = renew_interval(ttl);
    smol::spawn(async move {
        loop {
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let response = {
                let mut state = shared.state.lock().await;
                let now = Instant::now();
                state.purge_expired(now);
                if state.sessions.contains_key(&session) {
                    state.leases.get_mut(&lease).map(|record| {
                        record.deadline = now + Duration::from_secs(record.ttl);
                        KeepAliveResponse {
                            lease,
                            ttl: record.ttl,
                        }
                    })
                } else {
                    None
                }
            };
            drop(shared);

            let Some(response) = response else {
                break;
            };
            if tx.send(response).await.is_err() {
                break;
            }
            smol::Timer::after(interval).await;
        }
        tx.close();
    })
    .detach();
}
