//! Lease registrar
//!
//! A [`Registrar`] announces one service instance to the coordination
//! service. Registration grants a lease with the descriptor's TTL, binds the
//! encoded descriptor under its registry key, and opens a keep-alive stream.
//! A background task then supervises the registration:
//!
//! - keep-alive acknowledgements only confirm liveness;
//! - a keep-alive stream that ends triggers a full re-registration
//!   (reconnecting first when the session died);
//! - a periodic check retries registration while no keep-alive stream is
//!   active, spacing failed attempts with [`Backoff`].
//!
//! Steady-state failures are logged and retried, never surfaced. If recovery
//! keeps failing the record lapses once its lease expires.

use crate::{
    backend::{with_timeout, Connector, CoordinationClient, KeepAliveStream, LeaseId},
    backoff::Backoff,
    config::{BackoffConfig, DiscoveryConfig},
    error::{Error, Result},
    models::ServiceDescriptor,
};
use futures::{FutureExt, StreamExt, lock::Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Registrar tuning
#[derive(Debug, Clone)]
pub struct RegistrarOptions {
    /// Deadline for each grant/put/revoke/delete request
    pub request_timeout: Duration,
    /// How often the supervising task checks for a missing heartbeat
    pub check_interval: Duration,
    /// Delay schedule between failed recovery attempts
    pub backoff: BackoffConfig,
}

impl RegistrarOptions {
    /// Build options from a loaded configuration
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            request_timeout: config.coordination.request_timeout(),
            check_interval: Duration::from_millis(config.registrar.check_interval_ms),
            backoff: config.registrar.backoff.clone(),
        }
    }
}

impl Default for RegistrarOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            check_interval: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrarState {
    /// No lease held
    Idle,
    /// Lease granted, record not bound yet
    LeaseGranted,
    /// Record bound under the lease
    Bound,
    /// Keep-alive stream running
    HeartbeatActive,
    /// Teardown in progress
    Closing,
    /// Record removed and connection released
    Closed,
}

impl RegistrarState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::LeaseGranted,
            2 => Self::Bound,
            3 => Self::HeartbeatActive,
            4 => Self::Closing,
            5 => Self::Closed,
            _ => Self::Idle,
        }
    }
}

#[derive(Clone, Default)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn set(&self, state: RegistrarState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> RegistrarState {
        RegistrarState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Announces one service instance under a lease
pub struct Registrar {
    connector: Arc<dyn Connector>,
    options: RegistrarOptions,
    state: StateCell,
    running: Mutex<Slot>,
}

enum Slot {
    Unregistered,
    Running(Running),
    Closed,
}

struct Running {
    key: String,
    close_tx: async_channel::Sender<()>,
    task: smol::Task<Session>,
}

/// Everything the supervising task owns
struct Session {
    descriptor: ServiceDescriptor,
    key: String,
    value: Vec<u8>,
    endpoints: Vec<String>,
    dial_timeout: Duration,
    client: Option<Arc<dyn CoordinationClient>>,
    lease: Option<LeaseId>,
    keepalive: Option<KeepAliveStream>,
}

impl Registrar {
    /// Create a registrar that connects through `connector`
    pub fn new(connector: Arc<dyn Connector>, options: RegistrarOptions) -> Self {
        Self {
            connector,
            options,
            state: StateCell::default(),
            running: Mutex::new(Slot::Unregistered),
        }
    }

    /// Register `descriptor` and start supervising the registration
    ///
    /// Connection, initial grant and initial bind failures are returned to
    /// the caller. Calling this on a registrar that was already registered
    /// fails with [`Error::State`].
    pub async fn register(
        &self,
        descriptor: ServiceDescriptor,
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> Result<()> {
        let mut slot = self.running.lock().await;
        match &*slot {
            Slot::Unregistered => {}
            Slot::Running(running) => {
                return Err(Error::State(format!("{} is already registered", running.key)));
            }
            Slot::Closed => {
                return Err(Error::State("registrar has been closed".to_string()));
            }
        }

        descriptor.validate()?;
        let key = descriptor.key();
        let value = descriptor.encode()?;
        info!("Registering {} (ttl {}s)", key, descriptor.ttl);

        let mut session = Session {
            descriptor,
            key: key.clone(),
            value,
            endpoints: endpoints.to_vec(),
            dial_timeout,
            client: None,
            lease: None,
            keepalive: None,
        };

        if let Err(e) = session.establish(&self.connector, &self.options, &self.state).await {
            warn!("Registration of {} failed: {}", key, e);
            session.release().await;
            self.state.set(RegistrarState::Idle);
            return Err(e);
        }

        let (close_tx, close_rx) = async_channel::bounded(1);
        let task = smol::spawn(supervise(
            session,
            self.connector.clone(),
            self.options.clone(),
            self.state.clone(),
            close_rx,
        ));

        *slot = Slot::Running(Running {
            key,
            close_tx,
            task,
        });
        Ok(())
    }

    /// Stop supervising, delete the record, revoke the lease and release the
    /// connection
    ///
    /// Safe to call more than once and from any task.
    pub async fn close(&self) -> Result<()> {
        let running = {
            let mut slot = self.running.lock().await;
            match std::mem::replace(&mut *slot, Slot::Closed) {
                Slot::Running(running) => running,
                Slot::Unregistered => {
                    self.state.set(RegistrarState::Closed);
                    return Ok(());
                }
                Slot::Closed => return Ok(()),
            }
        };

        self.state.set(RegistrarState::Closing);
        running.close_tx.close();
        let mut session = running.task.await;

        let result = session.teardown(self.options.request_timeout).await;
        self.state.set(RegistrarState::Closed);
        info!("Unregistered {}", running.key);
        result
    }

    /// Current lifecycle state
    pub fn state(&self) -> RegistrarState {
        self.state.get()
    }
}

impl Session {
    /// Connect if needed, then grant, bind and start the heartbeat
    async fn establish(
        &mut self,
        connector: &Arc<dyn Connector>,
        options: &RegistrarOptions,
        state: &StateCell,
    ) -> Result<()> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let client = with_timeout(
                    self.dial_timeout,
                    connector.connect(&self.endpoints, self.dial_timeout),
                )
                .await
                .map_err(|e| match e {
                    Error::Timeout(after) => Error::Connection(format!(
                        "dial to {} timed out after {:?}",
                        self.endpoints.join(","),
                        after
                    )),
                    other => other,
                })?;
                self.client = Some(client.clone());
                client
            }
        };

        let timeout = options.request_timeout;
        let lease = with_timeout(timeout, client.grant(self.descriptor.ttl))
            .await
            .map_err(|e| Error::lease("grant", e))?;
        state.set(RegistrarState::LeaseGranted);
        debug!("Granted lease {} for {}", lease, self.key);

        if let Err(e) = with_timeout(timeout, client.put(&self.key, self.value.clone(), Some(lease))).await {
            revoke_quietly(&client, lease, timeout, "unbound").await;
            return Err(Error::lease("bind", e));
        }
        state.set(RegistrarState::Bound);

        let keepalive = match with_timeout(timeout, client.keep_alive(lease)).await {
            Ok(keepalive) => keepalive,
            Err(e) => {
                revoke_quietly(&client, lease, timeout, "unsupervised").await;
                return Err(Error::lease("keep-alive", e));
            }
        };
        state.set(RegistrarState::HeartbeatActive);

        if let Some(previous) = self.lease.replace(lease) {
            // The key now lives under the new lease; drop the superseded one
            revoke_quietly(&client, previous, timeout, "superseded").await;
        }
        self.keepalive = Some(keepalive);
        Ok(())
    }

    /// Remove the record and lease, then release the connection
    async fn teardown(&mut self, timeout: Duration) -> Result<()> {
        self.keepalive = None;
        let mut result = Ok(());

        if let Some(client) = &self.client {
            if let Err(e) = with_timeout(timeout, client.delete(&self.key)).await {
                warn!("Failed to delete {}: {}", self.key, e);
                result = Err(e);
            }
            if let Some(lease) = self.lease.take() {
                if let Err(e) = with_timeout(timeout, client.revoke(lease)).await {
                    warn!("Failed to revoke lease {}: {}", lease, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        self.release().await;
        result
    }

    async fn release(&mut self) {
        self.keepalive = None;
        if let Some(client) = self.client.take() {
            client.close().await;
        }
    }

    /// Forget the heartbeat; drop the connection as well when it is dead
    async fn heartbeat_lost(&mut self, reconnect: bool) {
        self.keepalive = None;
        if reconnect {
            if let Some(client) = self.client.take() {
                client.close().await;
            }
        }
    }
}

/// Best-effort revoke of a lease nobody depends on any more
async fn revoke_quietly(
    client: &Arc<dyn CoordinationClient>,
    lease: LeaseId,
    timeout: Duration,
    kind: &str,
) {
    if let Err(e) = with_timeout(timeout, client.revoke(lease)).await {
        debug!("Could not revoke {} lease {}: {}", kind, lease, e);
    }
}

enum Wake {
    Close,
    Renewed,
    HeartbeatLost,
    Tick,
}

async fn next_ack(keepalive: &mut Option<KeepAliveStream>) -> Option<()> {
    match keepalive {
        Some(stream) => stream.recv().await.ok().map(|_| ()),
        None => futures::future::pending().await,
    }
}

/// Supervising loop: the sole owner of the session until close
async fn supervise(
    mut session: Session,
    connector: Arc<dyn Connector>,
    options: RegistrarOptions,
    state: StateCell,
    close_rx: async_channel::Receiver<()>,
) -> Session {
    let mut ticker = smol::Timer::interval(options.check_interval);
    let mut backoff = Backoff::new(options.backoff.clone());
    let mut retry_at: Option<Instant> = None;

    loop {
        let wake = futures::select! {
            _ = close_rx.recv().fuse() => Wake::Close,
            ack = next_ack(&mut session.keepalive).fuse() => match ack {
                Some(()) => Wake::Renewed,
                None => Wake::HeartbeatLost,
            },
            _ = ticker.next().fuse() => Wake::Tick,
        };

        let recover = match wake {
            Wake::Close => break,
            Wake::Renewed => {
                debug!("Lease renewed for {}", session.key);
                false
            }
            Wake::HeartbeatLost => {
                warn!("Keep-alive stream for {} closed, re-registering", session.key);
                // A closed stream says nothing about whether the session
                // survived; reconnect to be safe.
                session.heartbeat_lost(true).await;
                state.set(RegistrarState::Idle);
                retry_at = None;
                true
            }
            Wake::Tick => {
                session.keepalive.is_none() && retry_at.is_none_or(|at| Instant::now() >= at)
            }
        };

        if !recover {
            continue;
        }

        match session.establish(&connector, &options, &state).await {
            Ok(()) => {
                info!("Re-registered {}", session.key);
                backoff.reset();
                retry_at = None;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "Re-registration of {} failed (attempt {}): {}; retrying in {:?}",
                    session.key,
                    backoff.attempts(),
                    e,
                    delay
                );
                session.heartbeat_lost(e.is_connection()).await;
                state.set(RegistrarState::Idle);
                retry_at = Some(Instant::now() + delay);
            }
        }
    }

    debug!("Supervisor for {} stopped", session.key);
    session
}
