//! Discovery resolver
//!
//! A [`Resolver`] keeps the set of live addresses under one key prefix and
//! pushes the full list to an [`AddressUpdater`] whenever it changes.
//!
//! Watch events patch the set incrementally. A full resync on a fixed
//! interval rebuilds the set from a prefix scan, so anything the watch missed
//! (reconnects, dropped events) is corrected on the next tick.

use crate::{
    address_set::{AddressSet, AddressUpdater},
    backend::{with_timeout, Connector, CoordinationClient, EventKind, WatchEvent, WatchStream},
    config::DiscoveryConfig,
    error::{Error, Result},
    models::{parse_key, AddressEntry, ServiceDescriptor},
};
use futures::channel::oneshot;
use futures::{FutureExt, StreamExt, lock::Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolver tuning
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Deadline for each get/watch request
    pub request_timeout: Duration,
    /// Interval between full resynchronizations
    pub resync_interval: Duration,
}

impl ResolverOptions {
    /// Build options from a loaded configuration
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            request_timeout: config.coordination.request_timeout(),
            resync_interval: Duration::from_secs(config.resolver.resync_interval),
        }
    }
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            resync_interval: Duration::from_secs(60),
        }
    }
}

enum Command {
    Sync(oneshot::Sender<Result<bool>>),
    Snapshot(oneshot::Sender<Arc<[AddressEntry]>>),
}

/// Handle to a running resolver
pub struct Resolver {
    prefix: String,
    commands: async_channel::Sender<Command>,
    close_tx: async_channel::Sender<()>,
    task: Mutex<Option<smol::Task<()>>>,
}

/// State owned by the background task
struct Watcher {
    prefix: String,
    endpoints: Vec<String>,
    dial_timeout: Duration,
    options: ResolverOptions,
    connector: Arc<dyn Connector>,
    client: Option<Arc<dyn CoordinationClient>>,
    watch: Option<WatchStream>,
    set: AddressSet,
    updater: Arc<dyn AddressUpdater>,
}

impl Resolver {
    /// Connect, perform the initial sync and start watching `key_prefix`
    ///
    /// Connection and initial sync failures are returned to the caller.
    pub async fn build(
        key_prefix: impl Into<String>,
        connector: Arc<dyn Connector>,
        endpoints: &[String],
        dial_timeout: Duration,
        options: ResolverOptions,
        updater: Arc<dyn AddressUpdater>,
    ) -> Result<Self> {
        let prefix = key_prefix.into();
        let mut watcher = Watcher {
            prefix: prefix.clone(),
            endpoints: endpoints.to_vec(),
            dial_timeout,
            options: options.clone(),
            connector,
            client: None,
            watch: None,
            set: AddressSet::new(),
            updater,
        };

        // Subscribe before the first scan so nothing between the two is lost
        let started = match watcher.subscribe().await {
            Ok(()) => watcher.sync().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            warn!("Resolver for {} failed to start: {}", prefix, e);
            watcher.disconnect().await;
            return Err(e);
        }
        info!(
            "Resolving {} ({} addresses, resync every {:?})",
            prefix,
            watcher.set.len(),
            options.resync_interval
        );

        let (commands, command_rx) = async_channel::unbounded();
        let (close_tx, close_rx) = async_channel::bounded(1);
        let task = smol::spawn(run(watcher, command_rx, close_rx));

        Ok(Self {
            prefix,
            commands,
            close_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Force a full resync; returns whether the address set changed
    pub async fn sync(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Sync(tx)).await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Current address snapshot
    pub async fn addresses(&self) -> Result<Arc<[AddressEntry]>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Key prefix this resolver watches
    pub fn key_prefix(&self) -> &str {
        &self.prefix
    }

    /// Stop the background task and release the connection
    ///
    /// Safe to call more than once and from any task.
    pub async fn close(&self) {
        self.close_tx.close();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await;
            info!("Stopped resolving {}", self.prefix);
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::State(format!("resolver for {} is closed", self.prefix))
    }
}

impl Watcher {
    async fn client(&mut self) -> Result<Arc<dyn CoordinationClient>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = with_timeout(
            self.dial_timeout,
            self.connector.connect(&self.endpoints, self.dial_timeout),
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
        Ok(client)
    }

    /// Open the watch stream, connecting first if needed
    async fn subscribe(&mut self) -> Result<()> {
        let client = self.client().await?;
        let watch = with_timeout(self.options.request_timeout, client.watch(&self.prefix)).await?;
        self.watch = Some(watch);
        debug!("Watching {}", self.prefix);
        Ok(())
    }

    /// Rebuild the address set from a prefix scan
    async fn sync(&mut self) -> Result<bool> {
        let client = self.client().await?;
        let records = with_timeout(self.options.request_timeout, client.get(&self.prefix)).await?;

        let mut entries = BTreeMap::new();
        for record in records {
            if let Some(descriptor) = decode_record(&record.key, &record.value) {
                entries.insert(descriptor.identity(), descriptor.to_entry());
            }
        }

        let changed = self.set.replace(entries);
        if changed {
            debug!("Sync of {} changed the set to {} addresses", self.prefix, self.set.len());
            self.notify();
        }
        Ok(changed)
    }

    /// Re-subscribe if the watch is gone, then sync
    async fn resync(&mut self) -> Result<bool> {
        let result = async {
            if self.watch.is_none() {
                self.subscribe().await?;
            }
            self.sync().await
        }
        .await;

        if let Err(e) = &result {
            if e.is_connection() {
                self.disconnect().await;
            }
        }
        result
    }

    fn apply(&mut self, event: WatchEvent) {
        let changed = match event.kind {
            EventKind::Put => match decode_record(&event.key, &event.value) {
                Some(descriptor) => self.set.insert(descriptor.identity(), descriptor.to_entry()),
                None => false,
            },
            EventKind::Delete => match parse_key(&event.key) {
                Ok(parts) => self.set.remove(&parts.identity()),
                Err(e) => {
                    warn!("Skipping delete for {}: {}", event.key, e);
                    false
                }
            },
        };

        if changed {
            debug!("{:?} {} -> {} addresses", event.kind, event.key, self.set.len());
            self.notify();
        }
    }

    fn notify(&self) {
        self.updater.update_addresses(self.set.snapshot());
    }

    async fn disconnect(&mut self) {
        self.watch = None;
        if let Some(client) = self.client.take() {
            client.close().await;
        }
    }
}

/// Decode a stored record, skipping it when it does not describe the
/// instance its key names
fn decode_record(key: &str, value: &[u8]) -> Option<ServiceDescriptor> {
    match ServiceDescriptor::decode(value) {
        Ok(descriptor) if descriptor.key() == key => Some(descriptor),
        Ok(descriptor) => {
            warn!("Skipping record {}: value describes {}", key, descriptor.key());
            None
        }
        Err(e) => {
            warn!("Skipping record {}: {}", key, e);
            None
        }
    }
}

enum Wake {
    Close,
    Command(Command),
    Event(WatchEvent),
    WatchClosed,
    Resync,
}

async fn next_event(watch: &mut Option<WatchStream>) -> Option<WatchEvent> {
    match watch {
        Some(stream) => stream.recv().await.ok(),
        None => futures::future::pending().await,
    }
}

/// Watch and resync loop: the sole owner of the address set
async fn run(
    mut watcher: Watcher,
    commands: async_channel::Receiver<Command>,
    close_rx: async_channel::Receiver<()>,
) {
    let mut ticker = smol::Timer::interval(watcher.options.resync_interval);

    loop {
        let wake = futures::select! {
            _ = close_rx.recv().fuse() => Wake::Close,
            command = commands.recv().fuse() => match command {
                Ok(command) => Wake::Command(command),
                Err(_) => Wake::Close,
            },
            event = next_event(&mut watcher.watch).fuse() => match event {
                Some(event) => Wake::Event(event),
                None => Wake::WatchClosed,
            },
            _ = ticker.next().fuse() => Wake::Resync,
        };

        match wake {
            Wake::Close => break,
            Wake::Command(Command::Sync(reply)) => {
                let _ = reply.send(watcher.resync().await);
            }
            Wake::Command(Command::Snapshot(reply)) => {
                let _ = reply.send(watcher.set.snapshot());
            }
            Wake::Event(event) => watcher.apply(event),
            Wake::WatchClosed => {
                warn!("Watch on {} closed, reconnecting", watcher.prefix);
                watcher.disconnect().await;
                if let Err(e) = watcher.resync().await {
                    warn!("Re-subscribing to {} failed, retrying at next resync: {}", watcher.prefix, e);
                }
            }
            Wake::Resync => {
                if let Err(e) = watcher.resync().await {
                    warn!("Periodic sync of {} failed: {}", watcher.prefix, e);
                }
            }
        }
    }

    watcher.disconnect().await;
    debug!("Resolver loop for {} stopped", watcher.prefix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCoordinator;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        updates: StdMutex<Vec<Vec<AddressEntry>>>,
    }

    impl AddressUpdater for Recorder {
        fn update_addresses(&self, addresses: Arc<[AddressEntry]>) {
            self.updates.lock().unwrap().push(addresses.to_vec());
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.updates.lock().unwrap().len()
        }

        fn last(&self) -> Option<Vec<AddressEntry>> {
            self.updates.lock().unwrap().last().cloned()
        }
    }

    fn endpoints() -> Vec<String> {
        vec!["memory://local".to_string()]
    }

    fn options() -> ResolverOptions {
        ResolverOptions {
            request_timeout: Duration::from_secs(1),
            resync_interval: Duration::from_secs(60),
        }
    }

    async fn seed(cluster: &MemoryCoordinator, descriptor: &ServiceDescriptor) -> Arc<dyn CoordinationClient> {
        let client = cluster
            .connector()
            .connect(&endpoints(), Duration::from_secs(1))
            .await
            .unwrap();
        client
            .put(&descriptor.key(), descriptor.encode().unwrap(), None)
            .await
            .unwrap();
        client
    }

    async fn build(cluster: &MemoryCoordinator, prefix: &str, recorder: Arc<Recorder>) -> Resolver {
        Resolver::build(
            prefix,
            Arc::new(cluster.connector()),
            &endpoints(),
            Duration::from_secs(1),
            options(),
            recorder,
        )
        .await
        .unwrap()
    }

    async fn settle() {
        smol::Timer::after(Duration::from_millis(50)).await;
    }

    #[smol_potat::test]
    async fn test_initial_sync_of_empty_prefix_does_not_notify() {
        let cluster = MemoryCoordinator::new();
        let recorder = Arc::new(Recorder::default());
        let resolver = build(&cluster, "/user/v1", recorder.clone()).await;

        assert!(resolver.addresses().await.unwrap().is_empty());
        assert!(!resolver.sync().await.unwrap());
        assert_eq!(recorder.count(), 0);

        resolver.close().await;
    }

    #[smol_potat::test]
    async fn test_put_for_present_address_is_silent() {
        let cluster = MemoryCoordinator::new();
        let descriptor = ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1");
        let client = seed(&cluster, &descriptor).await;

        let recorder = Arc::new(Recorder::default());
        let resolver = build(&cluster, "/user/v1", recorder.clone()).await;
        assert_eq!(recorder.count(), 1);

        client
            .put(&descriptor.key(), descriptor.encode().unwrap(), None)
            .await
            .unwrap();
        settle().await;
        assert_eq!(recorder.count(), 1);

        resolver.close().await;
    }

    #[smol_potat::test]
    async fn test_delete_for_absent_address_is_silent() {
        let cluster = MemoryCoordinator::new();
        let descriptor = ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1");
        let client = seed(&cluster, &descriptor).await;

        let recorder = Arc::new(Recorder::default());
        let resolver = build(&cluster, "/user/v1", recorder.clone()).await;

        // Stored outside the set: the delete concerns an identity the resolver never had
        client.put("/user/v1/10.0.0.9:9000", b"garbage".to_vec(), None).await.unwrap();
        client.delete("/user/v1/10.0.0.9:9000").await.unwrap();
        settle().await;

        assert_eq!(recorder.count(), 1);
        assert_eq!(resolver.addresses().await.unwrap().len(), 1);

        resolver.close().await;
    }

    #[smol_potat::test]
    async fn test_undecodable_records_are_skipped() {
        let cluster = MemoryCoordinator::new();
        let good = ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1");
        let client = seed(&cluster, &good).await;
        client.put("/user/v1/bad", b"{not json".to_vec(), None).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let resolver = build(&cluster, "/user/v1", recorder.clone()).await;

        let addresses = resolver.addresses().await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].address, "10.0.0.1:9000");

        resolver.close().await;
    }

    #[smol_potat::test]
    async fn test_records_disagreeing_with_their_key_are_skipped() {
        let cluster = MemoryCoordinator::new();
        let good = ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1");
        let client = seed(&cluster, &good).await;
        let v2 = ServiceDescriptor::new("user", "10.0.0.2:9000", 10, 10).with_version("v2");
        client
            .put("/user/v1/10.0.0.2:9000", v2.encode().unwrap(), None)
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let resolver = build(&cluster, "/user/v1", recorder.clone()).await;
        assert_eq!(resolver.addresses().await.unwrap().to_vec(), vec![good.to_entry()]);

        // Same mismatch arriving through the watch
        client
            .put("/user/v1/10.0.0.3:9000", v2.encode().unwrap(), None)
            .await
            .unwrap();
        settle().await;
        assert_eq!(resolver.addresses().await.unwrap().to_vec(), vec![good.to_entry()]);
        assert_eq!(recorder.count(), 1);

        resolver.close().await;
    }

    #[smol_potat::test]
    async fn test_watch_events_patch_the_set() {
        let cluster = MemoryCoordinator::new();
        let recorder = Arc::new(Recorder::default());
        let resolver = build(&cluster, "/user/v1", recorder.clone()).await;

        let a = ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1");
        let client = seed(&cluster, &a).await;
        settle().await;
        assert_eq!(recorder.last().unwrap(), vec![a.to_entry()]);

        client.delete(&a.key()).await.unwrap();
        settle().await;
        assert_eq!(recorder.count(), 2);
        assert!(recorder.last().unwrap().is_empty());

        resolver.close().await;
    }

    #[smol_potat::test]
    async fn test_manual_sync_picks_up_missed_changes() {
        let cluster = MemoryCoordinator::new();
        let recorder = Arc::new(Recorder::default());
        let resolver = build(&cluster, "/user/v1", recorder.clone()).await;

        cluster.set_watch_muted(true).await;
        let a = ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1");
        let _client = seed(&cluster, &a).await;
        settle().await;
        assert_eq!(recorder.count(), 0);

        assert!(resolver.sync().await.unwrap());
        assert_eq!(recorder.last().unwrap(), vec![a.to_entry()]);
        assert!(!resolver.sync().await.unwrap());

        resolver.close().await;
    }

    #[smol_potat::test]
    async fn test_build_fails_when_unreachable() {
        let cluster = MemoryCoordinator::new();
        cluster.set_reachable(false).await;

        let result = Resolver::build(
            "/user/v1",
            Arc::new(cluster.connector()),
            &endpoints(),
            Duration::from_secs(1),
            options(),
            Arc::new(Recorder::default()),
        )
        .await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[smol_potat::test]
    async fn test_close_is_idempotent_and_releases_session() {
        let cluster = MemoryCoordinator::new();
        let resolver = build(&cluster, "/user/v1", Arc::new(Recorder::default())).await;
        assert_eq!(cluster.session_count().await, 1);

        resolver.close().await;
        resolver.close().await;
        assert_eq!(cluster.session_count().await, 0);
        assert!(matches!(resolver.sync().await, Err(Error::State(_))));
    }

    #[smol_potat::test]
    async fn test_watch_is_reestablished_after_connection_loss() {
        let cluster = MemoryCoordinator::new();
        let connector = cluster.connector();
        let recorder = Arc::new(Recorder::default());
        let resolver = Resolver::build(
            "/user/v1",
            Arc::new(connector.clone()),
            &endpoints(),
            Duration::from_secs(1),
            options(),
            recorder.clone(),
        )
        .await
        .unwrap();

        // The immediate reconnect attempt fails while severed
        connector.sever().await;
        settle().await;
        connector.restore().await;

        // The next explicit sync reconnects and resubscribes
        let a = ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1");
        let _client = seed(&cluster, &a).await;
        resolver.sync().await.unwrap();
        assert_eq!(resolver.addresses().await.unwrap().len(), 1);

        let b = ServiceDescriptor::new("user", "10.0.0.2:9000", 10, 10).with_version("v1");
        let _client = seed(&cluster, &b).await;
        settle().await;
        assert_eq!(recorder.last().unwrap().len(), 2);

        resolver.close().await;
    }
}
