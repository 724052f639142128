//! Process-wide mapping from instance id to its [`MonitorHub`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::monitor::hub::{HubCommand, HubStatus, MonitorHub};
use crate::monitor::observer::Observer;
use crate::monitor::source::MonitorConnector;

/// State shared between the directory and the hubs it spawned.
pub(crate) struct DirectoryShared {
    hubs: Mutex<HashMap<String, MonitorHub>>,
    pub(crate) connector: Arc<dyn MonitorConnector>,
    pub(crate) config: HubConfig,
    next_generation: AtomicU64,
}

/// Result of a hub asking to be removed from the directory.
pub(crate) enum Release {
    /// A subscribe was already queued; the hub keeps running and must handle
    /// the returned commands first.
    Retained(Vec<HubCommand>),
    /// The entry is gone and the hub's queue is closed. The returned
    /// commands arrived before the close and still need an answer.
    Released(Vec<HubCommand>),
}

impl DirectoryShared {
    /// Removes the entry for `instance_id` if it still belongs to
    /// `generation`.
    ///
    /// Subscribes are only ever sent while the directory lock is held, so
    /// draining `commands` under the same lock decides atomically whether a
    /// new observer raced with the last one leaving. With `force` the hub is
    /// released regardless.
    pub(crate) async fn release_if_empty(
        &self,
        instance_id: &str,
        generation: u64,
        commands: &mut mpsc::UnboundedReceiver<HubCommand>,
        force: bool,
    ) -> Release {
        let mut hubs = self.hubs.lock().await;

        let mut drained = Vec::new();
        while let Ok(command) = commands.try_recv() {
            drained.push(command);
        }

        let subscribe_queued = drained
            .iter()
            .any(|command| matches!(command, HubCommand::Subscribe(_)));

        if subscribe_queued && !force {
            return Release::Retained(drained);
        }

        // Nothing else can reach the queue once it is closed; whatever slipped
        // in before still gets answered by the hub.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            drained.push(command);
        }

        if hubs
            .get(instance_id)
            .is_some_and(|hub| hub.generation() == generation)
        {
            hubs.remove(instance_id);
            debug!(instance_id, generation, "monitor hub removed from directory");
        }

        Release::Released(drained)
    }
}

/// Owns every live hub of the process.
///
/// Created once at startup and handed to whatever layer accepts subscriptions.
/// Hubs are created lazily on the first subscribe for an instance and removed
/// when their last observer leaves or their upstream fails.
#[derive(Clone)]
pub struct HubDirectory {
    shared: Arc<DirectoryShared>,
}

impl HubDirectory {
    pub fn new(connector: Arc<dyn MonitorConnector>, config: HubConfig) -> Self {
        HubDirectory {
            shared: Arc::new(DirectoryShared {
                hubs: Mutex::new(HashMap::new()),
                connector,
                config,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Finds or creates the hub for `instance_id`.
    ///
    /// Takes the locked map so lookup, spawn and the caller's subscribe form
    /// one atomic step; a hub never exists without a subscribe queued for it.
    /// A hub that already shut down but has not left the map yet is replaced.
    fn get_or_create(
        &self,
        hubs: &mut HashMap<String, MonitorHub>,
        instance_id: &str,
    ) -> MonitorHub {
        if let Some(hub) = hubs.get(instance_id) {
            if !hub.is_closed() {
                return hub.clone();
            }
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let hub = MonitorHub::spawn(instance_id, generation, Arc::clone(&self.shared));
        hubs.insert(instance_id.to_string(), hub.clone());

        info!(instance_id, generation, "monitor hub created");

        hub
    }

    /// Registers `observer` with the hub for `instance_id`, creating the hub
    /// and its upstream connection when this is the first observer.
    ///
    /// Returns once the subscribe is queued; the observer receives events
    /// produced from then on.
    pub async fn subscribe(&self, instance_id: &str, observer: Arc<dyn Observer>) {
        let mut hubs = self.shared.hubs.lock().await;
        let mut command = HubCommand::Subscribe(observer);

        loop {
            let hub = self.get_or_create(&mut hubs, instance_id);
            match hub.send(command) {
                Ok(()) => return,
                // Lost the race with a teardown; the next round spawns a
                // fresh hub.
                Err(rejected) => command = rejected,
            }
        }
    }

    /// No-op for unknown instances and unknown observers.
    pub async fn unsubscribe(&self, instance_id: &str, observer_id: &str) {
        if let Some(hub) = self.hub(instance_id).await {
            hub.unsubscribe(observer_id);
        }
    }

    pub async fn current_observer_count(&self, instance_id: &str) -> usize {
        match self.hub(instance_id).await {
            Some(hub) => hub.observer_count().await,
            None => 0,
        }
    }

    /// `None` when no hub exists for `instance_id`.
    pub async fn hub_status(&self, instance_id: &str) -> Option<HubStatus> {
        self.hub(instance_id).await?.status().await
    }

    /// Unsubscribes every observer of `instance_id`, closing its hub.
    pub async fn clear(&self, instance_id: &str) {
        let Some(hub) = self.hub(instance_id).await else {
            return;
        };

        let (ack, done) = oneshot::channel();
        if hub.send(HubCommand::Clear(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Terminates every hub. Each observer receives a final exception event.
    pub async fn shutdown(&self) {
        let hubs: Vec<MonitorHub> = self.shared.hubs.lock().await.values().cloned().collect();

        info!(hubs = hubs.len(), "shutting down monitor hubs");

        let mut pending = Vec::with_capacity(hubs.len());
        for hub in hubs {
            let (ack, done) = oneshot::channel();
            if hub.send(HubCommand::Shutdown(ack)).is_ok() {
                pending.push(done);
            }
        }

        for done in pending {
            let _ = done.await;
        }
    }

    /// Number of live hubs.
    pub async fn hub_count(&self) -> usize {
        self.shared
            .hubs
            .lock()
            .await
            .values()
            .filter(|hub| !hub.is_closed())
            .count()
    }

    async fn hub(&self, instance_id: &str) -> Option<MonitorHub> {
        // Cloned so no hub call ever waits while holding the lock.
        self.shared
            .hubs
            .lock()
            .await
            .get(instance_id)
            .filter(|hub| !hub.is_closed())
            .cloned()
    }
}

impl std::fmt::Debug for HubDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubDirectory")
            .field("config", &self.shared.config)
            .finish()
    }
}
