use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;

use crate::monitor::error::RegistryError;
use crate::monitor::observer::Observer;

/// Non-owning reference to a registered observer.
#[derive(Clone)]
pub struct ObserverSlot {
    id: String,
    observer: Weak<dyn Observer>,
}

impl ObserverSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `None` once the transport dropped the observer.
    pub fn upgrade(&self) -> Option<Arc<dyn Observer>> {
        self.observer.upgrade()
    }
}

impl std::fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSlot").field("id", &self.id).finish()
    }
}

struct RegistryEntry {
    slot: ObserverSlot,
    // Task waiting on the observer's closed signal.
    watcher: Option<JoinHandle<()>>,
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Observers currently subscribed to one hub, in subscription order.
#[derive(Default)]
pub struct ObserverRegistry {
    entries: Vec<RegistryEntry>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer`; a second observer with the same id is rejected.
    pub fn add(&mut self, observer: &Arc<dyn Observer>) -> Result<(), RegistryError> {
        let id = observer.id();

        if self.contains(id) {
            return Err(RegistryError::DuplicateObserver(id.to_string()));
        }

        self.entries.push(RegistryEntry {
            slot: ObserverSlot {
                id: id.to_string(),
                observer: Arc::downgrade(observer),
            },
            watcher: None,
        });

        Ok(())
    }

    /// Ties a closed-signal watcher task to the entry; it is aborted when the
    /// entry goes away.
    pub fn attach_watcher(&mut self, id: &str, watcher: JoinHandle<()>) {
        match self.entries.iter_mut().find(|entry| entry.slot.id == id) {
            Some(entry) => entry.watcher = Some(watcher),
            None => watcher.abort(),
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.slot.id != id);
        self.entries.len() != before
    }

    /// Removes every observer, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.slot.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ObserverSlot> {
        self.entries.iter().map(|entry| entry.slot.clone()).collect()
    }

    /// Visits a snapshot taken before the first call to `f`.
    ///
    /// `f` may add or remove observers through the registry it is handed;
    /// every observer of the snapshot is still visited exactly once.
    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut ObserverRegistry, &ObserverSlot),
    {
        for slot in self.snapshot() {
            f(self, &slot);
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.slot))
            .finish()
    }
}
