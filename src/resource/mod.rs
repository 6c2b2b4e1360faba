//! Connection lifecycle and deferred disposal
//!
//! A connection coroutine must never tear down the state it is running on.
//! Removal is therefore two-phase:
//!
//! ```text
//!   Active ──remove()──► PendingRemoval ──queued──► PendingDestroy ──reclaimer──► Destroyed
//!            (unlinked,                  (sent to the
//!             not findable)               reclamation coroutine)
//! ```
//!
//! `remove` unlinks synchronously, so once it returns no other component can
//! look the resource up. The final drop happens on the reclamation
//! coroutine started with [`ResourceManager::start`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::coroutine::scheduler::interrupted;
use crate::coroutine::{Coroutine, Runnable, Scheduler};
use crate::error::{Error, Result};

/// Something the manager owns and eventually disposes
pub trait Resource: Send + Sync + 'static {
    /// Unique id within one manager
    fn id(&self) -> u64;

    /// Human-readable description for logs
    fn desc(&self) -> String;
}

/// Lifecycle state of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Linked and findable
    Active,
    /// Unlinked, disposing handlers running
    PendingRemoval,
    /// Queued for the reclamation coroutine
    PendingDestroy,
    /// Dropped, or never known
    Destroyed,
}

/// Observer of resource disposal
pub trait DisposingHandler<R>: Send + Sync {
    /// Called inside `remove`, right after the resource is unlinked
    fn on_before_dispose(&self, resource: &R);

    /// Called on the reclamation coroutine just before the drop
    fn on_disposing(&self, resource: &R);
}

struct Tables<R> {
    active: HashMap<u64, Arc<R>>,
    zombies: HashMap<u64, ResourceState>,
}

/// Owns live resources and disposes removed ones off their own coroutine
pub struct ResourceManager<R: Resource> {
    label: String,
    tables: Mutex<Tables<R>>,
    handlers: Mutex<Vec<Arc<dyn DisposingHandler<R>>>>,
    tx: mpsc::UnboundedSender<Arc<R>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<R>>>>,
}

impl<R: Resource> ResourceManager<R> {
    /// Create a manager; call [`start`](Self::start) to begin reclaiming
    pub fn new(label: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            label: label.into(),
            tables: Mutex::new(Tables {
                active: HashMap::new(),
                zombies: HashMap::new(),
            }),
            handlers: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Spawn the reclamation coroutine
    ///
    /// Interrupting it disposes everything already queued, then exits.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) -> Result<Coroutine<()>> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState(format!("{} reclaimer already started", self.label)))?;

        scheduler.start(
            format!("{}-reclaim", self.label),
            Reclaimer {
                manager: Arc::clone(self),
                rx,
            },
        )
    }

    /// Link a resource
    ///
    /// Fails with [`Error::InvalidState`] if the id is live or still being
    /// disposed.
    pub fn add(&self, resource: Arc<R>) -> Result<()> {
        let id = resource.id();
        let mut tables = self.tables.lock();

        if tables.active.contains_key(&id) || tables.zombies.contains_key(&id) {
            return Err(Error::InvalidState(format!(
                "{} resource {} already managed",
                self.label, id
            )));
        }

        tables.active.insert(id, resource);
        Ok(())
    }

    /// Look up a linked resource
    pub fn find_by_id(&self, id: u64) -> Option<Arc<R>> {
        self.tables.lock().active.get(&id).cloned()
    }

    /// Unlink a resource and queue it for disposal
    ///
    /// Idempotent: returns false if the id is not linked.
    pub fn remove(&self, id: u64) -> bool {
        let resource = {
            let mut tables = self.tables.lock();
            let Some(resource) = tables.active.remove(&id) else {
                return false;
            };
            tables.zombies.insert(id, ResourceState::PendingRemoval);
            resource
        };

        let handlers = self.handlers.lock().clone();
        for handler in &handlers {
            handler.on_before_dispose(&resource);
        }

        let desc = resource.desc();
        self.tables.lock().zombies.insert(id, ResourceState::PendingDestroy);

        if let Err(mpsc::error::SendError(resource)) = self.tx.send(resource) {
            // Reclaimer gone; the caller may be the resource's own coroutine
            tracing::error!(manager = %self.label, id = id, "Reclaimer stopped, disposing inline");
            self.dispose(resource);
        } else {
            tracing::debug!(manager = %self.label, id = id, resource = %desc, "Resource removed");
        }

        true
    }

    fn dispose(&self, resource: Arc<R>) {
        let handlers = self.handlers.lock().clone();
        for handler in &handlers {
            handler.on_disposing(&resource);
        }

        let id = resource.id();
        let desc = resource.desc();
        drop(resource);

        self.tables.lock().zombies.remove(&id);
        tracing::debug!(manager = %self.label, id = id, resource = %desc, "Resource disposed");
    }

    /// Lifecycle state of an id; unknown ids report `Destroyed`
    pub fn state(&self, id: u64) -> ResourceState {
        let tables = self.tables.lock();

        if tables.active.contains_key(&id) {
            return ResourceState::Active;
        }
        tables
            .zombies
            .get(&id)
            .copied()
            .unwrap_or(ResourceState::Destroyed)
    }

    /// Snapshot of every linked resource
    pub fn resources(&self) -> Vec<Arc<R>> {
        self.tables.lock().active.values().cloned().collect()
    }

    /// Number of linked resources
    pub fn len(&self) -> usize {
        self.tables.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of removed resources not yet disposed
    pub fn pending(&self) -> usize {
        self.tables.lock().zombies.len()
    }

    /// Register a disposal observer
    pub fn subscribe(&self, handler: Arc<dyn DisposingHandler<R>>) {
        self.handlers.lock().push(handler);
    }

    /// Deregister a disposal observer
    pub fn unsubscribe(&self, handler: &Arc<dyn DisposingHandler<R>>) {
        self.handlers.lock().retain(|h| !Arc::ptr_eq(h, handler));
    }
}

impl<R: Resource> std::fmt::Debug for ResourceManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("label", &self.label)
            .field("active", &self.len())
            .field("pending", &self.pending())
            .finish()
    }
}

struct Reclaimer<R: Resource> {
    manager: Arc<ResourceManager<R>>,
    rx: mpsc::UnboundedReceiver<Arc<R>>,
}

impl<R: Resource> Runnable for Reclaimer<R> {
    type Output = ();

    async fn cycle(mut self) -> Result<()> {
        tracing::debug!(manager = %self.manager.label, "Reclaimer started");

        loop {
            let next = tokio::select! {
                next = self.rx.recv() => next,
                _ = interrupted() => break,
            };

            match next {
                Some(resource) => self.manager.dispose(resource),
                None => break,
            }
        }

        while let Ok(resource) = self.rx.try_recv() {
            self.manager.dispose(resource);
        }

        tracing::debug!(manager = %self.manager.label, "Reclaimer stopped");
        Ok(())
    }
}
