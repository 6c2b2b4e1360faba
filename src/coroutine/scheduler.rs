//! Cooperative coroutine scheduler
//!
//! A coroutine is a tokio task wrapped with an identity, a lifecycle state and
//! an interrupt flag. A [`Scheduler`] is either the ambient runtime or a
//! dedicated OS thread driving a `current_thread` runtime, so coroutines on one
//! scheduler never migrate to another thread.
//!
//! Interrupts are advisory. [`Coroutine::interrupt`] only sets a flag and wakes
//! the target; the target observes it at its next suspension point ([`sleep`],
//! [`interruptible`] I/O, condition waits, mutex locks, joins) which return
//! [`Error::Interrupted`]. A coroutine in a tight loop must call [`pull`].
//!
//! ```text
//!   Scheduler ──spawn──► task_local CURRENT = Control { id, state, interrupted }
//!       │                        │
//!       │                        ├── sleep()/wait()/lock() select on interrupt
//!       └── Coroutine<T> ────────┴── interrupt() sets flag + notify_waiters()
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{Error, Result};

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT: Arc<Control>;
}

/// Lifecycle state of a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Spawned, not yet polled
    Init,
    /// Polled at least once
    Running,
    /// Interrupt requested, not yet terminated
    Interrupted,
    /// Future completed, panicked or was dropped
    Terminated,
}

impl CoroutineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CoroutineState::Init,
            1 => CoroutineState::Running,
            2 => CoroutineState::Interrupted,
            _ => CoroutineState::Terminated,
        }
    }
}

/// Per-coroutine control block, shared by the task and its handles
struct Control {
    id: u64,
    name: String,
    state: AtomicU8,
    interrupted: AtomicBool,
    notify: Notify,
}

impl Control {
    fn new(name: String) -> Self {
        Self {
            id: NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            state: AtomicU8::new(CoroutineState::Init as u8),
            interrupted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> CoroutineState {
        CoroutineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            CoroutineState::Init as u8,
            CoroutineState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn mark_terminated(&self) {
        self.state
            .store(CoroutineState::Terminated as u8, Ordering::Release);
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match CoroutineState::from_u8(s) {
                    CoroutineState::Init | CoroutineState::Running => {
                        Some(CoroutineState::Interrupted as u8)
                    }
                    _ => None,
                }
            });
        self.notify.notify_waiters();
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    async fn wait_interrupt(&self) {
        loop {
            // Register before checking the flag so a concurrent interrupt
            // cannot slip between the check and the wait.
            let notified = self.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the live count and marks termination however the task ends
struct Lifetime {
    control: Arc<Control>,
    live: Arc<AtomicUsize>,
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        self.control.mark_terminated();
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduler name, also used as the OS thread name for services
    pub name: String,

    /// Maximum live coroutines (0 = unlimited)
    pub max_coroutines: usize,

    /// Stack size of the dedicated OS thread (services only)
    pub thread_stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            max_coroutines: 0,
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl SchedulerConfig {
    /// Create a config with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the coroutine budget
    pub fn max_coroutines(mut self, max: usize) -> Self {
        self.max_coroutines = max;
        self
    }

    /// Set the OS thread stack size
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }
}

struct ServiceThread {
    shutdown: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
}

struct Inner {
    name: String,
    handle: Handle,
    live: Arc<AtomicUsize>,
    max_coroutines: usize,
    service: Mutex<Option<ServiceThread>>,
}

impl Inner {
    fn stop_service(&self) {
        let Some(service) = self.service.lock().take() else {
            return;
        };

        let _ = service.shutdown.send(());

        // A coroutine of this service dropping the last handle must not join
        // its own thread.
        if service.thread.thread().id() != thread::current().id() {
            if service.thread.join().is_err() {
                tracing::error!(scheduler = %self.name, "Scheduler thread panicked");
            }
        }

        tracing::info!(scheduler = %self.name, "Scheduler stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_service();
    }
}

/// Runs coroutines on one runtime
///
/// Cheap to clone; all clones share the same coroutine budget.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Use the ambient tokio runtime
    pub fn current() -> Result<Self> {
        Self::current_with(SchedulerConfig::default())
    }

    /// Use the ambient tokio runtime with a custom config
    pub fn current_with(config: SchedulerConfig) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::InvalidState(format!("no runtime for scheduler: {}", e)))?;

        Ok(Self::from_parts(config, handle, None))
    }

    /// Start a dedicated OS thread running a single-threaded runtime
    pub fn spawn_service(config: SchedulerConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(config.name.clone())
            .build()
            .map_err(|e| Error::ResourceExhausted(format!("runtime for {}: {}", config.name, e)))?;

        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(config.name.clone())
            .stack_size(config.thread_stack_size)
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })
            .map_err(|e| Error::ResourceExhausted(format!("thread for {}: {}", config.name, e)))?;

        tracing::info!(scheduler = %config.name, "Scheduler started");

        let service = ServiceThread {
            shutdown: shutdown_tx,
            thread,
        };
        Ok(Self::from_parts(config, handle, Some(service)))
    }

    fn from_parts(config: SchedulerConfig, handle: Handle, service: Option<ServiceThread>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: config.name,
                handle,
                live: Arc::new(AtomicUsize::new(0)),
                max_coroutines: config.max_coroutines,
                service: Mutex::new(service),
            }),
        }
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of coroutines spawned and not yet terminated
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Spawn a coroutine
    ///
    /// Never blocks. Fails with [`Error::ResourceExhausted`] when the
    /// coroutine budget is used up.
    pub fn spawn<F, T>(&self, name: impl Into<String>, future: F) -> Result<Coroutine<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let live = self.inner.live.fetch_add(1, Ordering::AcqRel) + 1;

        if self.inner.max_coroutines > 0 && live > self.inner.max_coroutines {
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(
                scheduler = %self.inner.name,
                coroutine = %name,
                max = self.inner.max_coroutines,
                "Coroutine budget exhausted"
            );
            return Err(Error::ResourceExhausted(format!(
                "scheduler {} limited to {} coroutines",
                self.inner.name, self.inner.max_coroutines
            )));
        }

        let control = Arc::new(Control::new(name));
        let lifetime = Lifetime {
            control: Arc::clone(&control),
            live: Arc::clone(&self.inner.live),
        };
        let span = tracing::debug_span!("coroutine", id = control.id, name = %control.name);

        let task = CURRENT.scope(Arc::clone(&control), async move {
            let lifetime = lifetime;
            lifetime.control.mark_running();
            future.await
        });
        let handle = self.inner.handle.spawn(task.instrument(span));

        tracing::trace!(
            scheduler = %self.inner.name,
            id = control.id,
            name = %control.name,
            live = live,
            "Coroutine spawned"
        );

        Ok(Coroutine {
            control,
            handle: Some(handle),
        })
    }

    /// Spawn a [`Runnable`]
    pub fn start<R: Runnable>(&self, name: impl Into<String>, runnable: R) -> Result<Coroutine<R::Output>> {
        self.spawn(name, runnable.cycle())
    }

    /// Stop the dedicated thread, dropping every coroutine still on it
    ///
    /// No-op for schedulers on the ambient runtime.
    pub fn shutdown(&self) {
        self.inner.stop_service();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("live", &self.live())
            .finish()
    }
}

/// A unit of work run as one coroutine
pub trait Runnable: Send + 'static {
    /// Exit value handed to the joiner
    type Output: Send + 'static;

    /// Do the work; the coroutine terminates when this returns
    fn cycle(self) -> impl Future<Output = Result<Self::Output>> + Send;
}

/// Owning handle to a spawned coroutine
///
/// Dropping it detaches the coroutine.
pub struct Coroutine<T> {
    control: Arc<Control>,
    handle: Option<JoinHandle<Result<T>>>,
}

impl<T> Coroutine<T> {
    /// Unique coroutine id
    pub fn id(&self) -> u64 {
        self.control.id
    }

    /// Name given at spawn
    pub fn name(&self) -> &str {
        &self.control.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoroutineState {
        self.control.state()
    }

    /// Whether the coroutine has terminated
    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Request cancellation at the next suspension point
    pub fn interrupt(&self) {
        self.control.interrupt();
    }

    /// Weak handle that can interrupt without owning the coroutine
    pub fn handle(&self) -> CoroutineHandle {
        CoroutineHandle {
            id: self.control.id,
            control: Arc::downgrade(&self.control),
        }
    }

    /// Wait for the coroutine to terminate and return its exit value
    ///
    /// The wait is itself interruptible. A coroutine can be joined once.
    pub async fn join(&mut self) -> Result<T> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("coroutine {} already joined", self.control.id)))?;

        pull()?;
        let joined = tokio::select! {
            joined = handle => joined,
            _ = interrupted() => return Err(Error::Interrupted),
        };
        self.handle = None;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(id = self.control.id, name = %self.control.name, panic = %message, "Coroutine panicked");
                Err(Error::Panicked(message))
            }
            // Cancelled by runtime shutdown
            Err(_) => Err(Error::Interrupted),
        }
    }

    /// Interrupt then join
    pub async fn stop(&mut self) -> Result<T> {
        self.interrupt();
        self.join().await
    }
}

impl<T> std::fmt::Debug for Coroutine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.control.id)
            .field("name", &self.control.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning coroutine handle
#[derive(Clone)]
pub struct CoroutineHandle {
    id: u64,
    control: Weak<Control>,
}

impl CoroutineHandle {
    /// Coroutine id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Interrupt the coroutine; false if it is gone
    pub fn interrupt(&self) -> bool {
        match self.control.upgrade() {
            Some(control) => {
                control.interrupt();
                true
            }
            None => false,
        }
    }

    /// Lifecycle state, `Terminated` once every owner is gone
    pub fn state(&self) -> CoroutineState {
        self.control
            .upgrade()
            .map(|c| c.state())
            .unwrap_or(CoroutineState::Terminated)
    }
}

impl std::fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHandle").field("id", &self.id).finish()
    }
}

/// Id of the calling coroutine, if any
pub fn current_id() -> Option<u64> {
    CURRENT.try_with(|c| c.id).ok()
}

/// Handle to the calling coroutine, if any
pub fn current() -> Option<CoroutineHandle> {
    CURRENT
        .try_with(|c| CoroutineHandle {
            id: c.id,
            control: Arc::downgrade(c),
        })
        .ok()
}

/// Whether the calling coroutine has been interrupted
///
/// Code outside any coroutine is never interrupted.
pub fn is_interrupted() -> bool {
    CURRENT.try_with(|c| c.is_interrupted()).unwrap_or(false)
}

/// Check for a pending interrupt
pub fn pull() -> Result<()> {
    if is_interrupted() {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

/// Resolves when the calling coroutine is interrupted; never outside one
pub(crate) async fn interrupted() {
    match CURRENT.try_with(Arc::clone) {
        Ok(control) => control.wait_interrupt().await,
        Err(_) => std::future::pending::<()>().await,
    }
}

/// Suspend for at least `duration`, or until interrupted
pub async fn sleep(duration: Duration) -> Result<()> {
    pull()?;
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = interrupted() => Err(Error::Interrupted),
    }
}

/// Give other ready coroutines on this scheduler a turn
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// Run a socket operation as an interruptible suspension point
///
/// I/O errors map to [`Error::Disconnected`].
pub async fn interruptible<F, T>(io: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    pull()?;
    tokio::select! {
        result = io => result.map_err(Error::from),
        _ = interrupted() => Err(Error::Interrupted),
    }
}
