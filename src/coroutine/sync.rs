//! Coroutine-aware condition variable and mutex
//!
//! Blocking here parks the coroutine, never the OS thread. Both primitives are
//! `Send + Sync`, so a coroutine on one scheduler may signal a waiter on
//! another.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use super::scheduler::{interrupted, is_interrupted};
use crate::error::{Error, Result};

pub use tokio::sync::MutexGuard;

/// Outcome of [`Condition::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by `signal` or `broadcast`
    Signaled,
    /// The timeout elapsed first
    TimedOut,
    /// The waiting coroutine was interrupted
    Interrupted,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

/// Condition variable with FIFO wakeup
#[derive(Default)]
pub struct Condition {
    waiters: parking_lot::Mutex<VecDeque<Waiter>>,
    next_id: AtomicU64,
}

impl Condition {
    /// Create a condition with no waiters
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a signal, an optional timeout, or an interrupt
    pub async fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        self.prepare().wait(timeout).await
    }

    /// Enqueue the caller as a waiter without suspending
    ///
    /// Lets a caller register while still holding its own state lock, so a
    /// signal issued right after the lock is released is not lost.
    pub fn prepare(&self) -> WaitTicket<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(Waiter { id, tx });

        WaitTicket { cond: self, id, rx }
    }

    /// Wake the oldest waiter; false if nobody was waiting
    pub fn signal(&self) -> bool {
        let mut waiters = self.waiters.lock();
        while let Some(waiter) = waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Wake every waiter, returning how many were woken
    pub fn broadcast(&self) -> usize {
        let drained: Vec<Waiter> = self.waiters.lock().drain(..).collect();
        drained
            .into_iter()
            .map(|waiter| waiter.tx.send(()))
            .filter(|sent| sent.is_ok())
            .count()
    }

    /// Number of registered waiters
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn forget(&self, id: u64) {
        self.waiters.lock().retain(|w| w.id != id);
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// A registered waiter; dropping it deregisters
pub struct WaitTicket<'a> {
    cond: &'a Condition,
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl WaitTicket<'_> {
    /// Suspend until signaled, timed out or interrupted
    ///
    /// An interrupt that arrived before this call returns immediately.
    pub async fn wait(mut self, timeout: Option<Duration>) -> WaitResult {
        if is_interrupted() {
            return WaitResult::Interrupted;
        }

        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = &mut self.rx => WaitResult::Signaled,
            _ = interrupted() => WaitResult::Interrupted,
            _ = deadline => WaitResult::TimedOut,
        }
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.cond.forget(self.id);
    }
}

/// Single-owner mutex whose lock is an interruptible suspension point
///
/// Not reentrant. The guard releases on every exit path, including `?`
/// unwinding after an interrupt.
#[derive(Debug, Default)]
pub struct Mutex<T> {
    inner: tokio::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Create a mutex
    pub fn new(value: T) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(value),
        }
    }

    /// Acquire the lock, waiting in FIFO order
    pub async fn lock(&self) -> Result<MutexGuard<'_, T>> {
        if is_interrupted() {
            return Err(Error::Interrupted);
        }

        tokio::select! {
            guard = self.inner.lock() => Ok(guard),
            _ = interrupted() => Err(Error::Interrupted),
        }
    }

    /// Acquire the lock only if it is free
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }

    /// Consume the mutex
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
