//! Coroutine runtime
//!
//! This module provides:
//! - A scheduler running lightweight coroutines on one or more OS threads
//! - Interrupt/join lifecycle for each coroutine
//! - Condition variables and mutexes that park coroutines, not threads

pub mod scheduler;
pub mod sync;

pub use scheduler::{
    current, current_id, interruptible, is_interrupted, pull, sleep, yield_now, Coroutine,
    CoroutineHandle, CoroutineState, Runnable, Scheduler, SchedulerConfig,
};
pub use sync::{Condition, Mutex, MutexGuard, WaitResult, WaitTicket};
