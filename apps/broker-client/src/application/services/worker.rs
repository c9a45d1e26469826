//! Worker threads with a bounded join.
//!
//! `std::thread::JoinHandle::join` cannot time out, so every runtime thread
//! publishes its outcome through a [`Completion`] latch. Callers wait on the
//! latch with a deadline and only join once the thread is known to be done.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot latch carrying a value.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Set the value. Later calls are ignored.
    pub(crate) fn complete(&self, value: T) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(value);
        }
        self.ready.notify_all();
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }

    pub(crate) fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.ready.wait(&mut slot);
        }
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

/// How a worker thread ended: its return value, or the panic message.
pub(crate) type WorkerOutcome<T> = Result<T, String>;

/// A named thread whose outcome can be awaited with a timeout.
#[derive(Debug)]
pub(crate) struct WorkerThread<T> {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Arc<Completion<WorkerOutcome<T>>>,
}

impl<T: Clone + Send + 'static> WorkerThread<T> {
    /// Spawn `body` on a new named thread. Panics inside `body` are caught
    /// and reported as the outcome.
    pub(crate) fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let done = Arc::new(Completion::new());
        let latch = Arc::clone(&done);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(body)).map_err(|p| panic_message(&*p));
                latch.complete(outcome);
            })?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            done,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Latch that fires when the thread finishes.
    pub(crate) fn completion(&self) -> Arc<Completion<WorkerOutcome<T>>> {
        Arc::clone(&self.done)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.done.get().is_some()
    }

    /// Wait up to `timeout` for the thread to finish and reap it.
    ///
    /// Returns `None` if the thread is still running; it is then detached
    /// when `self` is dropped.
    pub(crate) fn join_within(&mut self, timeout: Duration) -> Option<WorkerOutcome<T>> {
        let outcome = self.done.wait_for(timeout)?;
        if let Some(handle) = self.handle.take() {
            // The body already returned, so this only reaps the OS thread.
            let _ = handle.join();
        }
        Some(outcome)
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
