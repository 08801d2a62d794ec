//! Trailing-edge debounce timer owned by a single document view.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A restartable one-shot timer.
///
/// `start` replaces any timer that has not fired yet. Once the delay elapses
/// the action is spawned as its own task, so `cancel` only ever interrupts
/// the wait and never an action that is already running. Dropping the timer
/// cancels it.
#[derive(Debug)]
pub struct DebounceTimer {
    runtime: Handle,
    handle: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            handle: None,
        }
    }

    /// (Re)arms the timer.
    pub fn start<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(action);
        }));
    }

    /// Disarms the timer. Returns `true` if a wait was interrupted.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// `true` while the timer is armed and has not fired.
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
