//! Debounced remote sync.
//!
//! Coalesces bursts of edits into one remote write after a quiet period,
//! retries failed writes with backoff, and publishes a [`SyncStatus`] that
//! the UI reads but never writes.
//!
//! At most one write per document is ever in flight. Changes that arrive
//! while a write is running are kept as the pending value and produce one
//! follow-up write once the running one settles.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::futures::Notified;
use tokio::sync::{broadcast, watch, Notify};

use crate::config::SyncConfig;
use crate::debounce::DebounceTimer;
use crate::error::{RemoteError, SyncError};
use crate::snapshot_model::DocumentKey;

const STATUS_EVENT_CAPACITY: usize = 64;

/// Remote persistence and load collaborator.
///
/// `save` must be an idempotent upsert keyed by `key`: the same data may be
/// sent more than once when a retry follows a write whose response was lost.
#[async_trait]
pub trait RemoteDocuments<D>: Send + Sync {
    /// Returns the authoritative copy, or `None` if the document does not exist.
    async fn load(&self, key: &DocumentKey) -> Result<Option<D>, RemoteError>;

    async fn save(&self, key: &DocumentKey, data: &D) -> Result<(), RemoteError>;
}

/// Phase of the remote sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    /// A change is registered and the debounce timer is running.
    Pending,
    /// A write is in flight.
    Syncing,
    Synced,
    /// Retries are exhausted; the data is still pending.
    Error,
    /// Connectivity is down; nothing is written until it returns.
    Offline,
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
            SyncStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// Called after a successful write with the revision that was written.
///
/// Compare it against [`DebouncedSync::revision`] to know whether the remote
/// copy is now up to date.
pub type SuccessHook = Arc<dyn Fn(u64) + Send + Sync>;

type FlushFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct SyncState<D> {
    pending: Option<D>,
    /// Bumped on every registered change.
    revision: u64,
    in_flight: bool,
    online: bool,
    disposed: bool,
    status: SyncStatus,
    last_error: Option<RemoteError>,
    timer: DebounceTimer,
}

struct Shared<D> {
    key: Mutex<DocumentKey>,
    remote: Arc<dyn RemoteDocuments<D>>,
    config: SyncConfig,
    runtime: Handle,
    state: Mutex<SyncState<D>>,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: broadcast::Sender<SyncStatus>,
    settled: Notify,
    on_success: Mutex<Option<SuccessHook>>,
}

enum Claim<'a, D> {
    Write {
        key: DocumentKey,
        data: D,
        revision: u64,
    },
    Busy(Notified<'a>),
    Offline,
    Nothing,
    Disposed,
}

enum Outcome {
    Written,
    Failed { attempts: u32, error: RemoteError },
    WentOffline,
}

/// Debounced, retrying, single-writer sync of one document.
///
/// Owned by the document view: create it when the view opens, drop it (or
/// call [`dispose`](Self::dispose)) when the view goes away. Dropping cancels
/// the debounce timer; a write that is already in flight still settles.
pub struct DebouncedSync<D> {
    shared: Arc<Shared<D>>,
}

impl<D> DebouncedSync<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Binds to the tokio runtime of the calling context.
    pub fn new(
        key: DocumentKey,
        remote: Arc<dyn RemoteDocuments<D>>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        Ok(Self::with_runtime(key, remote, config, runtime))
    }

    pub fn with_runtime(
        key: DocumentKey,
        remote: Arc<dyn RemoteDocuments<D>>,
        config: SyncConfig,
        runtime: Handle,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Idle);
        let (events_tx, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        let timer = DebounceTimer::new(runtime.clone());

        Self {
            shared: Arc::new(Shared {
                key: Mutex::new(key),
                remote,
                config,
                runtime,
                state: Mutex::new(SyncState {
                    pending: None,
                    revision: 0,
                    in_flight: false,
                    online: true,
                    disposed: false,
                    status: SyncStatus::Idle,
                    last_error: None,
                    timer,
                }),
                status_tx,
                events_tx,
                settled: Notify::new(),
                on_success: Mutex::new(None),
            }),
        }
    }

    pub fn set_on_success(&self, hook: SuccessHook) {
        *self.shared.on_success.lock() = Some(hook);
    }

    /// Registers `data` as the latest value and (re)starts the debounce timer.
    ///
    /// While a write is in flight the value is only queued; it is written by
    /// the follow-up that starts once the running write settles.
    pub fn sync(&self, data: D) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.disposed {
            warn!("Ignoring change for disposed sync of {}", shared.key.lock());
            return;
        }

        st.pending = Some(data);
        st.revision += 1;

        if st.in_flight {
            debug!("Change r{} queued behind in-flight write", st.revision);
            return;
        }
        if !st.online {
            shared.set_status(&mut st, SyncStatus::Offline);
            return;
        }

        shared.set_status(&mut st, SyncStatus::Pending);
        st.timer
            .start(shared.config.debounce(), Shared::flush_task(Arc::clone(shared)));
    }

    /// Cancels the debounce timer and writes `data` right away.
    ///
    /// If a write is already in flight this waits for it to settle first.
    pub async fn sync_now(&self, data: D) -> Result<(), SyncError> {
        {
            let mut st = self.shared.state.lock();
            if st.disposed {
                return Err(SyncError::Disposed);
            }
            st.timer.cancel();
            st.pending = Some(data);
            st.revision += 1;
        }
        self.flush_now().await
    }

    /// Writes whatever is pending right away. This is the retry affordance
    /// after the status reached [`SyncStatus::Error`].
    pub async fn flush_now(&self) -> Result<(), SyncError> {
        let shared = &self.shared;
        loop {
            match shared.claim() {
                Claim::Write {
                    key,
                    data,
                    revision,
                } => return shared.write_and_settle(key, data, revision).await,
                Claim::Busy(settled) => settled.await,
                Claim::Offline => return Err(SyncError::Offline),
                Claim::Nothing => return Ok(()),
                Claim::Disposed => return Err(SyncError::Disposed),
            }
        }
    }

    /// Reports connectivity. Going offline stops all write attempts; coming
    /// back online writes the latest pending value without user action.
    pub fn set_online(&self, online: bool) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.online == online || st.disposed {
            return;
        }
        st.online = online;

        if !online {
            info!("Offline; holding writes for {}", shared.key.lock());
            st.timer.cancel();
            if !st.in_flight {
                shared.set_status(&mut st, SyncStatus::Offline);
            }
            return;
        }

        info!("Back online; resuming writes for {}", shared.key.lock());
        // The running write re-checks connectivity when it settles.
        if st.in_flight {
            return;
        }
        if st.pending.is_some() {
            shared.set_status(&mut st, SyncStatus::Pending);
            shared
                .runtime
                .spawn(Shared::flush_task(Arc::clone(shared)));
        } else {
            shared.set_status(&mut st, SyncStatus::Idle);
        }
    }

    /// Moves the sync to a new document key, e.g. once the server assigned an
    /// id to a document that was created as `pending`.
    pub fn rekey(&self, key: DocumentKey) {
        *self.shared.key.lock() = key;
    }

    /// Cancels the timer and rejects further changes. Pending data is kept
    /// and can still be read through [`pending`](Self::pending).
    pub fn dispose(&self) {
        let mut st = self.shared.state.lock();
        if st.disposed {
            return;
        }
        st.disposed = true;
        st.timer.cancel();
        drop(st);
        self.shared.settled.notify_waiters();
        debug!("Disposed sync for {}", self.shared.key.lock());
    }

    pub fn key(&self) -> DocumentKey {
        self.shared.key.lock().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.state.lock().status
    }

    /// Latest status, as a watch channel.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Every status transition from now on, in order.
    pub fn status_events(&self) -> broadcast::Receiver<SyncStatus> {
        self.shared.events_tx.subscribe()
    }

    pub fn pending(&self) -> Option<D> {
        self.shared.state.lock().pending.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }

    pub fn revision(&self) -> u64 {
        self.shared.state.lock().revision
    }

    pub fn last_error(&self) -> Option<RemoteError> {
        self.shared.state.lock().last_error.clone()
    }

    pub fn is_online(&self) -> bool {
        self.shared.state.lock().online
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }
}

impl<D> Drop for DebouncedSync<D> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        st.disposed = true;
        st.timer.cancel();
        drop(st);
        self.shared.settled.notify_waiters();
    }
}

impl<D> Shared<D>
where
    D: Clone + Send + Sync + 'static,
{
    fn set_status(&self, st: &mut SyncState<D>, status: SyncStatus) {
        if st.status == status {
            return;
        }
        debug!("Sync status {} -> {}", st.status, status);
        st.status = status;
        self.status_tx.send_replace(status);
        let _ = self.events_tx.send(status);
    }

    fn claim(&self) -> Claim<'_, D> {
        let mut st = self.state.lock();
        if st.disposed {
            return Claim::Disposed;
        }
        if st.in_flight {
            return Claim::Busy(self.settled.notified());
        }
        let Some(data) = st.pending.clone() else {
            return Claim::Nothing;
        };
        if !st.online {
            self.set_status(&mut st, SyncStatus::Offline);
            return Claim::Offline;
        }

        st.timer.cancel();
        st.in_flight = true;
        self.set_status(&mut st, SyncStatus::Syncing);
        Claim::Write {
            key: self.key.lock().clone(),
            data,
            revision: st.revision,
        }
    }

    /// Background flush used by the debounce timer and reconnects. A write
    /// that is already running will schedule its own follow-up.
    fn flush_task(shared: Arc<Self>) -> FlushFuture {
        Box::pin(async move {
            let claim = shared.claim();
            if let Claim::Write {
                key,
                data,
                revision,
            } = claim
            {
                if let Err(e) = shared.write_and_settle(key, data, revision).await {
                    debug!("Background flush ended with: {e}");
                }
            }
        })
    }

    async fn write_and_settle(
        self: &Arc<Self>,
        key: DocumentKey,
        data: D,
        revision: u64,
    ) -> Result<(), SyncError> {
        let outcome = self.write_with_retries(&key, &data).await;

        let mut st = self.state.lock();
        st.in_flight = false;
        let newer_queued = st.revision != revision;

        let (result, notify_success) = match outcome {
            Outcome::Written => {
                st.last_error = None;
                if newer_queued {
                    debug!("Wrote r{revision} of {key}; r{} still pending", st.revision);
                    self.schedule_follow_up(&mut st);
                } else {
                    info!("Synced {key} at r{revision}");
                    st.pending = None;
                    self.set_status(&mut st, SyncStatus::Synced);
                }
                (Ok(()), true)
            }
            Outcome::Failed { attempts, error } => {
                st.last_error = Some(error.clone());
                if newer_queued && st.online {
                    self.schedule_follow_up(&mut st);
                } else {
                    error!("Giving up on {key} after {attempts} attempt(s): {error}");
                    self.set_status(&mut st, SyncStatus::Error);
                }
                (
                    Err(SyncError::Write {
                        attempts,
                        source: error,
                    }),
                    false,
                )
            }
            Outcome::WentOffline => {
                // A reconnect while the write was in flight returned early
                // in `set_online`; pick its flush up here.
                if st.online && !st.disposed && st.pending.is_some() {
                    info!("Back online while {key} was settling; flushing again");
                    self.set_status(&mut st, SyncStatus::Pending);
                    self.runtime.spawn(Self::flush_task(Arc::clone(self)));
                } else {
                    self.set_status(&mut st, SyncStatus::Offline);
                }
                (Err(SyncError::Offline), false)
            }
        };
        drop(st);

        self.settled.notify_waiters();
        if notify_success {
            let hook = self.on_success.lock().clone();
            if let Some(hook) = hook {
                hook(revision);
            }
        }
        result
    }

    fn schedule_follow_up(self: &Arc<Self>, st: &mut SyncState<D>) {
        if st.disposed {
            return;
        }
        if !st.online {
            self.set_status(st, SyncStatus::Offline);
            return;
        }
        self.set_status(st, SyncStatus::Pending);
        st.timer
            .start(self.config.debounce(), Self::flush_task(Arc::clone(self)));
    }

    async fn write_with_retries(&self, key: &DocumentKey, data: &D) -> Outcome {
        let attempts = self.config.attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let online = self.state.lock().online;
            if !online {
                return Outcome::WentOffline;
            }

            debug!("Writing {key} (attempt {attempt}/{attempts})");
            let result = match self.config.attempt_timeout() {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.remote.save(key, data)).await {
                        Ok(result) => result,
                        Err(_) => Err(RemoteError::timeout(format!(
                            "no response within {}ms",
                            limit.as_millis()
                        ))),
                    }
                }
                None => self.remote.save(key, data).await,
            };

            match result {
                Ok(()) => return Outcome::Written,
                Err(e) => {
                    warn!("Write of {key} failed (attempt {attempt}/{attempts}): {e}");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay(attempt)).await;
                    }
                }
            }
        }

        let online = self.state.lock().online;
        if !online {
            return Outcome::WentOffline;
        }
        Outcome::Failed {
            attempts,
            error: last_error.unwrap_or_else(|| RemoteError::server("write failed")),
        }
    }
}
