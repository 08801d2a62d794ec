//! Draft-protected sync controller.
//!
//! Composes the snapshot store, the debounced remote sync, the lifecycle
//! guards and the restore negotiation for one open document. Every edit is
//! written to the local store before [`DraftController::edit`] returns, then
//! handed to the debounced sync; a confirmed remote write of the latest
//! revision clears the local snapshot again.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::lifecycle::{LifecycleGuards, LifecyclePlatform};
use crate::remote_sync::{DebouncedSync, RemoteDocuments, SyncStatus};
use crate::restore::{RestoreCandidate, RestoreNegotiation, RestoreSession, RestoreState};
use crate::snapshot_model::{DocumentKey, Snapshot};
use crate::snapshot_store::SnapshotStore;

struct DraftState<D> {
    key: DocumentKey,
    current: Option<D>,
    dirty: bool,
}

struct ControllerInner<D> {
    store: Arc<SnapshotStore>,
    sync: DebouncedSync<D>,
    draft: Mutex<DraftState<D>>,
    restore: Mutex<RestoreNegotiation<D>>,
    runtime: Handle,
}

/// One open document with draft protection.
pub struct DraftController<D>
where
    D: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    inner: Arc<ControllerInner<D>>,
    guards: Mutex<Option<LifecycleGuards>>,
    config: SyncConfig,
}

impl<D> DraftController<D>
where
    D: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Loads the authoritative copy and evaluates the restore offer.
    ///
    /// A failed load is returned as [`SyncError::Load`] and no offer is made.
    pub async fn open(
        key: DocumentKey,
        store: Arc<SnapshotStore>,
        remote: Arc<dyn RemoteDocuments<D>>,
        config: SyncConfig,
        session: &RestoreSession,
    ) -> Result<Self, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let loaded = remote.load(&key).await.map_err(|e| {
            warn!("Could not load {key}: {e}");
            SyncError::Load(e)
        })?;
        debug!("Loaded {key} (found: {})", loaded.is_some());

        let candidate = store
            .load::<D>(&key)
            .map(|snapshot| RestoreCandidate {
                key: key.clone(),
                snapshot,
            });
        let negotiation = RestoreNegotiation::evaluate(&key, loaded.as_ref(), candidate, session);

        let sync = DebouncedSync::with_runtime(key.clone(), remote, config.clone(), runtime.clone());
        let inner = Arc::new(ControllerInner {
            store,
            sync,
            draft: Mutex::new(DraftState {
                key,
                current: loaded,
                dirty: false,
            }),
            restore: Mutex::new(negotiation),
            runtime,
        });

        let weak = Arc::downgrade(&inner);
        inner.sync.set_on_success(Arc::new(move |revision| {
            if let Some(inner) = weak.upgrade() {
                inner.on_synced(revision);
            }
        }));

        Ok(Self {
            inner,
            guards: Mutex::new(None),
            config,
        })
    }

    pub fn key(&self) -> DocumentKey {
        self.inner.draft.lock().key.clone()
    }

    /// The in-memory form state.
    pub fn current(&self) -> Option<D> {
        self.inner.draft.lock().current.clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.is_dirty()
    }

    /// Registers a change: snapshot first, then the debounced remote write.
    pub fn edit(&self, data: D) {
        self.inner.edit(data);
    }

    /// Writes the current state immediately (explicit save, blur).
    pub async fn save_now(&self) -> Result<(), SyncError> {
        let current = self.current();
        match current {
            Some(data) => self.inner.sync.sync_now(data).await,
            None => Err(SyncError::NothingPending),
        }
    }

    /// Retries whatever is pending, e.g. after the status reached `error`.
    pub async fn retry(&self) -> Result<(), SyncError> {
        self.inner.sync.flush_now().await
    }

    pub fn set_online(&self, online: bool) {
        self.inner.sync.set_online(online);
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.sync.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.sync.subscribe()
    }

    pub fn status_events(&self) -> broadcast::Receiver<SyncStatus> {
        self.inner.sync.status_events()
    }

    pub fn sync(&self) -> &DebouncedSync<D> {
        &self.inner.sync
    }

    pub fn restore_state(&self) -> RestoreState {
        self.inner.restore.lock().state()
    }

    pub fn restore_offer(&self) -> Option<Snapshot<D>> {
        self.inner.restore.lock().offer().cloned()
    }

    /// Accepts the restore offer and puts the snapshot back into the form.
    pub fn restore(&self) -> Option<D> {
        let data = self.inner.restore.lock().restore()?;
        self.inner.edit(data.clone());
        Some(data)
    }

    /// Rejects the restore offer and drops the snapshot. Edits made since the
    /// offer appeared stay backed by a fresh snapshot.
    pub fn dismiss_restore(&self) -> bool {
        if !self.inner.restore.lock().dismiss() {
            return false;
        }
        let draft = self.inner.draft.lock();
        self.inner.store.clear(&draft.key);
        if draft.dirty {
            if let Some(current) = draft.current.as_ref() {
                self.inner.store.save(&draft.key, current);
            }
        }
        true
    }

    /// Moves the draft to `new_key`, e.g. once the server assigned an id to a
    /// document created as [`DocumentKey::pending`].
    pub fn rekey(&self, new_key: DocumentKey) {
        let mut draft = self.inner.draft.lock();
        if draft.key == new_key {
            return;
        }
        let old_key = std::mem::replace(&mut draft.key, new_key.clone());
        self.inner.store.clear(&old_key);
        if draft.dirty {
            if let Some(current) = draft.current.as_ref() {
                self.inner.store.save(&new_key, current);
            }
        }
        self.inner.sync.rekey(new_key);
        info!("Rekeyed draft {old_key} -> {}", draft.key);
    }

    /// Installs the before-exit and background guards on `platform`.
    ///
    /// Calling this again replaces the previous registration.
    pub fn attach_lifecycle(&self, platform: Arc<dyn LifecyclePlatform>) {
        let mut guards = LifecycleGuards::new(platform).with_exit_prompt(self.config.prompt_on_exit);

        let unsaved = Arc::downgrade(&self.inner);
        let final_save = Arc::downgrade(&self.inner);
        guards.register_before_unload(
            move || unsaved.upgrade().is_some_and(|inner| inner.is_dirty()),
            move || {
                if let Some(inner) = final_save.upgrade() {
                    inner.flush_local();
                }
            },
        );

        let source = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(&self.inner);
        guards.register_background_guard(
            move || source.upgrade().and_then(|inner| inner.unsaved_draft()),
            move |data: D| {
                if let Some(inner) = target.upgrade() {
                    ControllerInner::flush_on_background(inner, data);
                }
            },
        );

        // Replacing drops (and unregisters) the previous guards.
        *self.guards.lock() = Some(guards);
    }

    pub fn detach_lifecycle(&self) {
        self.guards.lock().take();
    }

    /// Tears the view down: removes the guards, makes a last remote write if
    /// anything is pending and the network is up, then stops the sync.
    pub async fn close(self) {
        self.detach_lifecycle();
        if self.inner.sync.has_pending() && self.inner.sync.is_online() {
            if let Err(e) = self.inner.sync.flush_now().await {
                warn!("Final write of {} failed, snapshot kept: {e}", self.key());
            }
        }
        self.inner.sync.dispose();
    }
}

impl<D> Drop for DraftController<D>
where
    D: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.guards.lock().take();
        self.inner.sync.dispose();
    }
}

impl<D> ControllerInner<D>
where
    D: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn edit(&self, data: D) {
        let mut draft = self.draft.lock();
        self.store.save(&draft.key, &data);
        draft.current = Some(data.clone());
        draft.dirty = true;
        self.sync.sync(data);
    }

    fn is_dirty(&self) -> bool {
        self.draft.lock().dirty
    }

    fn unsaved_draft(&self) -> Option<D> {
        let draft = self.draft.lock();
        if draft.dirty {
            draft.current.clone()
        } else {
            None
        }
    }

    /// Synchronous snapshot write of the current state.
    fn flush_local(&self) {
        let draft = self.draft.lock();
        if let Some(current) = draft.current.as_ref() {
            self.store.save(&draft.key, current);
        }
    }

    fn flush_on_background(inner: Arc<Self>, data: D) {
        {
            let draft = inner.draft.lock();
            inner.store.save(&draft.key, &data);
        }
        if !inner.sync.is_online() {
            debug!("Backgrounded while offline; local snapshot only");
            return;
        }
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            if let Err(e) = inner.sync.sync_now(data).await {
                warn!("Background write failed, snapshot kept: {e}");
            }
        });
    }

    /// Success hook of the remote sync. Clears the snapshot only if nothing
    /// newer than `revision` was registered meanwhile.
    fn on_synced(&self, revision: u64) {
        let mut draft = self.draft.lock();
        if self.sync.revision() != revision {
            return;
        }
        self.store.clear(&draft.key);
        draft.dirty = false;
        debug!("Cleared snapshot of {} after r{revision}", draft.key);
    }
}
