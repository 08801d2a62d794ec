//! Lifecycle guards.
//!
//! Hooks the "about to close" and "about to be backgrounded" signals of the
//! host platform so the latest draft is flushed before timers stop running.
//! The platform itself sits behind [`LifecyclePlatform`]; [`LocalPlatform`]
//! is an in-process dispatcher that hosts (and tests) drive directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

pub type ListenerId = u64;

/// What the platform should do after the before-exit handlers ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Close right away.
    Proceed,
    /// Ask the user to confirm; there are unsaved changes.
    Confirm,
}

pub type ExitHandler = Arc<dyn Fn() -> ExitDecision + Send + Sync>;
pub type BackgroundHandler = Arc<dyn Fn() + Send + Sync>;

/// Platform adapter for application lifecycle events.
///
/// Handlers run synchronously on the thread that delivers the event; remote
/// writes cannot be relied upon to finish inside them.
pub trait LifecyclePlatform: Send + Sync {
    fn on_before_exit(&self, handler: ExitHandler) -> ListenerId;

    fn on_background(&self, handler: BackgroundHandler) -> ListenerId;

    /// Removing an unknown id is a no-op.
    fn remove_listener(&self, id: ListenerId);

    /// Whether the platform can show a "leave with unsaved changes?" prompt.
    fn supports_exit_prompt(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    before_exit: BTreeMap<ListenerId, ExitHandler>,
    background: BTreeMap<ListenerId, BackgroundHandler>,
}

/// In-process lifecycle dispatcher.
#[derive(Default)]
pub struct LocalPlatform {
    listeners: Mutex<Listeners>,
    no_exit_prompt: bool,
}

impl LocalPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// A platform that cannot prompt before closing (e.g. a mobile shell).
    pub fn without_exit_prompt() -> Self {
        Self {
            listeners: Mutex::new(Listeners::default()),
            no_exit_prompt: true,
        }
    }

    /// Delivers "about to close" to every listener.
    ///
    /// Returns [`ExitDecision::Confirm`] if any listener asked for it.
    pub fn emit_before_exit(&self) -> ExitDecision {
        let handlers: Vec<ExitHandler> = self.listeners.lock().before_exit.values().cloned().collect();
        debug!("Dispatching before-exit to {} listener(s)", handlers.len());

        let mut decision = ExitDecision::Proceed;
        for handler in handlers {
            if handler() == ExitDecision::Confirm {
                decision = ExitDecision::Confirm;
            }
        }
        decision
    }

    /// Delivers "backgrounded" to every listener.
    pub fn emit_background(&self) {
        let handlers: Vec<BackgroundHandler> =
            self.listeners.lock().background.values().cloned().collect();
        debug!("Dispatching background to {} listener(s)", handlers.len());

        for handler in handlers {
            handler();
        }
    }

    pub fn listener_count(&self) -> usize {
        let listeners = self.listeners.lock();
        listeners.before_exit.len() + listeners.background.len()
    }
}

impl LifecyclePlatform for LocalPlatform {
    fn on_before_exit(&self, handler: ExitHandler) -> ListenerId {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.before_exit.insert(id, handler);
        id
    }

    fn on_background(&self, handler: BackgroundHandler) -> ListenerId {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.background.insert(id, handler);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        let mut listeners = self.listeners.lock();
        listeners.before_exit.remove(&id);
        listeners.background.remove(&id);
    }

    fn supports_exit_prompt(&self) -> bool {
        !self.no_exit_prompt
    }
}

/// The guards registered by one document view.
///
/// Registering again replaces the previous listener of the same kind, and
/// dropping the guards removes everything, so remounting a view never
/// stacks listeners.
pub struct LifecycleGuards {
    platform: Arc<dyn LifecyclePlatform>,
    prompt_on_exit: bool,
    before_exit: Option<ListenerId>,
    background: Option<ListenerId>,
}

impl LifecycleGuards {
    pub fn new(platform: Arc<dyn LifecyclePlatform>) -> Self {
        Self {
            platform,
            prompt_on_exit: true,
            before_exit: None,
            background: None,
        }
    }

    pub fn with_exit_prompt(mut self, prompt: bool) -> Self {
        self.prompt_on_exit = prompt;
        self
    }

    /// On "about to close", if `has_unsaved_changes()` holds, runs
    /// `on_final_save` (which must write the local snapshot synchronously)
    /// and asks the platform to confirm the close where it can.
    pub fn register_before_unload<U, S>(&mut self, has_unsaved_changes: U, on_final_save: S)
    where
        U: Fn() -> bool + Send + Sync + 'static,
        S: Fn() + Send + Sync + 'static,
    {
        self.unregister_before_unload();

        let confirm = self.prompt_on_exit && self.platform.supports_exit_prompt();
        let handler: ExitHandler = Arc::new(move || {
            if !has_unsaved_changes() {
                return ExitDecision::Proceed;
            }
            info!("Unsaved changes at exit; flushing local snapshot");
            on_final_save();
            if confirm {
                ExitDecision::Confirm
            } else {
                ExitDecision::Proceed
            }
        });
        self.before_exit = Some(self.platform.on_before_exit(handler));
    }

    /// On "backgrounded", hands the current draft (if any) to `on_save`.
    pub fn register_background_guard<D, G, S>(&mut self, get_data: G, on_save: S)
    where
        G: Fn() -> Option<D> + Send + Sync + 'static,
        S: Fn(D) + Send + Sync + 'static,
    {
        self.unregister_background();

        let handler: BackgroundHandler = Arc::new(move || {
            if let Some(data) = get_data() {
                info!("Backgrounded with a draft; flushing");
                on_save(data);
            }
        });
        self.background = Some(self.platform.on_background(handler));
    }

    pub fn unregister_before_unload(&mut self) {
        if let Some(id) = self.before_exit.take() {
            self.platform.remove_listener(id);
        }
    }

    pub fn unregister_background(&mut self) {
        if let Some(id) = self.background.take() {
            self.platform.remove_listener(id);
        }
    }

    pub fn unregister_all(&mut self) {
        self.unregister_before_unload();
        self.unregister_background();
    }

    pub fn is_registered(&self) -> bool {
        self.before_exit.is_some() || self.background.is_some()
    }
}

impl Drop for LifecycleGuards {
    fn drop(&mut self) {
        self.unregister_all();
    }
}
