//! Collaborators an [`crate::Instance`] is built with.

use std::sync::Arc;

use crate::retry::{AutoSleep, RetryPolicy};
use crate::session::SessionFactory;
use crate::storage::{InMemoryBackend, StateBackend};

/// The application's language-pack manager, as far as the multiplexer
/// needs to talk to it.
pub trait LanguageManager: Send + Sync {
    /// The server rejected the current language code.
    fn reset_to_default(&self);

    /// Language the server suggests; empty when it has no opinion.
    fn set_suggested_language(&self, lang_code: &str);

    fn set_current_versions(&self, version: i32, base_version: i32);
}

/// A [`LanguageManager`] that ignores everything.
pub struct NoLanguage;

impl LanguageManager for NoLanguage {
    fn reset_to_default(&self) {}
    fn set_suggested_language(&self, _: &str) {}
    fn set_current_versions(&self, _: i32, _: i32) {}
}

/// Everything the instance needs from the outside world.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use layer_mux::{Context, BinaryFileBackend, SessionFactory};
/// # fn demo(factory: impl SessionFactory + 'static) {
/// let ctx = Context::new(factory)
///     .with_storage(Arc::new(BinaryFileBackend::new("state.bin")));
/// # }
/// ```
#[derive(Clone)]
pub struct Context {
    pub(crate) sessions:      Arc<dyn SessionFactory>,
    pub(crate) storage:       Arc<dyn StateBackend>,
    pub(crate) language:      Arc<dyn LanguageManager>,
    pub(crate) retry_policy:  Arc<dyn RetryPolicy>,
    pub(crate) home_capacity: usize,
}

impl Context {
    /// Defaults: in-memory storage, no language manager, [`AutoSleep`].
    pub fn new(sessions: impl SessionFactory + 'static) -> Self {
        Self {
            sessions:      Arc::new(sessions),
            storage:       Arc::new(InMemoryBackend::new()),
            language:      Arc::new(NoLanguage),
            retry_policy:  Arc::new(AutoSleep::default()),
            home_capacity: 1024,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn StateBackend>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_language(mut self, language: Arc<dyn LanguageManager>) -> Self {
        self.language = language;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Bound of the home-task queue. Posts beyond it wait asynchronously.
    pub fn with_home_capacity(mut self, capacity: usize) -> Self {
        self.home_capacity = capacity.max(1);
        self
    }

    pub fn storage(&self) -> &Arc<dyn StateBackend> { &self.storage }
}
