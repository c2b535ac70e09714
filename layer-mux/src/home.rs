//! The home task: one Tokio task that owns deferred work.
//!
//! Sessions call back from their own tasks. Anything that must happen in a
//! single place (draining killed sessions, completing key destruction,
//! persistence, the delayed-retry timer) is posted here as a boxed closure
//! through a bounded channel.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};

use crate::instance::Inner;

pub(crate) type HomeTask = Box<dyn FnOnce(&Arc<Inner>) + Send>;

pub(crate) struct Home {
    tx:      mpsc::Sender<HomeTask>,
    rearm:   Arc<Notify>,
    runtime: Handle,
    tasks:   Mutex<Vec<JoinHandle<()>>>,
}

impl Home {
    /// Must be called from inside a Tokio runtime.
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<HomeTask>) {
        let (tx, rx) = mpsc::channel(capacity);
        let home = Self {
            tx,
            rearm: Arc::new(Notify::new()),
            runtime: Handle::current(),
            tasks: Mutex::new(Vec::new()),
        };
        (home, rx)
    }

    pub(crate) fn start(&self, inner: Weak<Inner>, rx: mpsc::Receiver<HomeTask>) {
        let handle = self.runtime.spawn(run(inner, rx, Arc::clone(&self.rearm)));
        self.tasks.lock().push(handle);
    }

    /// Queue `task`. When the queue is full the post waits on a helper task
    /// instead of blocking the caller.
    pub(crate) fn post(&self, task: impl FnOnce(&Arc<Inner>) + Send + 'static) {
        match self.tx.try_send(Box::new(task)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::debug!("[mux/home] queue full, deferring post");
                let tx = self.tx.clone();
                self.runtime.spawn(async move {
                    let _ = tx.send(task).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("[mux/home] post after shutdown dropped");
            }
        }
    }

    /// The earliest delayed deadline changed.
    pub(crate) fn rearm(&self) { self.rearm.notify_one() }

    /// Post `task` after `delay`. The timer dies with the instance.
    pub(crate) fn post_after(&self, delay: Duration, task: impl FnOnce(&Arc<Inner>) + Send + 'static) {
        let tx = self.tx.clone();
        self.spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Box::new(task)).await;
        });
    }

    pub(crate) fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let handle = self.runtime.spawn(fut);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    pub(crate) fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn run(inner: Weak<Inner>, mut rx: mpsc::Receiver<HomeTask>, rearm: Arc<Notify>) {
    loop {
        let deadline = match inner.upgrade() {
            Some(strong) => strong.next_delayed_deadline(),
            None => return,
        };
        tokio::select! {
            task = rx.recv() => {
                let Some(task) = task else { return };
                let Some(strong) = inner.upgrade() else { return };
                task(&strong);
            }
            _ = rearm.notified() => {}
            _ = sleep_until_opt(deadline) => {
                if let Some(strong) = inner.upgrade() {
                    strong.check_delayed_requests();
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
