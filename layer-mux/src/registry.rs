//! The request registry: routing, payloads, handlers and dependency chains.
//!
//! Every table has its own lock and no method holds more than one of them at
//! a time, so sessions calling back from their own tasks never contend on a
//! single big lock. Nothing here calls into a session or a handler.

use std::collections::{BTreeSet, HashMap};

use parking_lot::{Mutex, RwLock};

use crate::dc::{DcId, ShiftedDcId, bare_dc_id, dc_id_shift, shift_dc_id};
use crate::request::{RequestId, ResponseHandler, SerializedRequest};

/// Where a request is currently routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Pinned to this shifted DC.
    Fixed(ShiftedDcId),
    /// Sent "to the main DC"; follows it when the main DC changes.
    Main(ShiftedDcId),
}

impl Target {
    pub fn shifted(self) -> ShiftedDcId {
        match self {
            Self::Fixed(s) | Self::Main(s) => s,
        }
    }

    pub fn follows_main(self) -> bool { matches!(self, Self::Main(_)) }

    /// Same shift and same kind, on `dc_id`.
    pub fn moved_to(self, dc_id: DcId) -> Self {
        match self {
            Self::Fixed(s) => Self::Fixed(shift_dc_id(dc_id, dc_id_shift(s))),
            Self::Main(s) => Self::Main(shift_dc_id(dc_id, dc_id_shift(s))),
        }
    }
}

/// What [`Registry::unregister`] found.
#[derive(Debug, Default)]
pub(crate) struct Unregistered {
    /// `false` if the id was unknown to every table.
    pub existed: bool,
    /// Requests that were chained behind the removed one, to be resent.
    pub resend:  Vec<(Target, SerializedRequest)>,
}

#[derive(Default)]
pub(crate) struct Registry {
    routes:     Mutex<HashMap<RequestId, Target>>,
    requests:   RwLock<HashMap<RequestId, SerializedRequest>>,
    handlers:   Mutex<HashMap<RequestId, ResponseHandler>>,
    /// Dependent request → the request it waits for.
    dependents: Mutex<HashMap<RequestId, RequestId>>,
    /// Consecutive transport failures per request.
    failures:   Mutex<HashMap<RequestId, u32>>,
    /// `(request_id, error_code)` pairs waiting to be cleared on the home task.
    to_clear:   Mutex<Vec<(RequestId, i32)>>,
}

impl Registry {
    pub(crate) fn new() -> Self { Self::default() }

    /// Keep the payload, and the handlers if there are any.
    pub(crate) fn store(&self, request: &SerializedRequest, handler: ResponseHandler) {
        let id = request.request_id();
        if !handler.is_empty() {
            self.handlers.lock().insert(id, handler);
        }
        self.requests.write().insert(id, request.clone());
    }

    pub(crate) fn register(&self, id: RequestId, target: Target) {
        self.routes.lock().insert(id, target);
    }

    pub(crate) fn route(&self, id: RequestId) -> Option<Target> {
        self.routes.lock().get(&id).copied()
    }

    /// Move `id` to `dc_id`, keeping its shift and whether it follows main.
    pub(crate) fn retarget(&self, id: RequestId, dc_id: DcId) -> Option<Target> {
        let mut routes = self.routes.lock();
        let target = routes.get_mut(&id)?;
        *target = target.moved_to(dc_id);
        Some(*target)
    }

    /// Point every main-following request at the new main DC.
    pub(crate) fn retarget_main(&self, dc_id: DcId) {
        for target in self.routes.lock().values_mut() {
            if target.follows_main() {
                *target = target.moved_to(dc_id);
            }
        }
    }

    /// Requests currently routed to exactly `shifted`.
    pub(crate) fn routed_to(&self, shifted: ShiftedDcId) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .routes
            .lock()
            .iter()
            .filter(|(_, t)| t.shifted() == shifted)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn request(&self, id: RequestId) -> Option<SerializedRequest> {
        self.requests.read().get(&id).cloned()
    }

    pub(crate) fn take_handler(&self, id: RequestId) -> Option<ResponseHandler> {
        self.handlers.lock().remove(&id)
    }

    pub(crate) fn put_handler(&self, id: RequestId, handler: ResponseHandler) {
        self.handlers.lock().insert(id, handler);
    }

    pub(crate) fn has_handler(&self, id: RequestId) -> bool {
        self.handlers.lock().contains_key(&id)
    }

    pub(crate) fn add_dependent(&self, id: RequestId, after: RequestId) {
        self.dependents.lock().insert(id, after);
    }

    pub(crate) fn is_dependent(&self, id: RequestId) -> bool {
        self.dependents.lock().contains_key(&id)
    }

    /// Bump and return the transport-failure count for `id`.
    pub(crate) fn record_failure(&self, id: RequestId) -> u32 {
        let mut failures = self.failures.lock();
        let count = failures.entry(id).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub(crate) fn push_clear(&self, items: impl IntoIterator<Item = (RequestId, i32)>) {
        self.to_clear.lock().extend(items);
    }

    pub(crate) fn take_clear(&self) -> Vec<(RequestId, i32)> {
        std::mem::take(&mut *self.to_clear.lock())
    }

    /// Forget `id` in every table and collect the requests that were waiting
    /// on it, transitively.
    pub(crate) fn unregister(&self, id: RequestId) -> Unregistered {
        let mut existed = self.failures.lock().remove(&id).is_some();
        existed |= self.requests.write().remove(&id).is_some();
        existed |= self.routes.lock().remove(&id).is_some();
        let handler = self.handlers.lock().remove(&id);
        existed |= handler.is_some();
        drop(handler);

        let mut removing = BTreeSet::from([id]);
        let mut resending = BTreeSet::new();
        {
            let mut dependents = self.dependents.lock();
            loop {
                let before = resending.len();
                for (&waiting, after) in dependents.iter() {
                    if removing.contains(after) {
                        removing.insert(waiting);
                        resending.insert(waiting);
                    }
                }
                if resending.len() == before {
                    break;
                }
            }
            existed |= dependents.remove(&id).is_some();
            for waiting in &resending {
                dependents.remove(waiting);
            }
        }

        let resend = resending
            .into_iter()
            .filter_map(|waiting| {
                let target = self.route(waiting)?;
                let request = self.request(waiting)?;
                Some((target, request))
            })
            .collect();
        Unregistered { existed, resend }
    }

    /// Drop everything. Handlers are returned so they can be released
    /// outside the lock.
    pub(crate) fn clear(&self) -> Vec<ResponseHandler> {
        self.routes.lock().clear();
        self.requests.write().clear();
        self.dependents.lock().clear();
        self.failures.lock().clear();
        self.to_clear.lock().clear();
        self.handlers.lock().drain().map(|(_, h)| h).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.read().len()
    }
}

/// Bare DC a target points at.
pub(crate) fn target_dc(target: Target) -> DcId {
    bare_dc_id(target.shifted())
}
