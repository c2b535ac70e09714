//! Built-in handling of recoverable RPC errors.
//!
//! [`classify`] is a pure function from an error to what should be done about
//! it; the `impl Inner` block below carries each class out.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Mode;
use crate::dc::{DcId, ShiftedDcId, bare_dc_id};
use crate::errors::RpcError;
use crate::events::Event;
use crate::instance::{Inner, Recovery};
use crate::registry::target_dc;
use crate::request::{RequestId, Response};
use crate::retry::RetryContext;
use crate::schema::{ExportAuthorization, ExportedAuthorization, ImportAuthorization};

/// Extra slack added to every backoff deadline.
const BACKOFF_SLACK: Duration = Duration::from_millis(10);

/// `SLOWMODE_WAIT_n` is only waited out below this many seconds.
const SLOWMODE_MAX_WAIT: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backoff {
    Transport,
    Flood(u32),
    PremiumFlood(u32),
    Slowmode(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    Migrate(DcId),
    Backoff(Backoff),
    Unauthorized { bad_guest: bool },
    ConnectionNotInited,
    LangCodeInvalid,
    MsgWait,
    Frozen,
    Other,
}

/// Decide how `error` is handled. `bad_guest_tried` tells whether this
/// request already went through re-authorization for `FILE_ID_INVALID`.
pub(crate) fn classify(error: &RpcError, bad_guest_tried: bool) -> ErrorClass {
    let name = error.name.as_str();
    match (name, error.value) {
        ("FILE_MIGRATE" | "PHONE_MIGRATE" | "NETWORK_MIGRATE" | "USER_MIGRATE", Some(dc)) => {
            return ErrorClass::Migrate(dc as DcId);
        }
        ("FLOOD_WAIT", Some(secs)) => return ErrorClass::Backoff(Backoff::Flood(secs)),
        ("FLOOD_PREMIUM_WAIT", Some(secs)) => return ErrorClass::Backoff(Backoff::PremiumFlood(secs)),
        ("SLOWMODE_WAIT", Some(secs)) if secs < SLOWMODE_MAX_WAIT => {
            return ErrorClass::Backoff(Backoff::Slowmode(secs));
        }
        _ => {}
    }
    if error.is_transport() {
        return ErrorClass::Backoff(Backoff::Transport);
    }

    let bad_guest = error.code == 400 && name == "FILE_ID_INVALID";
    if (error.code == 401 && error.full_name() != "AUTH_KEY_PERM_EMPTY") || (bad_guest && !bad_guest_tried) {
        return ErrorClass::Unauthorized { bad_guest };
    }

    match name {
        "CONNECTION_NOT_INITED" | "CONNECTION_LAYER_INVALID" => ErrorClass::ConnectionNotInited,
        "CONNECTION_LANG_CODE_INVALID" => ErrorClass::LangCodeInvalid,
        "MSG_WAIT_TIMEOUT" | "MSG_WAIT_FAILED" => ErrorClass::MsgWait,
        "FROZEN_METHOD_INVALID" => ErrorClass::Frozen,
        _ => ErrorClass::Other,
    }
}

// ─── AuthWaiters ─────────────────────────────────────────────────────────────

/// Requests parked until an authorization is copied to their DC.
#[derive(Default)]
pub(crate) struct AuthWaiters {
    waiters:   HashMap<DcId, Vec<(RequestId, RpcError)>>,
    bad_guest: HashSet<RequestId>,
}

impl AuthWaiters {
    pub(crate) fn is_waiting(&self, id: RequestId) -> bool {
        self.waiters.values().any(|list| list.iter().any(|(w, _)| *w == id))
    }

    /// Park `id`; `true` when it is the first waiter for `dc_id`.
    fn push(&mut self, dc_id: DcId, id: RequestId, error: RpcError) -> bool {
        let list = self.waiters.entry(dc_id).or_default();
        list.push((id, error));
        list.len() == 1
    }

    fn take(&mut self, dc_id: DcId) -> Vec<(RequestId, RpcError)> {
        self.waiters.remove(&dc_id).unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.waiters.clear();
        self.bad_guest.clear();
    }
}

// ─── Recovery actions ────────────────────────────────────────────────────────

impl Inner {
    pub(crate) fn on_error_default(&self, error: &RpcError, response: &Response) -> Recovery {
        let id = response.request_id;
        if id <= 0 {
            return Recovery::Surface;
        }
        let bad_guest_tried = self.auth.lock().bad_guest.contains(&id);
        let class = classify(error, bad_guest_tried);
        debug!("[mux/recovery] request {id}: {error} → {class:?}");

        let outcome = match class {
            ErrorClass::Migrate(dc_id) => self.migrate(id, dc_id),
            ErrorClass::Backoff(kind) => self.backoff(id, error, kind),
            ErrorClass::Unauthorized { bad_guest } => {
                return self.unauthorized(id, error, bad_guest, response);
            }
            ErrorClass::ConnectionNotInited => self.resend_not_inited(id),
            ErrorClass::LangCodeInvalid => {
                self.ctx.language.reset_to_default();
                Recovery::Surface
            }
            ErrorClass::MsgWait => self.msg_wait(id, error),
            ErrorClass::Frozen => {
                self.emit(Event::FrozenErrorReceived);
                Recovery::Surface
            }
            ErrorClass::Other => Recovery::Surface,
        };
        if outcome == Recovery::Surface {
            self.auth.lock().bad_guest.remove(&id);
        }
        outcome
    }

    fn migrate(&self, id: RequestId, dc_id: DcId) -> Recovery {
        let Some(route) = self.registry.route(id) else {
            warn!("[mux/recovery] migrate of unrouted request {id}");
            return Recovery::Surface;
        };
        let Some(request) = self.registry.request(id) else { return Recovery::Surface };
        if dc_id <= 0 {
            return Recovery::Surface;
        }
        let target = route.moved_to(dc_id);
        if route.follows_main() && self.set_main_dc_id(dc_id) {
            info!("[mux/recovery] request {id} follows the main dc to {dc_id}");
            return Recovery::Handled;
        }
        let Some(session) = self.get_session(target.shifted()) else { return Recovery::Surface };
        self.registry.register(id, target);
        info!("[mux/recovery] request {id} migrates {} → {}", route.shifted(), target.shifted());
        session.send_prepared(&request, Duration::ZERO);
        Recovery::Handled
    }

    fn backoff(&self, id: RequestId, error: &RpcError, kind: Backoff) -> Recovery {
        let (fail_count, server_wait) = match kind {
            Backoff::Transport => (self.registry.record_failure(id), None),
            Backoff::Flood(secs) | Backoff::PremiumFlood(secs) | Backoff::Slowmode(secs) => {
                (1, Some(Duration::from_secs(u64::from(secs))))
            }
        };
        let ctx = RetryContext {
            fail_count: NonZeroU32::new(fail_count).unwrap_or(NonZeroU32::MIN),
            server_wait,
            error,
        };
        let delay = match self.ctx.retry_policy.should_retry(&ctx) {
            ControlFlow::Continue(delay) => delay,
            ControlFlow::Break(()) => return Recovery::Surface,
        };
        let at = Instant::now() + delay + BACKOFF_SLACK;
        let rearm = self.delayed.lock().schedule(id, at);
        if rearm {
            self.home.rearm();
        }
        debug!("[mux/recovery] request {id} delayed by {delay:?} (attempt {fail_count})");
        if let Backoff::PremiumFlood(_) = kind {
            self.emit(Event::NonPremiumDelayed(id));
        }
        Recovery::Handled
    }

    fn unauthorized(&self, id: RequestId, error: &RpcError, bad_guest: bool, response: &Response) -> Recovery {
        let route = self.registry.route(id);
        let dc_id = route.map_or(0, target_dc);
        let main = self.main_dc_id();
        let Some(route) = route.filter(|_| dc_id != 0 && main.is_some() && main != Some(dc_id)) else {
            if !bad_guest && self.mode == Mode::Normal {
                self.global_fail(error, response);
            }
            return Recovery::Surface;
        };

        let first = {
            let mut auth = self.auth.lock();
            if bad_guest {
                auth.bad_guest.insert(id);
            }
            auth.push(dc_id, id, error.clone())
        };
        info!("[mux/auth] request {id} waits for authorization on dc {dc_id}");
        if first {
            self.export_authorization(route.shifted());
        }
        Recovery::Handled
    }

    fn export_authorization(&self, target: ShiftedDcId) {
        let dc_id = bare_dc_id(target);
        info!("[mux/auth] exporting authorization to dc {dc_id}");
        let on_done = self.me.clone();
        let on_fail = self.me.clone();
        self.call(
            &ExportAuthorization { dc_id },
            0,
            move |exported, _| {
                if let Some(inner) = on_done.upgrade() {
                    inner.import_authorization(target, exported);
                }
            },
            move |error, _| {
                if let Some(inner) = on_fail.upgrade() {
                    inner.auth_transfer_failed(dc_id, error);
                }
            },
        );
    }

    fn import_authorization(&self, target: ShiftedDcId, exported: ExportedAuthorization) {
        let dc_id = bare_dc_id(target);
        debug!("[mux/auth] importing authorization on {target}");
        let on_done = self.me.clone();
        let on_fail = self.me.clone();
        self.call(
            &ImportAuthorization { id: exported.id, bytes: exported.bytes },
            target,
            move |_, _| {
                if let Some(inner) = on_done.upgrade() {
                    inner.authorization_imported(dc_id);
                }
            },
            move |error, _| {
                if let Some(inner) = on_fail.upgrade() {
                    inner.auth_transfer_failed(dc_id, error);
                }
            },
        );
    }

    fn authorization_imported(&self, dc_id: DcId) {
        let waiters = self.auth.lock().take(dc_id);
        info!("[mux/auth] authorized on dc {dc_id}, replaying {} requests", waiters.len());
        for (id, _) in waiters {
            let Some(request) = self.registry.request(id) else {
                debug!("[mux/auth] waiter {id} is gone");
                continue;
            };
            let Some(target) = self.registry.retarget(id, dc_id) else { continue };
            if target.follows_main() && self.set_main_dc_id(dc_id) {
                continue;
            }
            if let Some(session) = self.get_session(target.shifted()) {
                session.send_prepared(&request, Duration::ZERO);
            }
        }
    }

    fn auth_transfer_failed(&self, dc_id: DcId, error: &RpcError) {
        let waiters = {
            let mut auth = self.auth.lock();
            let waiters = auth.take(dc_id);
            for (id, _) in &waiters {
                auth.bad_guest.remove(id);
            }
            waiters
        };
        warn!("[mux/auth] authorization transfer to dc {dc_id} failed: {error}; {} requests fail", waiters.len());
        for (id, original) in waiters {
            let handler = self.registry.take_handler(id);
            self.unregister_request(id);
            if let Some(mut fail) = handler.and_then(|h| h.fail) {
                fail(&original, &Response::new(id, Vec::new()));
            }
        }
    }

    fn resend_not_inited(&self, id: RequestId) -> Recovery {
        let Some(request) = self.registry.request(id) else { return Recovery::Surface };
        let Some(route) = self.registry.route(id) else { return Recovery::Surface };
        let Some(session) = self.get_session(route.shifted()) else { return Recovery::Surface };
        debug!("[mux/recovery] request {id}: connection not inited on {}", route.shifted());
        request.set_needs_layer(true);
        session.set_connection_not_inited();
        session.send_prepared(&request, Duration::ZERO);
        Recovery::Handled
    }

    fn msg_wait(&self, id: RequestId, error: &RpcError) -> Recovery {
        let Some(request) = self.registry.request(id) else { return Recovery::Surface };
        let Some(after) = request.after() else {
            warn!("[mux/recovery] {error} for request {id} without a dependency");
            return Recovery::Surface;
        };
        let Some(route) = self.registry.route(id) else { return Recovery::Surface };
        let after_id = after.request_id();
        let dc_id = target_dc(route);

        {
            let mut auth = self.auth.lock();
            if let Some(list) = auth.waiters.get_mut(&dc_id) {
                if list.iter().any(|(w, _)| *w == after_id) {
                    debug!("[mux/recovery] request {id} follows {after_id} into the auth queue");
                    list.push((id, error.clone()));
                    return Recovery::Handled;
                }
            }
        }

        if self.delayed.lock().insert_after(id, after_id) {
            debug!("[mux/recovery] request {id} follows {after_id} into the delayed queue");
            return Recovery::Handled;
        }

        if self.registry.route(after_id).is_some_and(|t| t.shifted() == route.shifted()) {
            debug!("[mux/recovery] request {id} waits for {after_id}");
            self.registry.add_dependent(id, after_id);
            return Recovery::Handled;
        }

        debug!("[mux/recovery] dependency {after_id} of {id} is done, resending");
        request.set_after(None);
        let Some(session) = self.get_session(route.shifted()) else { return Recovery::Surface };
        session.send_prepared(&request, Duration::ZERO);
        Recovery::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: i32, msg: &str) -> RpcError { RpcError::from_telegram(code, msg) }

    #[test]
    fn migrations_carry_the_target_dc() {
        assert_eq!(classify(&err(303, "USER_MIGRATE_4"), false), ErrorClass::Migrate(4));
        assert_eq!(classify(&err(303, "FILE_MIGRATE_5"), false), ErrorClass::Migrate(5));
        assert_eq!(classify(&err(303, "STATS_MIGRATE_5"), false), ErrorClass::Other);
    }

    #[test]
    fn waits_and_transport_errors_back_off() {
        assert_eq!(classify(&err(420, "FLOOD_WAIT_7"), false), ErrorClass::Backoff(Backoff::Flood(7)));
        assert_eq!(
            classify(&err(420, "FLOOD_PREMIUM_WAIT_3"), false),
            ErrorClass::Backoff(Backoff::PremiumFlood(3)),
        );
        assert_eq!(classify(&err(420, "SLOWMODE_WAIT_2"), false), ErrorClass::Backoff(Backoff::Slowmode(2)));
        assert_eq!(classify(&err(420, "SLOWMODE_WAIT_30"), false), ErrorClass::Other);
        assert_eq!(classify(&err(-404, "TRANSPORT"), false), ErrorClass::Backoff(Backoff::Transport));
        assert_eq!(classify(&err(500, "INTERNAL"), false), ErrorClass::Backoff(Backoff::Transport));
    }

    #[test]
    fn unauthorized_and_bad_guest() {
        assert_eq!(
            classify(&err(401, "AUTH_KEY_UNREGISTERED"), false),
            ErrorClass::Unauthorized { bad_guest: false },
        );
        assert_eq!(classify(&err(401, "AUTH_KEY_PERM_EMPTY"), false), ErrorClass::Other);
        assert_eq!(
            classify(&err(400, "FILE_ID_INVALID"), false),
            ErrorClass::Unauthorized { bad_guest: true },
        );
        assert_eq!(classify(&err(400, "FILE_ID_INVALID"), true), ErrorClass::Other);
    }

    #[test]
    fn named_classes() {
        assert_eq!(classify(&err(400, "CONNECTION_NOT_INITED"), false), ErrorClass::ConnectionNotInited);
        assert_eq!(classify(&err(400, "CONNECTION_LAYER_INVALID"), false), ErrorClass::ConnectionNotInited);
        assert_eq!(classify(&err(400, "CONNECTION_LANG_CODE_INVALID"), false), ErrorClass::LangCodeInvalid);
        assert_eq!(classify(&err(400, "MSG_WAIT_FAILED"), false), ErrorClass::MsgWait);
        assert_eq!(classify(&err(400, "MSG_WAIT_TIMEOUT"), false), ErrorClass::MsgWait);
        assert_eq!(classify(&err(420, "FROZEN_METHOD_INVALID"), false), ErrorClass::Frozen);
        assert_eq!(classify(&err(400, "PEER_ID_INVALID"), false), ErrorClass::Other);
    }

    #[test]
    fn auth_waiters_report_first_per_dc() {
        let mut auth = AuthWaiters::default();
        let e = err(401, "AUTH_KEY_UNREGISTERED");
        assert!(auth.push(4, 1, e.clone()));
        assert!(!auth.push(4, 2, e.clone()));
        assert!(auth.push(5, 3, e));
        assert!(auth.is_waiting(2));
        let ids: Vec<_> = auth.take(4).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, [1, 2]);
        assert!(!auth.is_waiting(1));
    }
}
