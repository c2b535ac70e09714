//! The orchestrator: owns secrets, sessions, the request registry and the
//! delayed-retry queue.

use std::collections::HashMap;
use std::future::Future;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flate2::read::GzDecoder;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth_key::AuthKeyPtr;
use crate::config::{Config, ConfigValues, Mode};
use crate::config_loader::ConfigState;
use crate::context::Context;
use crate::dc::{DEFAULT_MAIN_DC, DcId, ShiftedDcId, bare_dc_id, logout_dc_id};
use crate::dc_options::{DcOptions, DcType};
use crate::delayed::DelayedQueue;
use crate::errors::{InvocationError, RpcError};
use crate::events::Event;
use crate::home::Home;
use crate::pool::SessionPool;
use crate::recovery::AuthWaiters;
use crate::registry::{Registry, Target};
use crate::request::{
    RequestId, RequestIdAllocator, Response, ResponseHandler, SendOptions, SerializedRequest,
};
use crate::schema::{GzipPacked, ID_GZIP_PACKED, ID_RPC_ERROR, LogOut, RawRpcError};
use crate::session::{ConnectionState, RequestState, Session, SessionKind, SessionSpec};
use crate::storage::PersistedState;
use crate::tl::{self, Deserializable, RemoteCall, Serializable, peek_constructor};

type UpdatesHandler = Arc<dyn Fn(&Response) + Send + Sync>;
type GlobalFailHandler = Arc<dyn Fn(&RpcError, &Response) + Send + Sync>;
type StateChangedHandler = Arc<dyn Fn(ShiftedDcId, ConnectionState) + Send + Sync>;
type SessionResetHandler = Arc<dyn Fn(ShiftedDcId) + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    updates:       Option<UpdatesHandler>,
    global_fail:   Option<GlobalFailHandler>,
    state_changed: Option<StateChangedHandler>,
    session_reset: Option<SessionResetHandler>,
}

/// Outcome of the built-in error recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// The multiplexer took care of it; the request stays registered.
    Handled,
    /// Nothing to do internally; the error goes to the fail handler.
    Surface,
}

// ─── Inner ───────────────────────────────────────────────────────────────────

pub(crate) struct Inner {
    pub(crate) me:            Weak<Inner>,
    pub(crate) mode:          Mode,
    pub(crate) ctx:           Context,
    ids:                      RequestIdAllocator,
    pub(crate) registry:      Registry,
    pub(crate) delayed:       Mutex<DelayedQueue>,
    pub(crate) auth:          Mutex<AuthWaiters>,
    pub(crate) pool:          Mutex<SessionPool>,
    pub(crate) dc_options:    RwLock<DcOptions>,
    pub(crate) values:        RwLock<ConfigValues>,
    pub(crate) config:        Mutex<ConfigState>,
    logout_guests:            Mutex<HashMap<ShiftedDcId, RequestId>>,
    hooks:                    RwLock<Hooks>,
    events:                   broadcast::Sender<Event>,
    pub(crate) home:          Home,
    persist_pending:          AtomicBool,
    shut_down:                AtomicBool,
}

impl Inner {
    pub(crate) fn link(&self) -> InstanceLink {
        InstanceLink { inner: self.me.clone() }
    }

    pub(crate) fn is_shut_down(&self) -> bool { self.shut_down.load(Ordering::Acquire) }

    pub(crate) fn emit(&self, event: Event) {
        debug!("[mux] event {event:?}");
        let _ = self.events.send(event);
    }

    fn start(&self) {
        match self.mode {
            Mode::KeysDestroyer => {
                let slots = self.pool.lock().dc_ids();
                info!("[mux] destroyer mode: {} keys to destroy", slots.len());
                for slot in slots {
                    self.get_session(slot);
                }
            }
            Mode::Normal => {
                if let Some(main) = self.main_dc_id() {
                    info!("[mux] starting with main dc {main}");
                    self.get_session(main);
                }
            }
        }
        self.request_config();
    }

    pub(crate) fn main_dc_id(&self) -> Option<DcId> { self.pool.lock().main_dc_id() }

    // ─── Sessions ────────────────────────────────────────────────────────────

    /// Existing session for `shifted` (after resolving the main DC).
    pub(crate) fn find_session(&self, shifted: ShiftedDcId) -> Option<Arc<dyn Session>> {
        let pool = self.pool.lock();
        pool.resolve(shifted).and_then(|s| pool.find(s))
    }

    /// Session for `shifted`, created and started on first use. `None` after
    /// teardown or when `shifted` needs a main DC and there is none.
    pub(crate) fn get_session(&self, shifted: ShiftedDcId) -> Option<Arc<dyn Session>> {
        let resolved = {
            let pool = self.pool.lock();
            if pool.is_closed() {
                return None;
            }
            let resolved = pool.resolve(shifted)?;
            if let Some(existing) = pool.find(resolved) {
                return Some(existing);
            }
            resolved
        };
        self.start_session(resolved)
    }

    fn start_session(&self, shifted: ShiftedDcId) -> Option<Arc<dyn Session>> {
        let bare = bare_dc_id(shifted);
        if bare == 0 {
            return None;
        }
        let (kind, endpoints) = {
            let options = self.dc_options.read();
            let kind = SessionKind::for_dc(shifted, options.dc_type(shifted), self.mode);
            let lookup = if kind == SessionKind::Cdn { DcType::Cdn } else { DcType::Regular };
            (kind, options.lookup(bare, lookup))
        };
        let dc = {
            let mut pool = self.pool.lock();
            if pool.is_closed() {
                return None;
            }
            if self.mode == Mode::KeysDestroyer && pool.find_dc(shifted).is_none() {
                debug!("[mux/pool] no key left for {shifted}, not starting a session");
                return None;
            }
            pool.dc_by_id(shifted)
        };

        let session = self.ctx.sessions.create(SessionSpec {
            kind,
            shifted_dc_id: shifted,
            dc,
            endpoints,
            link: self.link(),
        });

        let inserted = {
            let mut pool = self.pool.lock();
            if pool.is_closed() {
                return None;
            }
            pool.insert(shifted, session)
        };
        let session = match inserted {
            Ok(session) => session,
            Err(existing) => return Some(existing),
        };

        info!("[mux/pool] starting {kind:?} session for {shifted}");
        session.start();
        if self.mode == Mode::KeysDestroyer {
            self.schedule_key_destroy(shifted);
        }
        Some(session)
    }

    pub(crate) fn drain_retired(&self) {
        self.home.post(|inner| {
            let retired = inner.pool.lock().take_retired();
            debug!("[mux/pool] dropping {} killed sessions", retired.len());
            drop(retired);
        });
    }

    /// Requests routed to `shifted` that are not parked somewhere else.
    fn resend_in_flight(&self, shifted: ShiftedDcId, session: &Arc<dyn Session>) {
        for id in self.registry.routed_to(shifted) {
            if self.is_parked(id) {
                continue;
            }
            if let Some(request) = self.registry.request(id) {
                debug!("[mux] resending {id} on replacement session {shifted}");
                session.send_prepared(&request, Duration::ZERO);
            }
        }
    }

    fn is_parked(&self, id: RequestId) -> bool {
        self.delayed.lock().contains(id)
            || self.registry.is_dependent(id)
            || self.auth.lock().is_waiting(id)
    }

    pub(crate) fn kill_session(&self, shifted: ShiftedDcId) {
        let (killed, was_main) = {
            let mut pool = self.pool.lock();
            let was_main = pool.main_dc_id() == Some(shifted);
            (pool.retire(shifted), was_main)
        };
        let Some(killed) = killed else { return };
        info!("[mux/pool] killing session {shifted}");
        killed.kill();
        self.drain_retired();
        if was_main {
            if let Some(session) = self.start_session(shifted) {
                self.resend_in_flight(shifted, &session);
            }
        }
    }

    pub(crate) fn stop_session(&self, shifted: ShiftedDcId) {
        let session = {
            let pool = self.pool.lock();
            if pool.main_dc_id() == Some(shifted) {
                return;
            }
            pool.find(shifted)
        };
        if let Some(session) = session {
            session.stop();
        }
    }

    pub(crate) fn restart_dc(&self, shifted: ShiftedDcId) {
        let sessions = self.pool.lock().sessions_for(bare_dc_id(shifted));
        for session in sessions {
            session.restart();
        }
    }

    fn re_init_connection(&self, dc_id: DcId) {
        let (ids, killed) = {
            let mut pool = self.pool.lock();
            if let Some(dc) = pool.find_dc(dc_id) {
                dc.set_connection_inited(false);
            }
            let ids = pool.shifted_ids_for(dc_id);
            let killed: Vec<_> = ids.iter().filter_map(|&s| pool.retire(s)).collect();
            (ids, killed)
        };
        info!("[mux/pool] re-initialising {} sessions of dc {dc_id}", killed.len());
        for session in &killed {
            session.kill();
        }
        self.drain_retired();
        for shifted in ids {
            if let Some(session) = self.start_session(shifted) {
                session.set_connection_not_inited();
                self.resend_in_flight(shifted, &session);
            }
        }
    }

    /// Returns `true` when the main DC actually changed. Requests in flight
    /// on the replaced sessions are resent along their new routes.
    pub(crate) fn set_main_dc_id(&self, dc_id: DcId) -> bool {
        let (old, killed) = {
            let mut pool = self.pool.lock();
            let Some(old) = pool.main_dc_id() else {
                warn!("[mux] cannot change main dc without a main session");
                return false;
            };
            let mut killed = Vec::new();
            if old != dc_id {
                killed.extend(pool.retire(old));
                killed.extend(pool.retire(dc_id));
            }
            pool.set_main(dc_id);
            (old, killed)
        };
        let changed = old != dc_id;
        if changed {
            info!("[mux] main dc {old} → {dc_id}");
            let mut orphaned = self.registry.routed_to(old);
            orphaned.extend(self.registry.routed_to(dc_id));
            for session in &killed {
                session.kill();
            }
            self.drain_retired();
            self.registry.retarget_main(dc_id);
            self.start_session(dc_id);
            self.resend_orphaned(orphaned);
            self.emit(Event::MainDcChanged(dc_id));
        }
        self.write_keys();
        changed
    }

    /// Resend requests whose session was killed, on their current route.
    fn resend_orphaned(&self, ids: Vec<RequestId>) {
        for id in ids {
            if self.is_parked(id) {
                continue;
            }
            let (Some(target), Some(request)) = (self.registry.route(id), self.registry.request(id)) else {
                continue;
            };
            if let Some(session) = self.get_session(target.shifted()) {
                debug!("[mux] resending {id} → {target:?} after main dc change");
                session.send_prepared(&request, Duration::ZERO);
            }
        }
    }

    fn suggest_main_dc_id(&self, dc_id: DcId) {
        if !self.pool.lock().main_forced() {
            self.set_main_dc_id(dc_id);
        }
    }

    // ─── Sending ─────────────────────────────────────────────────────────────

    pub(crate) fn send(
        &self,
        payload: Vec<u8>,
        mut handler: ResponseHandler,
        options: SendOptions,
    ) -> RequestId {
        let id = self.ids.next();
        let Some(session) = self.get_session(options.to_dc) else {
            warn!("[mux] no session for {} (request {id})", options.to_dc);
            if let Some(fail) = handler.fail.as_mut() {
                let error = RpcError::local("NO_SESSION", format!("no session for dc {}", options.to_dc));
                fail(&error, &Response::new(id, Vec::new()));
            }
            return id;
        };

        let request = SerializedRequest::new(id, payload);
        request.set_needs_layer(options.needs_layer);
        self.registry.store(&request, handler);

        let real = session.shifted_dc_id();
        let target = if options.to_dc == 0 { Target::Main(real) } else { Target::Fixed(real) };
        self.registry.register(id, target);
        debug!("[mux] request {id} → {target:?}");

        if let Some(after_id) = options.after {
            if let Some(after) = self.registry.request(after_id) {
                request.set_after(Some(after));
                if self.registry.is_dependent(after_id) {
                    self.registry.add_dependent(id, after_id);
                    return id;
                }
            }
        }
        session.send_prepared(&request, options.can_wait);
        id
    }

    /// Send a typed call the multiplexer issues on its own behalf.
    pub(crate) fn call<R>(
        &self,
        call: &R,
        to_dc: ShiftedDcId,
        mut done: impl FnMut(R::Return, &Response) + Send + 'static,
        fail: impl FnMut(&RpcError, &Response) + Send + 'static,
    ) -> RequestId
    where
        R: RemoteCall + 'static,
    {
        let handler = ResponseHandler {
            done: Some(Box::new(move |response: &Response| {
                let value = R::Return::from_bytes(&response.reply)?;
                done(value, response);
                Ok(())
            })),
            fail: Some(Box::new(fail)),
            intercept: None,
        };
        self.send(call.to_bytes(), handler, SendOptions { to_dc, ..Default::default() })
    }

    pub(crate) fn cancel(&self, id: RequestId) {
        if id <= 0 {
            return;
        }
        debug!("[mux] cancel request {id}");
        let route = self.registry.route(id);
        let msg_id = self.registry.request(id).map(|r| r.msg_id()).unwrap_or(0);
        self.unregister_request(id);
        if let Some(session) = route.and_then(|t| self.find_session(t.shifted())) {
            session.cancel(id, msg_id);
        }
    }

    pub(crate) fn unregister_request(&self, id: RequestId) {
        let removed = self.registry.unregister(id);
        if removed.existed {
            debug!("[mux] unregistered request {id}, {} pending", self.registry.len());
        } else {
            debug!("[mux] request {id} was not registered");
        }
        self.delayed.lock().remove(id);
        for (target, request) in removed.resend {
            debug!("[mux] releasing dependent {} → {target:?}", request.request_id());
            if let Some(session) = self.get_session(target.shifted()) {
                session.send_prepared(&request, Duration::ZERO);
            }
        }
    }

    // ─── Responses ───────────────────────────────────────────────────────────

    pub(crate) fn process_callback(&self, response: Response) {
        let id = response.request_id;
        let Some(mut handler) = self.registry.take_handler(id) else {
            debug!("[mux] no handler for request {id}");
            self.unregister_request(id);
            return;
        };

        let response = match inflate(response) {
            Ok(response) => response,
            Err((response, error)) => {
                self.handle_error(&response, handler, error);
                return;
            }
        };

        if response.reply.is_empty() {
            let error = RpcError::local("RESPONSE_PARSE_FAILED", "Empty response.");
            self.handle_error(&response, handler, error);
        } else if peek_constructor(&response.reply) == Some(ID_RPC_ERROR) {
            let error = match RawRpcError::from_bytes(&response.reply) {
                Ok(raw) => RpcError::from(raw),
                Err(_) => RpcError::local("RESPONSE_PARSE_FAILED", "Error parse failed."),
            };
            self.handle_error(&response, handler, error);
        } else {
            let parsed = match handler.done.as_mut() {
                Some(done) => done(&response),
                None => Ok(()),
            };
            if let Err(e) = parsed {
                let first = self.registry.request(id).is_none_or(|r| r.mark_parse_failed());
                if first {
                    warn!("[mux] request {id}: response parse failed: {e}");
                    let error = RpcError::local("RESPONSE_PARSE_FAILED", e.to_string());
                    if self.rpc_error_occurred(&response, &mut handler, &error) {
                        debug!("[mux] parse failure of {id} surfaced");
                    }
                }
            }
            drop(handler);
            self.unregister_request(id);
        }
    }

    fn handle_error(&self, response: &Response, mut handler: ResponseHandler, error: RpcError) {
        let id = response.request_id;
        debug!("[mux] request {id}: {error}");
        if self.rpc_error_occurred(response, &mut handler, &error) {
            drop(handler);
            self.unregister_request(id);
        } else if self.registry.request(id).is_some() {
            self.registry.put_handler(id, handler);
        }
    }

    /// Returns `true` when the request is finished and must be unregistered.
    fn rpc_error_occurred(
        &self,
        response: &Response,
        handler: &mut ResponseHandler,
        error: &RpcError,
    ) -> bool {
        if error.is_default_handled() {
            if let Some(intercept) = handler.intercept.as_mut() {
                if intercept(error, response) {
                    return true;
                }
            }
        }
        if self.on_error_default(error, response) == Recovery::Handled {
            return false;
        }
        warn!("[mux] request {} failed: {error}", response.request_id);
        if let Some(fail) = handler.fail.as_mut() {
            fail(error, response);
        }
        true
    }

    pub(crate) fn global_fail(&self, error: &RpcError, response: &Response) {
        let hook = self.hooks.read().global_fail.clone();
        if let Some(hook) = hook {
            hook(error, response);
        }
    }

    fn clear_callbacks(&self) {
        for (id, code) in self.registry.take_clear() {
            let handler = self.registry.take_handler(id);
            if code != 0 {
                if let Some(fail) = handler.and_then(|h| h.fail) {
                    let mut fail = fail;
                    let error = RpcError {
                        code,
                        name: "CLEAR_CALLBACK".into(),
                        value: None,
                        description: format!("request {id} was cleared by its session"),
                    };
                    fail(&error, &Response::new(id, Vec::new()));
                }
            }
            self.unregister_request(id);
        }
    }

    // ─── Delayed queue ───────────────────────────────────────────────────────

    pub(crate) fn next_delayed_deadline(&self) -> Option<Instant> {
        self.delayed.lock().next_deadline()
    }

    pub(crate) fn check_delayed_requests(&self) {
        let due = self.delayed.lock().pop_due(Instant::now());
        for id in due {
            let Some(target) = self.registry.route(id) else {
                warn!("[mux] no route for delayed request {id}");
                continue;
            };
            let Some(request) = self.registry.request(id) else {
                debug!("[mux] delayed request {id} is gone");
                continue;
            };
            if let Some(session) = self.get_session(target.shifted()) {
                debug!("[mux] resending delayed request {id} → {target:?}");
                session.send_prepared(&request, Duration::ZERO);
            }
        }
    }

    // ─── Keys & persistence ──────────────────────────────────────────────────

    pub(crate) fn dc_persistent_key_changed(&self, dc_id: DcId, key: Option<AuthKeyPtr>) {
        if self.mode == Mode::KeysDestroyer {
            return;
        }
        let changed = self.pool.lock().set_key_for_write(dc_id, key);
        if changed {
            debug!("[mux] writing auth keys, called by dc {dc_id}");
            self.write_keys();
        }
    }

    pub(crate) fn write_keys(&self) {
        self.emit(Event::WriteKeys);
        self.request_persist();
    }

    pub(crate) fn request_persist(&self) {
        if self.mode == Mode::KeysDestroyer {
            return;
        }
        if !self.persist_pending.swap(true, Ordering::AcqRel) {
            self.home.post(|inner| inner.persist());
        }
    }

    fn persist(&self) {
        self.persist_pending.store(false, Ordering::Release);
        let config_version = self.values.read().version;
        let state = {
            let pool = self.pool.lock();
            PersistedState {
                main_dc_id: pool.main_dc_id(),
                keys: pool.keys_for_write(),
                config_version,
            }
        };
        let storage = &self.ctx.storage;
        match storage.save(&state) {
            Ok(()) => debug!("[mux] state saved via {} ({} keys)", storage.name(), state.keys.len()),
            Err(e) => warn!("[mux] saving state via {} failed: {e}", storage.name()),
        }
    }

    // ─── Log-out ─────────────────────────────────────────────────────────────

    fn logout(
        &self,
        done: impl FnOnce() + Send + 'static,
        fail: impl FnOnce(&RpcError) + Send + 'static,
    ) {
        let mut done = Some(done);
        let mut fail = Some(fail);
        self.call(
            &LogOut,
            0,
            move |_, _| {
                if let Some(done) = done.take() {
                    done();
                }
            },
            move |error, _| {
                if let Some(fail) = fail.take() {
                    fail(error);
                }
            },
        );
        self.logout_guest_dcs();
    }

    fn logout_guest_dcs(&self) {
        if self.mode == Mode::KeysDestroyer {
            return;
        }
        let main = self.main_dc_id();
        let dc_ids = self.pool.lock().key_dc_ids();
        for dc_id in dc_ids {
            if Some(dc_id) == main || self.dc_options.read().dc_type(dc_id) == DcType::Cdn {
                continue;
            }
            let shifted = logout_dc_id(dc_id);
            let on_done = self.me.clone();
            let on_fail = self.me.clone();
            let id = self.call(
                &LogOut,
                shifted,
                move |_, response| {
                    if let Some(inner) = on_done.upgrade() {
                        inner.logout_guest_done(response.request_id);
                    }
                },
                move |_, response| {
                    if let Some(inner) = on_fail.upgrade() {
                        inner.logout_guest_done(response.request_id);
                    }
                },
            );
            info!("[mux] logging out of guest dc {dc_id} (request {id})");
            self.logout_guests.lock().insert(shifted, id);
        }
    }

    fn logout_guest_done(&self, request_id: RequestId) {
        let shifted = {
            let mut guests = self.logout_guests.lock();
            let found = guests.iter().find(|&(_, &id)| id == request_id).map(|(&s, _)| s);
            if let Some(shifted) = found {
                guests.remove(&shifted);
            }
            found
        };
        if let Some(shifted) = shifted {
            self.kill_session(shifted);
        }
    }

    // ─── Teardown ────────────────────────────────────────────────────────────

    fn teardown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.home.stop();
        let sessions = self.pool.lock().close();
        for session in &sessions {
            session.kill();
        }
        self.delayed.lock().clear();
        self.auth.lock().clear();
        let handlers = self.registry.clear();
        info!(
            "[mux] shut down: {} sessions killed, {} pending handlers dropped",
            sessions.len(),
            handlers.len(),
        );
    }
}

/// Unwrap `gzip_packed` replies.
fn inflate(response: Response) -> Result<Response, (Response, RpcError)> {
    if peek_constructor(&response.reply) != Some(ID_GZIP_PACKED) {
        return Ok(response);
    }
    let packed = match GzipPacked::from_bytes(&response.reply) {
        Ok(packed) => packed,
        Err(e) => {
            let error = RpcError::local("RESPONSE_PARSE_FAILED", format!("bad gzip_packed: {e}"));
            return Err((response, error));
        }
    };
    let mut reply = Vec::new();
    match GzDecoder::new(packed.packed_data.as_slice()).read_to_end(&mut reply) {
        Ok(_) => Ok(Response { reply, ..response }),
        Err(e) => {
            let error = RpcError::local("RESPONSE_PARSE_FAILED", format!("inflate failed: {e}"));
            Err((response, error))
        }
    }
}

// ─── InstanceLink ────────────────────────────────────────────────────────────

/// A session's way back into its instance.
///
/// Holds only a weak reference: once the owning [`Instance`] is gone every
/// method becomes a no-op.
#[derive(Clone)]
pub struct InstanceLink {
    inner: Weak<Inner>,
}

impl InstanceLink {
    fn with<T>(&self, f: impl FnOnce(&Arc<Inner>) -> T) -> Option<T> {
        let inner = self.inner.upgrade()?;
        if inner.is_shut_down() {
            return None;
        }
        Some(f(&inner))
    }

    /// Deliver the reply (or `rpc_error`) for a request.
    pub fn process_callback(&self, response: Response) {
        self.with(|inner| inner.process_callback(response));
    }

    /// Deliver a server-pushed update.
    pub fn process_update(&self, response: Response) {
        self.with(|inner| {
            let hook = inner.hooks.read().updates.clone();
            if let Some(hook) = hook {
                hook(&response);
            }
        });
    }

    pub fn on_state_change(&self, shifted: ShiftedDcId, state: ConnectionState) {
        self.with(|inner| {
            let hook = inner.hooks.read().state_changed.clone();
            if let Some(hook) = hook {
                hook(shifted, state);
            }
        });
    }

    pub fn on_session_reset(&self, shifted: ShiftedDcId) {
        self.with(|inner| {
            let hook = inner.hooks.read().session_reset.clone();
            if let Some(hook) = hook {
                hook(shifted);
            }
        });
    }

    /// A session negotiated (or lost) the persistent key of `dc_id`.
    pub fn dc_persistent_key_changed(&self, dc_id: DcId, key: Option<AuthKeyPtr>) {
        self.with(|inner| inner.dc_persistent_key_changed(dc_id, key));
    }

    /// Destroyer mode: the session believes its key is gone.
    pub fn key_was_possibly_destroyed(&self, shifted: ShiftedDcId) {
        self.with(|inner| inner.key_was_possibly_destroyed(shifted));
    }

    /// The server reported that the key with `key_id` no longer exists.
    pub fn key_destroyed_on_server(&self, shifted: ShiftedDcId, key_id: u64) {
        self.with(|inner| inner.key_destroyed_on_server(shifted, key_id));
    }

    /// Fail or forget many requests at once. A non-zero code is reported to
    /// the fail handler as `CLEAR_CALLBACK`; work happens on the home task.
    pub fn clear_callbacks_delayed(&self, items: Vec<(RequestId, i32)>) {
        self.with(|inner| {
            inner.registry.push_clear(items);
            inner.home.post(|inner| inner.clear_callbacks());
        });
    }

    /// Whether a request still expects a response.
    pub fn has_callback(&self, request_id: RequestId) -> bool {
        self.with(|inner| inner.registry.has_handler(request_id)).unwrap_or(false)
    }

    pub fn restarted_by_timeout(&self, shifted: ShiftedDcId) {
        self.with(|inner| inner.emit(Event::RestartedByTimeout(shifted)));
    }

    /// `true` once the instance is gone.
    pub fn is_closed(&self) -> bool {
        self.with(|_| ()).is_none()
    }
}

// ─── RequestBuilder ──────────────────────────────────────────────────────────

/// Builder returned by [`Instance::request`].
#[must_use = "requests are only sent by calling `send()`"]
pub struct RequestBuilder<'a> {
    inner:   &'a Inner,
    payload: Vec<u8>,
    handler: ResponseHandler,
    options: SendOptions,
}

impl RequestBuilder<'_> {
    /// Called with the successful reply.
    pub fn done<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Response) -> Result<(), tl::Error> + Send + 'static,
    {
        self.handler.done = Some(Box::new(f));
        self
    }

    /// Called with the error the request finally failed with.
    pub fn fail<F>(mut self, f: F) -> Self
    where
        F: FnMut(&RpcError, &Response) + Send + 'static,
    {
        self.handler.fail = Some(Box::new(f));
        self
    }

    /// First look at retryable errors; return `true` to drop the request
    /// instead of retrying it.
    pub fn intercept<F>(mut self, f: F) -> Self
    where
        F: FnMut(&RpcError, &Response) -> bool + Send + 'static,
    {
        self.handler.intercept = Some(Box::new(f));
        self
    }

    pub fn to_dc(mut self, shifted: ShiftedDcId) -> Self {
        self.options.to_dc = shifted;
        self
    }

    pub fn can_wait(mut self, wait: Duration) -> Self {
        self.options.can_wait = wait;
        self
    }

    pub fn after(mut self, request_id: RequestId) -> Self {
        self.options.after = Some(request_id).filter(|&id| id > 0);
        self
    }

    pub fn needs_layer(mut self, value: bool) -> Self {
        self.options.needs_layer = value;
        self
    }

    pub fn send(self) -> RequestId {
        self.inner.send(self.payload, self.handler, self.options)
    }
}

// ─── Instance ────────────────────────────────────────────────────────────────

/// The request multiplexer.
///
/// Owns every session and secret. Dropping it (or calling
/// [`Instance::shutdown`]) kills all sessions and drops pending handlers.
pub struct Instance {
    inner: Arc<Inner>,
}

impl Instance {
    /// Build and start an instance. Unless in destroyer mode, the main
    /// session is started and a config fetch issued right away.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(dc_options: DcOptions, mode: Mode, config: Config, ctx: Context) -> Self {
        let (home, rx) = Home::new(ctx.home_capacity);
        let (events, _) = broadcast::channel(64);

        let (main_dc_id, forced) = match (mode, config.main_dc_id) {
            (Mode::KeysDestroyer, _) => (None, false),
            (Mode::Normal, Some(dc_id)) => (Some(dc_id), true),
            (Mode::Normal, None) => (Some(DEFAULT_MAIN_DC), false),
        };
        let mut pool = SessionPool::new(main_dc_id, forced);
        for key in config.keys {
            let slot = match mode {
                Mode::KeysDestroyer => pool.free_destroy_slot(key.dc_id()),
                Mode::Normal => key.dc_id(),
            };
            if pool.has_key_slot(slot) {
                warn!("[mux] duplicate key for dc {slot} ignored: {key:?}");
                continue;
            }
            pool.set_key_for_write(slot, Some(Arc::clone(&key)));
            pool.add_dc(slot, Some(key));
        }

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            mode,
            ctx,
            ids: RequestIdAllocator::new(),
            registry: Registry::new(),
            delayed: Mutex::new(DelayedQueue::new()),
            auth: Mutex::new(AuthWaiters::default()),
            pool: Mutex::new(pool),
            dc_options: RwLock::new(dc_options),
            values: RwLock::new(ConfigValues::default()),
            config: Mutex::new(ConfigState::default()),
            logout_guests: Mutex::new(HashMap::new()),
            hooks: RwLock::new(Hooks::default()),
            events,
            home,
            persist_pending: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });
        inner.home.start(Arc::downgrade(&inner), rx);
        inner.start();
        Self { inner }
    }

    /// Build a normal-mode instance from whatever the context's storage holds.
    pub fn restore(dc_options: DcOptions, ctx: Context) -> Result<Self, InvocationError> {
        let state = ctx.storage.load()?;
        let version = state.as_ref().map_or(0, |s| s.config_version);
        let config = state.map(PersistedState::into_config).unwrap_or_default();
        info!(
            "[mux] restored {} keys (main dc {:?}) from {}",
            config.keys.len(),
            config.main_dc_id,
            ctx.storage.name(),
        );
        let instance = Self::new(dc_options, Mode::Normal, config, ctx);
        instance.inner.values.write().version = version;
        Ok(instance)
    }

    pub fn mode(&self) -> Mode { self.inner.mode }

    pub fn is_keys_destroyer(&self) -> bool { self.inner.mode == Mode::KeysDestroyer }

    // ─── Requests ────────────────────────────────────────────────────────────

    /// Start building a request around an already-encoded payload.
    pub fn request(&self, payload: impl Into<Vec<u8>>) -> RequestBuilder<'_> {
        RequestBuilder {
            inner:   &self.inner,
            payload: payload.into(),
            handler: ResponseHandler::default(),
            options: SendOptions::default(),
        }
    }

    pub fn send_raw(&self, payload: Vec<u8>, handler: ResponseHandler, options: SendOptions) -> RequestId {
        self.inner.send(payload, handler, options)
    }

    /// Send `call` to the main DC and await its decoded result.
    ///
    /// The request goes out immediately, not when the future is first polled.
    pub fn invoke<R>(&self, call: &R) -> impl Future<Output = Result<R::Return, InvocationError>> + Send + use<R>
    where
        R: RemoteCall + 'static,
        R::Return: Send + 'static,
    {
        self.invoke_on(0, call)
    }

    /// Like [`Instance::invoke`], on a specific shifted DC.
    pub fn invoke_on<R>(
        &self,
        shifted: ShiftedDcId,
        call: &R,
    ) -> impl Future<Output = Result<R::Return, InvocationError>> + Send + use<R>
    where
        R: RemoteCall + 'static,
        R::Return: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_fail = Arc::clone(&tx);
        self.request(call.to_bytes())
            .to_dc(shifted)
            .done(move |response| {
                let result = R::Return::from_bytes(&response.reply);
                let failed = result.as_ref().err().cloned();
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(result.map_err(InvocationError::Decode));
                }
                failed.map_or(Ok(()), Err)
            })
            .fail(move |error, _| {
                if let Some(tx) = on_fail.lock().take() {
                    let _ = tx.send(Err(InvocationError::Rpc(error.clone())));
                }
            })
            .send();
        async move { rx.await.unwrap_or(Err(InvocationError::Dropped)) }
    }

    /// Forget a request. Its fail handler is not called.
    pub fn cancel(&self, request_id: RequestId) { self.inner.cancel(request_id) }

    pub fn state(&self, request_id: RequestId) -> RequestState {
        let remaining = self.inner.delayed.lock().remaining(request_id, Instant::now());
        if let Some(left) = remaining {
            return RequestState::Delayed(left);
        }
        self.inner
            .registry
            .route(request_id)
            .and_then(|t| self.inner.find_session(t.shifted()))
            .map_or(RequestState::Sent, |s| s.request_state(request_id))
    }

    /// Shifted DC a request is currently routed to.
    pub fn request_dc(&self, request_id: RequestId) -> Option<ShiftedDcId> {
        self.inner.registry.route(request_id).map(Target::shifted)
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    pub fn dc_state(&self, shifted: ShiftedDcId) -> ConnectionState {
        self.inner
            .find_session(shifted)
            .map_or(ConnectionState::Disconnected, |s| s.connection_state())
    }

    pub fn dc_transport(&self, shifted: ShiftedDcId) -> String {
        self.inner.find_session(shifted).map(|s| s.transport()).unwrap_or_default()
    }

    pub fn ping(&self) {
        if let Some(session) = self.inner.get_session(0) {
            session.ping();
        }
    }

    /// Reconnect every session.
    pub fn restart(&self) {
        let sessions = self.inner.pool.lock().all_sessions();
        for session in sessions {
            session.restart();
        }
    }

    /// Reconnect every session of the bare DC in `shifted`.
    pub fn restart_dc(&self, shifted: ShiftedDcId) { self.inner.restart_dc(shifted) }

    /// Kill one session. Killing the main session replaces it at once.
    pub fn kill_session(&self, shifted: ShiftedDcId) { self.inner.kill_session(shifted) }

    /// Stop one session; the main session is never stopped.
    pub fn stop_session(&self, shifted: ShiftedDcId) { self.inner.stop_session(shifted) }

    /// Recreate every session of `dc_id` and resend the init preamble.
    pub fn re_init_connection(&self, dc_id: DcId) { self.inner.re_init_connection(dc_id) }

    pub fn session_count(&self) -> usize { self.inner.pool.lock().session_count() }

    // ─── Main DC ─────────────────────────────────────────────────────────────

    pub fn main_dc_id(&self) -> Option<DcId> { self.inner.main_dc_id() }

    /// Switch the main DC and remember the choice.
    pub fn set_main_dc_id(&self, dc_id: DcId) {
        self.inner.set_main_dc_id(dc_id);
    }

    /// Switch the main DC unless one was explicitly chosen already.
    pub fn suggest_main_dc_id(&self, dc_id: DcId) { self.inner.suggest_main_dc_id(dc_id) }

    // ─── Auth ────────────────────────────────────────────────────────────────

    /// Log out on the main DC and on every guest DC holding a key.
    pub fn logout(
        &self,
        done: impl FnOnce() + Send + 'static,
        fail: impl FnOnce(&RpcError) + Send + 'static,
    ) {
        self.inner.logout(done, fail)
    }

    /// Keys to persist, in DC order.
    pub fn keys_for_write(&self) -> Vec<AuthKeyPtr> { self.inner.pool.lock().keys_for_write() }

    /// Destroyer mode: add more keys to destroy.
    pub fn add_keys_for_destroy(&self, keys: Vec<AuthKeyPtr>) { self.inner.add_keys_for_destroy(keys) }

    // ─── Config ──────────────────────────────────────────────────────────────

    pub fn request_config(&self) { self.inner.request_config() }

    /// Re-fetch the config if the last one is older than two minutes (eight
    /// seconds in blocked mode).
    pub fn request_config_if_old(&self) { self.inner.request_config_if_old() }

    pub fn request_cdn_config(&self) { self.inner.request_cdn_config() }

    pub fn config_values(&self) -> ConfigValues { self.inner.values.read().clone() }

    pub fn set_blocked_mode(&self, blocked: bool) { self.inner.values.write().blocked_mode = blocked }

    pub fn dc_options(&self) -> DcOptions { self.inner.dc_options.read().clone() }

    // ─── Hooks & events ──────────────────────────────────────────────────────

    pub fn set_updates_handler(&self, f: impl Fn(&Response) + Send + Sync + 'static) {
        self.inner.hooks.write().updates = Some(Arc::new(f));
    }

    /// Called when authorization is lost on the main DC.
    pub fn set_global_fail_handler(&self, f: impl Fn(&RpcError, &Response) + Send + Sync + 'static) {
        self.inner.hooks.write().global_fail = Some(Arc::new(f));
    }

    pub fn set_state_changed_handler(&self, f: impl Fn(ShiftedDcId, ConnectionState) + Send + Sync + 'static) {
        self.inner.hooks.write().state_changed = Some(Arc::new(f));
    }

    pub fn set_session_reset_handler(&self, f: impl Fn(ShiftedDcId) + Send + Sync + 'static) {
        self.inner.hooks.write().session_reset = Some(Arc::new(f));
    }

    pub fn clear_global_handlers(&self) {
        *self.inner.hooks.write() = Hooks::default();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> { self.inner.events.subscribe() }

    /// Kill every session and drop all pending requests.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
