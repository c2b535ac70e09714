//! A scripted cluster: sessions record what they are asked to send and the
//! test answers on their behalf.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use layer_mux::schema::{DcOption, GetConfig, RawRpcError, ServerConfig};
use layer_mux::tl::Serializable;
use layer_mux::{
    ConnectionState, Event, InstanceLink, RequestId, RequestState, Response, SerializedRequest,
    Session, SessionKind, SessionSpec, ShiftedDcId,
};

pub struct MockSession {
    pub shifted:   ShiftedDcId,
    pub kind:      SessionKind,
    link:          InstanceLink,
    sent:          Mutex<Vec<SerializedRequest>>,
    cancelled:     Mutex<Vec<RequestId>>,
    started:       AtomicBool,
    killed:        AtomicBool,
    pub restarts:  AtomicUsize,
    pub not_inited: AtomicUsize,
}

impl MockSession {
    pub fn sent(&self) -> Vec<SerializedRequest> { self.sent.lock().clone() }

    pub fn sent_ids(&self) -> Vec<RequestId> {
        self.sent.lock().iter().map(|r| r.request_id()).collect()
    }

    /// Most recent request whose payload equals `payload`.
    pub fn find(&self, payload: &[u8]) -> Option<SerializedRequest> {
        self.sent.lock().iter().rev().find(|r| r.payload() == payload).cloned()
    }

    pub fn count(&self, payload: &[u8]) -> usize {
        self.sent.lock().iter().filter(|r| r.payload() == payload).count()
    }

    pub fn cancelled(&self) -> Vec<RequestId> { self.cancelled.lock().clone() }

    pub fn is_killed(&self) -> bool { self.killed.load(Ordering::SeqCst) }

    pub fn is_started(&self) -> bool { self.started.load(Ordering::SeqCst) }

    pub fn reply(&self, request_id: RequestId, reply: Vec<u8>) {
        self.link.process_callback(Response::new(request_id, reply));
    }

    pub fn reply_error(&self, request_id: RequestId, code: i32, message: &str) {
        let error = RawRpcError { error_code: code, error_message: message.into() };
        self.reply(request_id, error.to_bytes());
    }

    pub fn link(&self) -> InstanceLink { self.link.clone() }
}

impl Session for MockSession {
    fn shifted_dc_id(&self) -> ShiftedDcId { self.shifted }
    fn start(&self) { self.started.store(true, Ordering::SeqCst) }
    fn stop(&self) {}
    fn kill(&self) { self.killed.store(true, Ordering::SeqCst) }
    fn restart(&self) { self.restarts.fetch_add(1, Ordering::SeqCst); }
    fn set_connection_not_inited(&self) { self.not_inited.fetch_add(1, Ordering::SeqCst); }

    fn send_prepared(&self, request: &SerializedRequest, _can_wait: Duration) {
        self.sent.lock().push(request.clone());
    }

    fn cancel(&self, request_id: RequestId, _msg_id: u64) {
        self.cancelled.lock().push(request_id);
    }

    fn request_state(&self, _request_id: RequestId) -> RequestState { RequestState::Sent }
    fn connection_state(&self) -> ConnectionState { ConnectionState::Connected }
    fn transport(&self) -> String { "mock".into() }
    fn ping(&self) {}
}

/// Every session the instance ever created, in creation order.
#[derive(Clone, Default)]
pub struct Cluster {
    sessions: Arc<Mutex<Vec<Arc<MockSession>>>>,
}

impl Cluster {
    pub fn factory(&self) -> impl Fn(SessionSpec) -> Arc<dyn Session> + Send + Sync + 'static {
        let sessions = Arc::clone(&self.sessions);
        move |spec: SessionSpec| {
            let session = Arc::new(MockSession {
                shifted:    spec.shifted_dc_id,
                kind:       spec.kind,
                link:       spec.link,
                sent:       Mutex::new(Vec::new()),
                cancelled:  Mutex::new(Vec::new()),
                started:    AtomicBool::new(false),
                killed:     AtomicBool::new(false),
                restarts:   AtomicUsize::new(0),
                not_inited: AtomicUsize::new(0),
            });
            sessions.lock().push(Arc::clone(&session));
            session as Arc<dyn Session>
        }
    }

    /// The live session for `shifted`.
    pub fn session(&self, shifted: ShiftedDcId) -> Arc<MockSession> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|s| s.shifted == shifted && !s.is_killed())
            .cloned()
            .unwrap_or_else(|| panic!("no live session for {shifted}"))
    }

    pub fn all(&self, shifted: ShiftedDcId) -> Vec<Arc<MockSession>> {
        self.sessions.lock().iter().filter(|s| s.shifted == shifted).cloned().collect()
    }

    pub fn created(&self) -> Vec<ShiftedDcId> {
        self.sessions.lock().iter().map(|s| s.shifted).collect()
    }
}

pub fn server_config() -> ServerConfig {
    let expires = chrono::Utc::now().timestamp() as i32 + 3600;
    ServerConfig {
        expires,
        this_dc: 2,
        dc_options: vec![
            DcOption { id: 2, ip_address: "10.0.0.2".into(), port: 443, ..Default::default() },
            DcOption { id: 4, ip_address: "10.0.0.4".into(), port: 443, ..Default::default() },
        ],
        me_url_prefix: "https://t.me/".into(),
        ..Default::default()
    }
}

/// Answer the startup config request on the main session.
pub fn answer_config(cluster: &Cluster, main: ShiftedDcId) {
    let session = cluster.session(main);
    let request = session.find(&GetConfig.to_bytes()).expect("config was requested");
    session.reply(request.request_id(), server_config().to_bytes());
}

/// Let the home task run whatever was posted to it.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
