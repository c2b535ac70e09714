//! layer-mux-demo: an Instance talking to an in-process loopback cluster.
//!
//! Every "DC" answers from a spawned task after a short delay. The first
//! attempt of each echo is refused with `FLOOD_WAIT_1`, and DC 2 sends
//! `"moved"` echoes to DC 4, so the run shows backoff and migration.
//!
//!   RUST_LOG=layer_mux=debug cargo run -p layer-mux-demo

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use layer_mux::schema::{
    CdnConfig, DcOption, DestroyAuthKey, DestroyAuthKeyRes, GetCdnConfig, GetConfig, LogOut,
    RawRpcError, ServerConfig,
};
use layer_mux::tl::{Blob, RemoteCall, Serializable};
use layer_mux::{
    BinaryFileBackend, Config, ConnectionState, Context, DcOptions, Instance, InstanceLink,
    Mode, RequestId, RequestState, Response, SerializedRequest, Session, SessionSpec, ShiftedDcId,
    dc::bare_dc_id,
};

const ECHO_ID: u32 = 0x0ec0_0ec0;
const REPLY_DELAY: Duration = Duration::from_millis(20);

/// Loopback-only call: the server sends the bytes back.
struct Echo(Vec<u8>);

impl Serializable for Echo {
    fn serialize(&self, buf: &mut Vec<u8>) {
        ECHO_ID.serialize(buf);
        buf.extend_from_slice(&self.0);
    }
}

impl RemoteCall for Echo {
    type Return = Blob;
}

// ─── Loopback session ────────────────────────────────────────────────────────

struct Loopback {
    shifted: ShiftedDcId,
    link:    InstanceLink,
    /// Requests refused once already.
    seen:    Mutex<HashSet<RequestId>>,
    state:   Mutex<ConnectionState>,
}

impl Loopback {
    fn answer(&self, request: &SerializedRequest) -> Vec<u8> {
        let payload = request.payload();
        if payload == GetConfig.to_bytes().as_slice() {
            return server_config().to_bytes();
        }
        if payload == GetCdnConfig.to_bytes().as_slice() {
            return CdnConfig::default().to_bytes();
        }
        if payload == LogOut.to_bytes().as_slice() {
            return true.to_bytes();
        }
        if payload == DestroyAuthKey.to_bytes().as_slice() {
            return DestroyAuthKeyRes::Ok.to_bytes();
        }
        let Some(body) = payload.strip_prefix(&ECHO_ID.to_le_bytes()) else {
            return rpc_error(400, "METHOD_INVALID");
        };
        if self.seen.lock().insert(request.request_id()) {
            return rpc_error(420, "FLOOD_WAIT_1");
        }
        if body == b"moved" && bare_dc_id(self.shifted) == 2 {
            return rpc_error(303, "USER_MIGRATE_4");
        }
        body.to_vec()
    }
}

impl Session for Loopback {
    fn shifted_dc_id(&self) -> ShiftedDcId { self.shifted }

    fn start(&self) {
        *self.state.lock() = ConnectionState::Connected;
        self.link.on_state_change(self.shifted, ConnectionState::Connected);
    }

    fn stop(&self) { *self.state.lock() = ConnectionState::Disconnected }

    fn kill(&self) { self.stop() }

    fn restart(&self) { self.start() }

    fn set_connection_not_inited(&self) {}

    fn send_prepared(&self, request: &SerializedRequest, _can_wait: Duration) {
        let reply = self.answer(request);
        let id = request.request_id();
        let link = self.link.clone();
        tokio::spawn(async move {
            sleep(REPLY_DELAY).await;
            link.process_callback(Response::new(id, reply));
        });
    }

    fn cancel(&self, _request_id: RequestId, _msg_id: u64) {}

    fn request_state(&self, _request_id: RequestId) -> RequestState { RequestState::Sent }

    fn connection_state(&self) -> ConnectionState { *self.state.lock() }

    fn transport(&self) -> String { "loopback".into() }

    fn ping(&self) {}
}

fn rpc_error(code: i32, message: &str) -> Vec<u8> {
    RawRpcError { error_code: code, error_message: message.into() }.to_bytes()
}

fn server_config() -> ServerConfig {
    ServerConfig {
        date: chrono::Utc::now().timestamp() as i32,
        expires: chrono::Utc::now().timestamp() as i32 + 3600,
        this_dc: 2,
        dc_options: (1..=5)
            .map(|id| DcOption {
                id,
                ip_address: format!("127.0.0.{id}"),
                port: 443,
                ..Default::default()
            })
            .collect(),
        me_url_prefix: "https://t.me/".into(),
        ..Default::default()
    }
}

fn loopback(spec: SessionSpec) -> Arc<dyn Session> {
    println!("🔌 new {:?} session for {}", spec.kind, spec.shifted_dc_id);
    Arc::new(Loopback {
        shifted: spec.shifted_dc_id,
        link:    spec.link,
        seen:    Mutex::new(HashSet::new()),
        state:   Mutex::new(ConnectionState::Disconnected),
    })
}

// ─── main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "layer_mux=info"); }
    }
    env_logger::init();
    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let state_path = std::env::temp_dir().join("layer-mux-demo.state");
    let ctx = Context::new(loopback).with_storage(Arc::new(BinaryFileBackend::new(state_path)));
    let instance = Instance::new(DcOptions::production(), Mode::Normal, Config::new(), ctx);

    let mut events = instance.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("📣 {event:?}");
        }
    });

    let hello = instance.invoke(&Echo(b"hello".to_vec()));
    let moved = instance.invoke(&Echo(b"moved".to_vec()));
    let (hello, moved) = tokio::join!(hello, moved);
    println!("✅ hello → {:?}", String::from_utf8_lossy(&hello?.0));
    println!("✅ moved → {:?} (main dc now {:?})", String::from_utf8_lossy(&moved?.0), instance.main_dc_id());

    let cdn = instance.invoke(&GetCdnConfig).await?;
    println!("✅ {} cdn keys", cdn.public_keys.len());

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let on_fail = Arc::clone(&tx);
    instance.logout(
        move || {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(Ok(()));
            }
        },
        move |e| {
            if let Some(tx) = on_fail.lock().take() {
                let _ = tx.send(Err(e.clone()));
            }
        },
    );
    match rx.await? {
        Ok(()) => println!("👋 logged out"),
        Err(e) => println!("⚠ log-out failed: {e}"),
    }

    println!("🧹 {} sessions, shutting down", instance.session_count());
    instance.shutdown();
    Ok(())
}
