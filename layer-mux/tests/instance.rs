mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;

use common::{Cluster, answer_config, drain, settle};
use layer_mux::dc::{BASE_UPLOAD_DC_SHIFT, shift_dc_id};
use layer_mux::schema::{CdnConfig, CdnPublicKey, GetCdnConfig, GzipPacked};
use layer_mux::tl::{self, Serializable};
use layer_mux::{
    AuthKey, Config, Context, DcOptions, Event, InMemoryBackend, Instance, InvocationError, Mode,
    PersistedState, RequestState, RpcError, StateBackend,
};

fn boot(config: Config) -> (Instance, Cluster) {
    let cluster = Cluster::default();
    let ctx = Context::new(cluster.factory());
    let instance = Instance::new(DcOptions::production(), Mode::Normal, config, ctx);
    (instance, cluster)
}

fn booted() -> (Instance, Cluster) {
    let (instance, cluster) = boot(Config::new().with_main_dc(2));
    answer_config(&cluster, 2);
    (instance, cluster)
}

type Seen = Arc<Mutex<Vec<RpcError>>>;

fn recorder() -> (Seen, impl FnMut(&RpcError, &layer_mux::Response) + Send + 'static) {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    (seen, move |e: &RpcError, _: &layer_mux::Response| sink.lock().push(e.clone()))
}

#[tokio::test]
async fn startup_fetches_and_applies_config() {
    let (instance, cluster) = boot(Config::new());
    let mut events = instance.subscribe();
    assert_eq!(instance.main_dc_id(), Some(2));
    assert!(cluster.session(2).is_started());

    answer_config(&cluster, 2);
    settle().await;
    let loaded = drain(&mut events).into_iter().filter(|e| *e == Event::ConfigLoaded).count();
    assert_eq!(loaded, 1);
    let options = instance.dc_options();
    assert_eq!(options.lookup(4, layer_mux::DcType::Regular)[0].ip, "10.0.0.4");
    assert_eq!(instance.config_values().me_url_prefix, "https://t.me/");
}

#[tokio::test]
async fn done_handler_gets_the_reply() {
    let (instance, cluster) = booted();
    let got = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&got);
    let id = instance
        .request(vec![1, 2, 3, 4])
        .done(move |r| {
            sink.lock().push(r.reply.clone());
            Ok(())
        })
        .send();

    let main = cluster.session(2);
    assert_eq!(main.sent_ids().last(), Some(&id));
    main.reply(id, vec![9, 9, 9, 9]);
    assert_eq!(*got.lock(), [vec![9, 9, 9, 9]]);
    assert_eq!(instance.request_dc(id), None);
    assert!(!main.link().has_callback(id));
}

#[tokio::test]
async fn plain_errors_reach_the_fail_handler() {
    let (instance, cluster) = booted();
    let (seen, fail) = recorder();
    let id = instance.request(vec![0; 4]).fail(fail).send();
    cluster.session(2).reply_error(id, 400, "PEER_ID_INVALID");
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].code, 400);
    assert_eq!(seen[0].name, "PEER_ID_INVALID");
}

#[tokio::test]
async fn migrate_moves_request_and_main_dc() {
    let (instance, cluster) = booted();
    let mut events = instance.subscribe();
    let done = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&done);
    let id = instance
        .request(vec![5; 4])
        .done(move |_| {
            *counter.lock() += 1;
            Ok(())
        })
        .send();

    let old_main = cluster.session(2);
    old_main.reply_error(id, 303, "USER_MIGRATE_4");

    assert_eq!(instance.main_dc_id(), Some(4));
    assert!(old_main.is_killed());
    assert_eq!(instance.request_dc(id), Some(4));
    let new_main = cluster.session(4);
    assert_eq!(new_main.sent_ids().iter().filter(|&&r| r == id).count(), 1);
    assert!(drain(&mut events).contains(&Event::MainDcChanged(4)));

    new_main.reply(id, vec![1; 4]);
    assert_eq!(*done.lock(), 1);
}

#[tokio::test]
async fn fixed_requests_migrate_without_moving_main() {
    let (instance, cluster) = booted();
    let id = instance.request(vec![5; 4]).to_dc(2).done(|_| Ok(())).send();
    cluster.session(2).reply_error(id, 303, "FILE_MIGRATE_4");
    assert_eq!(instance.main_dc_id(), Some(2));
    assert!(cluster.session(4).sent_ids().contains(&id));
}

#[tokio::test]
async fn main_dc_change_resends_requests_left_on_the_old_main() {
    let (instance, cluster) = booted();
    let moved = instance.request(vec![5; 4]).done(|_| Ok(())).send();
    let waiting = instance.request(vec![6; 4]).done(|_| Ok(())).send();
    let pinned = instance.request(vec![7; 4]).to_dc(2).done(|_| Ok(())).send();

    cluster.session(2).reply_error(moved, 303, "USER_MIGRATE_4");

    assert_eq!(instance.main_dc_id(), Some(4));
    let new_main = cluster.session(4);
    let sent = new_main.sent_ids();
    assert_eq!(sent.iter().filter(|&&r| r == moved).count(), 1);
    assert_eq!(sent.iter().filter(|&&r| r == waiting).count(), 1);
    assert_eq!(instance.request_dc(pinned), Some(2));
    assert!(cluster.session(2).sent_ids().contains(&pinned));
}

#[tokio::test]
async fn upload_migration_leaves_the_main_dc_alone() {
    let (instance, cluster) = booted();
    let upload = shift_dc_id(0, BASE_UPLOAD_DC_SHIFT);
    let id = instance.request(vec![8; 4]).to_dc(upload).done(|_| Ok(())).send();
    let uploader = cluster.session(shift_dc_id(2, BASE_UPLOAD_DC_SHIFT));
    uploader.reply_error(id, 303, "FILE_MIGRATE_4");

    assert_eq!(instance.main_dc_id(), Some(2));
    assert!(!cluster.session(2).is_killed());
    let moved = shift_dc_id(4, BASE_UPLOAD_DC_SHIFT);
    assert_eq!(instance.request_dc(id), Some(moved));
    assert!(cluster.session(moved).sent_ids().contains(&id));
}

#[tokio::test(start_paused = true)]
async fn repeated_flood_waits_keep_one_entry_with_the_latest_time() {
    let (instance, cluster) = booted();
    let id = instance.request(vec![7; 4]).done(|_| Ok(())).send();
    let main = cluster.session(2);
    main.reply_error(id, 420, "FLOOD_WAIT_5");
    main.reply_error(id, 420, "FLOOD_WAIT_10");
    let sends = || main.sent_ids().iter().filter(|&&r| r == id).count();

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(sends(), 1);
    assert!(matches!(instance.state(id), RequestState::Delayed(_)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(sends(), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(sends(), 2);
}

#[tokio::test(start_paused = true)]
async fn flood_wait_parks_then_resends() {
    let (instance, cluster) = booted();
    let id = instance.request(vec![7; 4]).done(|_| Ok(())).send();
    let main = cluster.session(2);
    main.reply_error(id, 420, "FLOOD_WAIT_5");

    match instance.state(id) {
        RequestState::Delayed(left) => assert!(left > Duration::from_secs(4)),
        other => panic!("expected delayed, got {other:?}"),
    }
    assert_eq!(main.sent_ids().iter().filter(|&&r| r == id).count(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(main.sent_ids().iter().filter(|&&r| r == id).count(), 2);
    assert_eq!(instance.state(id), RequestState::Sent);
}

#[tokio::test(start_paused = true)]
async fn premium_flood_is_announced() {
    let (instance, cluster) = booted();
    let mut events = instance.subscribe();
    let id = instance.request(vec![7; 4]).done(|_| Ok(())).send();
    cluster.session(2).reply_error(id, 420, "FLOOD_PREMIUM_WAIT_2");
    assert!(drain(&mut events).contains(&Event::NonPremiumDelayed(id)));
}

#[tokio::test]
async fn intercept_claims_retryable_errors() {
    let (instance, cluster) = booted();
    let (seen, fail) = recorder();
    let id = instance
        .request(vec![7; 4])
        .intercept(|e, _| e.is_flood())
        .fail(fail)
        .send();
    cluster.session(2).reply_error(id, 420, "FLOOD_WAIT_30");
    assert!(seen.lock().is_empty());
    assert_eq!(instance.state(id), RequestState::Sent);
    assert_eq!(instance.request_dc(id), None);
}

#[tokio::test]
async fn cancel_is_silent() {
    let (instance, cluster) = booted();
    let (seen, fail) = recorder();
    let called = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&called);
    let id = instance
        .request(vec![1; 4])
        .done(move |_| {
            *flag.lock() = true;
            Ok(())
        })
        .fail(fail)
        .send();

    instance.cancel(id);
    let main = cluster.session(2);
    assert_eq!(main.cancelled(), [id]);
    main.reply(id, vec![1; 4]);
    assert!(!*called.lock());
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn dependent_waits_for_its_predecessor() {
    let (instance, cluster) = booted();
    let first = instance.request(vec![1; 4]).send();
    let second = instance.request(vec![2; 4]).after(first).done(|_| Ok(())).send();
    let main = cluster.session(2);

    let sent = main.sent();
    let queued = sent.iter().find(|r| r.request_id() == second).expect("second sent");
    assert_eq!(queued.after().map(|r| r.request_id()), Some(first));

    main.reply_error(second, 400, "MSG_WAIT_FAILED");
    assert_eq!(main.sent_ids().iter().filter(|&&r| r == second).count(), 1);

    main.reply(first, vec![0; 4]);
    assert_eq!(main.sent_ids().iter().filter(|&&r| r == second).count(), 2);
    assert_eq!(instance.request_dc(second), Some(2));
}

#[tokio::test]
async fn killing_main_replaces_it_and_resends() {
    let (instance, cluster) = booted();
    let id = instance.request(vec![3; 4]).send();
    let old = cluster.session(2);

    instance.kill_session(2);
    assert!(old.is_killed());
    let fresh = cluster.session(2);
    assert!(fresh.is_started());
    assert!(fresh.sent_ids().contains(&id));
    assert_eq!(instance.session_count(), 1);
}

#[tokio::test]
async fn re_init_recreates_sessions_of_the_dc() {
    let (instance, cluster) = booted();
    let id = instance.request(vec![3; 4]).send();
    let old = cluster.session(2);

    instance.re_init_connection(2);
    assert!(old.is_killed());
    let fresh = cluster.session(2);
    assert_eq!(fresh.not_inited.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(fresh.sent_ids().contains(&id));
}

#[tokio::test]
async fn connection_not_inited_resends_with_layer() {
    let (instance, cluster) = booted();
    let id = instance.request(vec![3; 4]).done(|_| Ok(())).send();
    let main = cluster.session(2);
    main.reply_error(id, 400, "CONNECTION_NOT_INITED");
    let resent = main.sent().into_iter().rev().find(|r| r.request_id() == id).expect("resent");
    assert!(resent.needs_layer());
    assert_eq!(main.not_inited.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parse_failure_surfaces_once() {
    let (instance, cluster) = booted();
    let (seen, fail) = recorder();
    let id = instance
        .request(vec![1; 4])
        .done(|_| Err(tl::Error::UnexpectedEof))
        .fail(fail)
        .send();
    cluster.session(2).reply(id, vec![1, 2, 3, 4]);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, "RESPONSE_PARSE_FAILED");
    assert_eq!(instance.request_dc(id), None);
}

#[tokio::test]
async fn empty_reply_is_a_parse_failure() {
    let (instance, cluster) = booted();
    let (seen, fail) = recorder();
    let id = instance.request(vec![1; 4]).fail(fail).send();
    cluster.session(2).reply(id, Vec::new());
    assert_eq!(seen.lock()[0].description, "Empty response.");
}

#[tokio::test]
async fn invoke_decodes_gzip_packed_results() {
    let (instance, cluster) = booted();
    let pending = instance.invoke(&GetCdnConfig);

    let config = CdnConfig { public_keys: vec![CdnPublicKey { dc_id: 203, public_key: "KEY".into() }] };
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&config.to_bytes()).unwrap();
    let packed = GzipPacked { packed_data: encoder.finish().unwrap() };

    let main = cluster.session(2);
    let request = main.find(&GetCdnConfig.to_bytes()).unwrap();
    main.reply(request.request_id(), packed.to_bytes());
    assert_eq!(pending.await.unwrap(), config);
}

#[tokio::test]
async fn invoke_reports_rpc_errors() {
    let (instance, cluster) = booted();
    let pending = instance.invoke(&GetCdnConfig);
    let main = cluster.session(2);
    let request = main.find(&GetCdnConfig.to_bytes()).unwrap();
    main.reply_error(request.request_id(), 400, "METHOD_INVALID");
    match pending.await {
        Err(InvocationError::Rpc(e)) => assert_eq!(e.name, "METHOD_INVALID"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn clear_callbacks_fail_with_the_given_code() {
    let (instance, cluster) = booted();
    let (seen, fail) = recorder();
    let quiet = instance.request(vec![1; 4]).send();
    let id = instance.request(vec![2; 4]).fail(fail).send();

    let link = cluster.session(2).link();
    link.clear_callbacks_delayed(vec![(id, 500), (quiet, 0)]);
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!((seen[0].code, seen[0].name.as_str()), (500, "CLEAR_CALLBACK"));
    assert_eq!(instance.request_dc(id), None);
    assert_eq!(instance.request_dc(quiet), None);
}

#[tokio::test]
async fn shutdown_drops_pending_invocations() {
    let (instance, cluster) = booted();
    let pending = instance.invoke(&GetCdnConfig);
    let main = cluster.session(2);
    let link = main.link();

    instance.shutdown();
    assert!(main.is_killed());
    assert!(link.is_closed());
    assert!(matches!(pending.await, Err(InvocationError::Dropped)));
}

#[tokio::test]
async fn duplicate_startup_keys_keep_the_first() {
    let first = Arc::new(AuthKey::from_bytes(2, [1; 256]));
    let second = Arc::new(AuthKey::from_bytes(2, [2; 256]));
    let (instance, _cluster) = boot(Config::new().with_key(first.clone()).with_key(second));
    let keys = instance.keys_for_write();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key_id(), first.key_id());
}

#[tokio::test]
async fn key_changes_are_persisted() {
    let cluster = Cluster::default();
    let storage = Arc::new(InMemoryBackend::new());
    let ctx = Context::new(cluster.factory()).with_storage(storage.clone());
    let instance = Instance::new(DcOptions::production(), Mode::Normal, Config::new().with_main_dc(2), ctx);
    let mut events = instance.subscribe();

    let key = Arc::new(AuthKey::from_bytes(2, [7; 256]));
    cluster.session(2).link().dc_persistent_key_changed(2, Some(key.clone()));
    assert!(drain(&mut events).contains(&Event::WriteKeys));
    settle().await;

    let saved = storage.load().unwrap().expect("state saved");
    assert_eq!(saved.main_dc_id, Some(2));
    assert_eq!(saved.keys.len(), 1);
    assert_eq!(saved.keys[0].key_id(), key.key_id());
}

#[tokio::test]
async fn restore_uses_stored_main_dc_and_keys() {
    let cluster = Cluster::default();
    let storage = Arc::new(InMemoryBackend::new());
    let key = Arc::new(AuthKey::from_bytes(4, [4; 256]));
    storage
        .save(&PersistedState { main_dc_id: Some(4), keys: vec![key.clone()], config_version: 3 })
        .unwrap();

    let ctx = Context::new(cluster.factory()).with_storage(storage);
    let instance = Instance::restore(DcOptions::production(), ctx).unwrap();
    assert_eq!(instance.main_dc_id(), Some(4));
    assert!(cluster.session(4).is_started());
    assert_eq!(instance.keys_for_write().len(), 1);
    assert_eq!(instance.config_values().version, 3);
}

#[tokio::test]
async fn suggestions_stop_after_an_explicit_choice() {
    let (instance, _cluster) = boot(Config::new());
    instance.suggest_main_dc_id(4);
    assert_eq!(instance.main_dc_id(), Some(4));
    instance.suggest_main_dc_id(1);
    assert_eq!(instance.main_dc_id(), Some(4));
    instance.set_main_dc_id(1);
    assert_eq!(instance.main_dc_id(), Some(1));
}

#[tokio::test]
async fn guest_logout_kills_the_logout_session() {
    let main_key = Arc::new(AuthKey::from_bytes(2, [2; 256]));
    let guest_key = Arc::new(AuthKey::from_bytes(4, [4; 256]));
    let (instance, cluster) = boot(Config::new().with_main_dc(2).with_key(main_key).with_key(guest_key));
    answer_config(&cluster, 2);

    let done = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&done);
    instance.logout(move || *flag.lock() = true, |_| {});

    let logout = layer_mux::schema::LogOut.to_bytes();
    let main = cluster.session(2);
    let guest_shifted = layer_mux::dc::logout_dc_id(4);
    let guest = cluster.session(guest_shifted);

    let guest_request = guest.find(&logout).expect("guest log-out sent");
    guest.reply(guest_request.request_id(), true.to_bytes());
    assert!(guest.is_killed());

    let main_request = main.find(&logout).expect("main log-out sent");
    main.reply(main_request.request_id(), true.to_bytes());
    assert!(*done.lock());
}
