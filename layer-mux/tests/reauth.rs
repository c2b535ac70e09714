mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use common::{Cluster, answer_config};
use layer_mux::schema::{ExportAuthorization, ExportedAuthorization, ImportAuthorization};
use layer_mux::tl::Serializable;
use layer_mux::{Config, Context, DcOptions, Instance, Mode, RequestId, RpcError};

fn booted() -> (Instance, Cluster) {
    let cluster = Cluster::default();
    let ctx = Context::new(cluster.factory());
    let instance = Instance::new(DcOptions::production(), Mode::Normal, Config::new().with_main_dc(2), ctx);
    answer_config(&cluster, 2);
    (instance, cluster)
}

type Log = Arc<Mutex<Vec<(RequestId, Result<(), RpcError>)>>>;

fn send_to(instance: &Instance, dc: i32, tag: u8, log: &Log) -> RequestId {
    let on_done = Arc::clone(log);
    let on_fail = Arc::clone(log);
    instance
        .request(vec![tag; 4])
        .to_dc(dc)
        .done(move |r| {
            on_done.lock().push((r.request_id, Ok(())));
            Ok(())
        })
        .fail(move |e, r| on_fail.lock().push((r.request_id, Err(e.clone()))))
        .send()
}

const EXPORTED: ExportedAuthorization = ExportedAuthorization { id: 77, bytes: Vec::new() };

#[tokio::test]
async fn guest_dc_is_authorized_once_and_waiters_replay_in_order() {
    let (instance, cluster) = booted();
    let log = Log::default();
    let first = send_to(&instance, 4, 1, &log);
    let second = send_to(&instance, 4, 2, &log);

    let guest = cluster.session(4);
    guest.reply_error(first, 401, "AUTH_KEY_UNREGISTERED");
    guest.reply_error(second, 401, "AUTH_KEY_UNREGISTERED");
    assert!(log.lock().is_empty());

    let main = cluster.session(2);
    let export = ExportAuthorization { dc_id: 4 }.to_bytes();
    assert_eq!(main.count(&export), 1);
    let export_request = main.find(&export).unwrap();
    main.reply(export_request.request_id(), EXPORTED.to_bytes());

    let import = ImportAuthorization { id: 77, bytes: Vec::new() }.to_bytes();
    let import_request = guest.find(&import).expect("import sent to the guest dc");
    guest.reply(import_request.request_id(), true.to_bytes());

    let sent = guest.sent_ids();
    assert_eq!(&sent[sent.len() - 2..], [first, second]);

    guest.reply(first, vec![0; 4]);
    guest.reply(second, vec![0; 4]);
    let log = log.lock();
    assert_eq!(log.iter().map(|(id, _)| *id).collect::<Vec<_>>(), [first, second]);
    assert!(log.iter().all(|(_, r)| r.is_ok()));
}

#[tokio::test]
async fn failed_export_surfaces_each_original_error() {
    let (instance, cluster) = booted();
    let log = Log::default();
    let first = send_to(&instance, 4, 1, &log);
    let second = send_to(&instance, 4, 2, &log);

    let guest = cluster.session(4);
    guest.reply_error(first, 401, "AUTH_KEY_UNREGISTERED");
    guest.reply_error(second, 401, "SESSION_REVOKED");

    let main = cluster.session(2);
    let export_request = main.find(&ExportAuthorization { dc_id: 4 }.to_bytes()).unwrap();
    main.reply_error(export_request.request_id(), 400, "DC_ID_INVALID");

    let log = log.lock();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].0, first);
    assert_eq!(log[0].1.as_ref().unwrap_err().name, "AUTH_KEY_UNREGISTERED");
    assert_eq!(log[1].0, second);
    assert_eq!(log[1].1.as_ref().unwrap_err().name, "SESSION_REVOKED");
    assert_eq!(instance.request_dc(first), None);
    assert_eq!(instance.request_dc(second), None);
}

#[tokio::test]
async fn unauthorized_on_main_goes_to_the_global_handler() {
    let (instance, cluster) = booted();
    let global = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&global);
    instance.set_global_fail_handler(move |e, _| sink.lock().push(e.name.clone()));

    let log = Log::default();
    let id = send_to(&instance, 0, 1, &log);
    cluster.session(2).reply_error(id, 401, "AUTH_KEY_UNREGISTERED");

    assert_eq!(*global.lock(), ["AUTH_KEY_UNREGISTERED"]);
    assert_eq!(log.lock().len(), 1);
    assert!(cluster.session(2).find(&ExportAuthorization { dc_id: 2 }.to_bytes()).is_none());
}

#[tokio::test]
async fn bad_guest_file_id_is_retried_through_reauth_only_once() {
    let (instance, cluster) = booted();
    let global = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&global);
    instance.set_global_fail_handler(move |_, _| *sink.lock() += 1);

    let log = Log::default();
    let id = send_to(&instance, 4, 1, &log);
    let guest = cluster.session(4);
    guest.reply_error(id, 400, "FILE_ID_INVALID");

    let main = cluster.session(2);
    let export_request = main.find(&ExportAuthorization { dc_id: 4 }.to_bytes()).unwrap();
    main.reply(export_request.request_id(), EXPORTED.to_bytes());
    let import_request = guest.find(&ImportAuthorization { id: 77, bytes: Vec::new() }.to_bytes()).unwrap();
    guest.reply(import_request.request_id(), true.to_bytes());

    guest.reply_error(id, 400, "FILE_ID_INVALID");
    let log = log.lock();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1.as_ref().unwrap_err().name, "FILE_ID_INVALID");
    assert_eq!(*global.lock(), 0);
}
