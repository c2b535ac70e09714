//! Requests as the multiplexer sees them: opaque payloads plus bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::dc::ShiftedDcId;
use crate::errors::RpcError;
use crate::tl;

/// Caller-visible request handle. Always positive for real requests.
pub type RequestId = i32;

// ─── RequestIdAllocator ──────────────────────────────────────────────────────

/// Hands out unique, increasing request ids.
///
/// Ids wrap back to `1` before reaching half the `i32` range so they stay
/// positive and never collide with ids still in the registry in practice.
pub(crate) struct RequestIdAllocator {
    last: AtomicI32,
}

impl RequestIdAllocator {
    const WRAP_AT: i32 = i32::MAX / 2;

    pub(crate) fn new() -> Self {
        Self { last: AtomicI32::new(0) }
    }

    pub(crate) fn next(&self) -> RequestId {
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(if v >= Self::WRAP_AT { 1 } else { v + 1 })
            })
            .unwrap_or(0);
        if prev >= Self::WRAP_AT { 1 } else { prev + 1 }
    }
}

// ─── SerializedRequest ───────────────────────────────────────────────────────

struct RequestData {
    request_id:   RequestId,
    payload:      Vec<u8>,
    msg_id:       AtomicU64,
    needs_layer:  AtomicBool,
    parse_failed: AtomicBool,
    after:        Mutex<Option<SerializedRequest>>,
}

/// A prepared request, shared between the registry and the session that is
/// currently carrying it.
///
/// The payload is immutable; the wire-level bits a session or the recovery
/// logic may touch (`msg_id`, the init-preamble flag, the dependency) are
/// individually synchronised.
#[derive(Clone)]
pub struct SerializedRequest(Arc<RequestData>);

impl SerializedRequest {
    pub fn new(request_id: RequestId, payload: Vec<u8>) -> Self {
        Self(Arc::new(RequestData {
            request_id,
            payload,
            msg_id:       AtomicU64::new(0),
            needs_layer:  AtomicBool::new(false),
            parse_failed: AtomicBool::new(false),
            after:        Mutex::new(None),
        }))
    }

    pub fn request_id(&self) -> RequestId { self.0.request_id }

    /// The opaque, already-encoded method call.
    pub fn payload(&self) -> &[u8] { &self.0.payload }

    /// Message id of the last transmission, `0` if never sent.
    pub fn msg_id(&self) -> u64 { self.0.msg_id.load(Ordering::Acquire) }

    /// Called by sessions when they assign a message id.
    pub fn set_msg_id(&self, msg_id: u64) { self.0.msg_id.store(msg_id, Ordering::Release) }

    /// Whether the next transmission must be wrapped in the connection init
    /// preamble.
    pub fn needs_layer(&self) -> bool { self.0.needs_layer.load(Ordering::Acquire) }

    pub fn set_needs_layer(&self, value: bool) { self.0.needs_layer.store(value, Ordering::Release) }

    /// The request this one must be delivered after, if any.
    pub fn after(&self) -> Option<SerializedRequest> { self.0.after.lock().clone() }

    pub(crate) fn set_after(&self, after: Option<SerializedRequest>) {
        *self.0.after.lock() = after;
    }

    /// Marks that the reply failed to decode. Returns `true` only the first
    /// time, so a response-parse failure is classified once per request.
    pub(crate) fn mark_parse_failed(&self) -> bool {
        !self.0.parse_failed.swap(true, Ordering::AcqRel)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}

impl fmt::Debug for SerializedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedRequest")
            .field("request_id", &self.request_id())
            .field("len", &self.0.payload.len())
            .field("msg_id", &self.msg_id())
            .field("needs_layer", &self.needs_layer())
            .field("after", &self.0.after.lock().as_ref().map(|a| a.request_id()))
            .finish()
    }
}

// ─── Response ────────────────────────────────────────────────────────────────

/// A reply (or pushed update) handed back by a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    pub request_id:   RequestId,
    pub outer_msg_id: u64,
    /// Unwrapped `rpc_result` body; may still be `gzip_packed`.
    pub reply:        Vec<u8>,
}

impl Response {
    pub fn new(request_id: RequestId, reply: Vec<u8>) -> Self {
        Self { request_id, outer_msg_id: 0, reply }
    }
}

// ─── ResponseHandler ─────────────────────────────────────────────────────────

/// Decodes and consumes a successful reply. An `Err` turns into a local
/// `RESPONSE_PARSE_FAILED` error.
pub type DoneHandler = Box<dyn FnMut(&Response) -> Result<(), tl::Error> + Send>;

/// Receives the error a request finally failed with.
pub type FailHandler = Box<dyn FnMut(&RpcError, &Response) + Send>;

/// Sees retryable errors (transport failures, flood waits) before the
/// multiplexer retries them. Returning `true` claims the error: the request
/// is dropped without a retry and without calling the fail handler.
pub type InterceptHandler = Box<dyn FnMut(&RpcError, &Response) -> bool + Send>;

/// Callbacks attached to one request.
#[derive(Default)]
pub struct ResponseHandler {
    pub done:      Option<DoneHandler>,
    pub fail:      Option<FailHandler>,
    pub intercept: Option<InterceptHandler>,
}

impl ResponseHandler {
    pub fn is_empty(&self) -> bool {
        self.done.is_none() && self.fail.is_none() && self.intercept.is_none()
    }
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandler")
            .field("done", &self.done.is_some())
            .field("fail", &self.fail.is_some())
            .field("intercept", &self.intercept.is_some())
            .finish()
    }
}

// ─── SendOptions ─────────────────────────────────────────────────────────────

/// Routing knobs for one send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Target channel. `0` follows the main DC; a shifted id with a bare part
    /// of `0` means that shift on the main DC.
    pub to_dc:       ShiftedDcId,
    /// How long the session may hold the request to batch it with others.
    pub can_wait:    Duration,
    /// Deliver only after this request has been answered.
    pub after:       Option<RequestId>,
    /// Wrap the first transmission in the connection init preamble.
    pub needs_layer: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_and_wrap() {
        let ids = RequestIdAllocator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        ids.last.store(RequestIdAllocator::WRAP_AT, Ordering::Release);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn parse_failure_flag_fires_once() {
        let req = SerializedRequest::new(7, vec![1, 2, 3, 4]);
        assert!(req.mark_parse_failed());
        assert!(!req.clone().mark_parse_failed());
    }

    #[test]
    fn dependency_is_shared_across_clones() {
        let first = SerializedRequest::new(1, vec![]);
        let second = SerializedRequest::new(2, vec![]);
        let alias = second.clone();
        second.set_after(Some(first.clone()));
        assert!(alias.after().is_some_and(|a| a.ptr_eq(&first)));
        alias.set_after(None);
        assert!(second.after().is_none());
    }
}
