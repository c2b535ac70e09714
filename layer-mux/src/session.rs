//! The seam between the multiplexer and the transport layer.
//!
//! A [`Session`] is one logical channel to one shifted DC. The multiplexer
//! never looks inside: it creates sessions through a [`SessionFactory`],
//! hands them prepared requests, and gets answers back through the
//! [`InstanceLink`] each session is created with.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Mode;
use crate::dc::{DcId, ShiftedDcId, bare_dc_id, is_destroy_key_dc_id};
use crate::dc_options::{DcType, Endpoint};
use crate::dcenter::Dcenter;
use crate::instance::InstanceLink;
use crate::request::{RequestId, SerializedRequest};

/// Which flavour of session a shifted DC gets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// Ordinary authorized channel.
    Dc,
    /// Channel to a CDN DC; no log-out, keys come from the CDN config.
    Cdn,
    /// Single-purpose channel that logs out and destroys one key.
    KeyDestroyer,
}

impl SessionKind {
    pub fn for_dc(shifted: ShiftedDcId, dc_type: DcType, mode: Mode) -> Self {
        if mode == Mode::KeysDestroyer || is_destroy_key_dc_id(shifted) {
            Self::KeyDestroyer
        } else if dc_type == DcType::Cdn {
            Self::Cdn
        } else {
            Self::Dc
        }
    }
}

/// Connection state reported by a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Where one request currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Sent, or already answered.
    Sent,
    /// Waiting for the connection to come up.
    Connecting,
    /// Queued in the session, about to go out.
    Sending,
    /// Parked in the backoff queue for this long.
    Delayed(Duration),
}

/// Everything a factory needs to build one session.
pub struct SessionSpec {
    pub kind:          SessionKind,
    pub shifted_dc_id: ShiftedDcId,
    /// Shared secret record for the bare DC.
    pub dc:            Arc<Dcenter>,
    /// Endpoints known for the bare DC at creation time.
    pub endpoints:     Vec<Endpoint>,
    /// Way back into the multiplexer; holds no strong reference.
    pub link:          InstanceLink,
}

impl SessionSpec {
    pub fn dc_id(&self) -> DcId { bare_dc_id(self.shifted_dc_id) }
}

impl fmt::Debug for SessionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSpec")
            .field("kind", &self.kind)
            .field("shifted_dc_id", &self.shifted_dc_id)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

/// One logical channel to one shifted DC.
///
/// Methods are called from any task and must not block. None of them is
/// ever invoked while the multiplexer holds one of its own locks, so an
/// implementation may call straight back into its [`InstanceLink`].
pub trait Session: Send + Sync {
    fn shifted_dc_id(&self) -> ShiftedDcId;

    fn start(&self);

    /// Stop the connection but keep queued work.
    fn stop(&self);

    /// Stop for good; the session is about to be dropped.
    fn kill(&self);

    /// Drop the current connection and reconnect.
    fn restart(&self);

    /// Resend the init preamble with the next request.
    fn set_connection_not_inited(&self);

    /// Queue `request`; `can_wait` is how long it may be held for batching.
    fn send_prepared(&self, request: &SerializedRequest, can_wait: Duration);

    /// Forget `request_id`; `msg_id` is the last message id it went out with.
    fn cancel(&self, request_id: RequestId, msg_id: u64);

    fn request_state(&self, request_id: RequestId) -> RequestState;

    fn connection_state(&self) -> ConnectionState;

    /// Human-readable transport name, empty while disconnected.
    fn transport(&self) -> String;

    fn ping(&self);
}

/// Builds sessions on demand.
pub trait SessionFactory: Send + Sync {
    fn create(&self, spec: SessionSpec) -> Arc<dyn Session>;
}

impl<F> SessionFactory for F
where
    F: Fn(SessionSpec) -> Arc<dyn Session> + Send + Sync,
{
    fn create(&self, spec: SessionSpec) -> Arc<dyn Session> { self(spec) }
}
