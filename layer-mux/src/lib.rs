//! # layer-mux
//!
//! Client-side MTProto request multiplexer.
//!
//! An [`Instance`] owns one authorization key per data center, a pool of
//! sessions keyed by shifted DC id, and the table of every request still
//! waiting for an answer. It routes each request to the right session and
//! recovers from the errors the server uses to steer clients:
//!
//! - `*_MIGRATE_n`: resend on DC `n` (and move the main DC when the request
//!   followed it)
//! - `FLOOD_WAIT_n`, `SLOWMODE_WAIT_n` and transport failures: park in a
//!   delayed queue and resend later, per the [`RetryPolicy`]
//! - `401` on a guest DC: export the authorization from the main DC, import
//!   it there, then replay every waiting request in order
//! - `CONNECTION_NOT_INITED`: resend with the init preamble
//! - `MSG_WAIT_*`: keep `invokeAfterMsg` chains in order
//!
//! The wire itself is out of scope: sessions are supplied by the application
//! through a [`SessionFactory`] and report back through an [`InstanceLink`].
//!
//! A second [`Mode`] turns the instance into a key destroyer that logs out
//! and destroys every key it was given, then emits
//! [`Event::AllKeysDestroyed`].

#![deny(unsafe_code)]

mod auth_key;
mod config;
mod config_loader;
mod context;
pub mod dc;
mod dc_options;
mod dcenter;
mod delayed;
mod destroyer;
mod errors;
mod events;
mod home;
mod instance;
mod pool;
mod recovery;
mod registry;
mod request;
mod retry;
pub mod schema;
mod session;
mod storage;
pub mod tl;

pub use auth_key::{AuthKey, AuthKeyPtr};
pub use config::{Config, ConfigValues, Mode};
pub use context::{Context, LanguageManager, NoLanguage};
pub use dc::{DcId, ShiftedDcId};
pub use dc_options::{DcOptions, DcType, Endpoint};
pub use dcenter::Dcenter;
pub use errors::{InvocationError, RpcError};
pub use events::Event;
pub use instance::{Instance, InstanceLink, RequestBuilder};
pub use registry::Target;
pub use request::{
    DoneHandler, FailHandler, InterceptHandler, RequestId, Response, ResponseHandler, SendOptions,
    SerializedRequest,
};
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use session::{
    ConnectionState, RequestState, Session, SessionFactory, SessionKind, SessionSpec,
};
pub use storage::{BinaryFileBackend, InMemoryBackend, PersistedState, StateBackend};
