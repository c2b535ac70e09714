//! Lifecycle signals, delivered over a broadcast channel.

use crate::dc::{DcId, ShiftedDcId};
use crate::request::RequestId;

/// Something the application may want to react to.
///
/// Subscribe with [`crate::Instance::subscribe`]. Slow receivers may lag and
/// miss events; nothing in the multiplexer depends on delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A server config was applied.
    ConfigLoaded,
    /// CDN public keys were refreshed.
    CdnConfigLoaded,
    /// One key-destruction slot finished.
    KeyDestroyed(ShiftedDcId),
    /// Every key handed to a destroyer-mode instance is gone.
    AllKeysDestroyed,
    /// Keys or the main DC changed; persisted state was rewritten.
    WriteKeys,
    MainDcChanged(DcId),
    /// A request hit `FLOOD_PREMIUM_WAIT_n` and was delayed.
    NonPremiumDelayed(RequestId),
    /// The server refused a method because the account is frozen.
    FrozenErrorReceived,
    /// A session reconnected after its connection timed out.
    RestartedByTimeout(ShiftedDcId),
}
