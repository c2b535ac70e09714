//! `Dcenter`: one DC identity together with its current auth key.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::auth_key::AuthKeyPtr;
use crate::dc::DcId;

/// Secret record for one physical DC.
///
/// Shared (`Arc<Dcenter>`) by every session talking to that DC. Sessions
/// install a freshly negotiated key here and report it back through
/// [`crate::InstanceLink::dc_persistent_key_changed`].
#[derive(Debug)]
pub struct Dcenter {
    id:                DcId,
    persistent_key:    RwLock<Option<AuthKeyPtr>>,
    connection_inited: AtomicBool,
}

impl Dcenter {
    pub fn new(id: DcId, key: Option<AuthKeyPtr>) -> Self {
        Self {
            id,
            persistent_key:    RwLock::new(key),
            connection_inited: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DcId { self.id }

    pub fn persistent_key(&self) -> Option<AuthKeyPtr> {
        self.persistent_key.read().clone()
    }

    pub fn set_persistent_key(&self, key: Option<AuthKeyPtr>) {
        *self.persistent_key.write() = key;
    }

    /// Drop the key if it is still the one with `key_id`. Returns `false`
    /// when the key was already replaced (or absent).
    pub fn destroy_confirmed_forgotten_key(&self, key_id: u64) -> bool {
        let mut key = self.persistent_key.write();
        if key.as_ref().is_some_and(|k| k.key_id() == key_id) {
            *key = None;
            self.connection_inited.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Whether the init preamble has been accepted on this DC.
    pub fn connection_inited(&self) -> bool {
        self.connection_inited.load(Ordering::Acquire)
    }

    pub fn set_connection_inited(&self, value: bool) {
        self.connection_inited.store(value, Ordering::Release);
    }
}
