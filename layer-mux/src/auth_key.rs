//! Per-DC `AuthKey`, the long-lived 256-byte secret.
//!
//! Keys are always handled as [`AuthKeyPtr`] (`Arc<AuthKey>`). A key is held
//! jointly by its [`crate::Dcenter`] and by the instance's write-back cache;
//! it lives as long as the longer-lived of the two. Never keep a handle
//! around expecting it to stay current; re-fetch it through the `Dcenter`.

use std::fmt;
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::dc::DcId;

/// Shared handle to an [`AuthKey`].
pub type AuthKeyPtr = Arc<AuthKey>;

/// An authorization key bound to one physical DC.
#[derive(Clone)]
pub struct AuthKey {
    dc_id:  DcId,
    data:   [u8; 256],
    key_id: u64,
}

impl AuthKey {
    /// Wrap raw 256-byte key material for `dc_id`.
    pub fn from_bytes(dc_id: DcId, data: [u8; 256]) -> Self {
        let sha = Sha1::digest(data);
        let mut id = [0u8; 8];
        id.copy_from_slice(&sha[12..20]);
        Self { dc_id, data, key_id: u64::from_le_bytes(id) }
    }

    /// Physical DC this key was negotiated with.
    pub fn dc_id(&self) -> DcId { self.dc_id }

    /// The 64-bit key identifier (SHA-1(key)[12..20], little-endian).
    pub fn key_id(&self) -> u64 { self.key_id }

    /// Raw key material, for persistence.
    pub fn to_bytes(&self) -> [u8; 256] { self.data }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey(dc={}, id={:#018x})", self.dc_id, self.key_id)
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.dc_id == other.dc_id && self.key_id == other.key_id
    }
}

impl Eq for AuthKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_stable_and_data_sensitive() {
        let a = AuthKey::from_bytes(2, [7u8; 256]);
        let b = AuthKey::from_bytes(2, [7u8; 256]);
        let c = AuthKey::from_bytes(2, [8u8; 256]);
        assert_eq!(a.key_id(), b.key_id());
        assert_ne!(a.key_id(), c.key_id());
        assert_eq!(a, b);
    }

    #[test]
    fn debug_never_prints_material() {
        let key = AuthKey::from_bytes(4, [0xAB; 256]);
        let shown = format!("{key:?}");
        assert!(shown.starts_with("AuthKey(dc=4"));
        assert!(!shown.contains("171,"));
    }
}
