//! Datacenter identifiers and the shifted-id arithmetic.
//!
//! A [`ShiftedDcId`] packs a physical DC id together with a small "shift"
//! that tells parallel logical sessions to the same DC apart:
//!
//! ```text
//! shifted = dc_id + shift * DC_SHIFT
//! ```
//!
//! Shift `0` is the main channel. A shifted id whose bare part is `0`
//! means "this shift, on whatever the main DC currently is".

/// Physical datacenter id (1, 2, 3, …).
pub type DcId = i32;

/// A [`DcId`] combined with a channel shift.
pub type ShiftedDcId = i32;

/// Multiplier separating the shift from the bare DC id.
pub const DC_SHIFT: ShiftedDcId = 10_000;

/// Main DC used when the caller has not picked one.
pub const DEFAULT_MAIN_DC: DcId = 2;

pub const LOGOUT_DC_SHIFT: i32 = 0x01;
pub const UPDATER_DC_SHIFT: i32 = 0x02;
pub const EXPORT_DC_SHIFT: i32 = 0x03;
pub const EXPORT_MEDIA_DC_SHIFT: i32 = 0x04;
pub const CONFIG_DC_SHIFT: i32 = 0x05;
pub const MAX_MEDIA_DC_COUNT: i32 = 0x10;
pub const BASE_DOWNLOAD_DC_SHIFT: i32 = 0x10;
pub const BASE_UPLOAD_DC_SHIFT: i32 = 0x20;
/// First slot used by key-destruction sessions; later keys for the same DC
/// take `0x101`, `0x102`, …
pub const DESTROY_KEY_START_DC_SHIFT: i32 = 0x100;

/// Strip the shift and return the physical DC id.
#[inline]
pub const fn bare_dc_id(shifted: ShiftedDcId) -> DcId {
    shifted % DC_SHIFT
}

/// Combine a DC id with a shift.
#[inline]
pub const fn shift_dc_id(dc_id: DcId, shift: i32) -> ShiftedDcId {
    dc_id + DC_SHIFT * shift
}

/// The shift part of a shifted id.
#[inline]
pub const fn dc_id_shift(shifted: ShiftedDcId) -> i32 {
    shifted / DC_SHIFT
}

/// Channel used to log out of a guest DC.
#[inline]
pub const fn logout_dc_id(dc_id: DcId) -> ShiftedDcId {
    shift_dc_id(dc_id, LOGOUT_DC_SHIFT)
}

/// Channel used by the config loader when enumerating DCs.
#[inline]
pub const fn config_dc_id(dc_id: DcId) -> ShiftedDcId {
    shift_dc_id(dc_id, CONFIG_DC_SHIFT)
}

/// Next key-destruction slot after `shifted` for the same bare DC.
///
/// A plain DC id (shift 0) maps to the first destruction slot.
#[inline]
pub const fn destroy_key_next_dc_id(shifted: ShiftedDcId) -> ShiftedDcId {
    let shift = dc_id_shift(shifted);
    let next = if shift != 0 { shift + 1 } else { DESTROY_KEY_START_DC_SHIFT };
    shift_dc_id(bare_dc_id(shifted), next)
}

/// `true` for media download channels.
pub fn is_download_dc_id(shifted: ShiftedDcId) -> bool {
    let shift = dc_id_shift(shifted);
    (BASE_DOWNLOAD_DC_SHIFT..BASE_DOWNLOAD_DC_SHIFT + MAX_MEDIA_DC_COUNT).contains(&shift)
}

/// `true` for media upload channels.
pub fn is_upload_dc_id(shifted: ShiftedDcId) -> bool {
    let shift = dc_id_shift(shifted);
    (BASE_UPLOAD_DC_SHIFT..BASE_UPLOAD_DC_SHIFT + MAX_MEDIA_DC_COUNT).contains(&shift)
}

/// `true` for key-destruction slots.
pub fn is_destroy_key_dc_id(shifted: ShiftedDcId) -> bool {
    dc_id_shift(shifted) >= DESTROY_KEY_START_DC_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_roundtrip() {
        let shifted = shift_dc_id(4, BASE_DOWNLOAD_DC_SHIFT + 3);
        assert_eq!(bare_dc_id(shifted), 4);
        assert_eq!(dc_id_shift(shifted), BASE_DOWNLOAD_DC_SHIFT + 3);
        assert!(is_download_dc_id(shifted));
        assert!(!is_upload_dc_id(shifted));
    }

    #[test]
    fn main_channel_has_zero_shift() {
        assert_eq!(dc_id_shift(2), 0);
        assert_eq!(bare_dc_id(2), 2);
    }

    #[test]
    fn destroy_slots_advance_per_dc() {
        let first = destroy_key_next_dc_id(2);
        assert_eq!(first, shift_dc_id(2, DESTROY_KEY_START_DC_SHIFT));
        let second = destroy_key_next_dc_id(first);
        assert_eq!(second, shift_dc_id(2, DESTROY_KEY_START_DC_SHIFT + 1));
        assert_eq!(bare_dc_id(second), 2);
        assert!(is_destroy_key_dc_id(second));
    }
}
