//! Key destruction.
//!
//! A destroyer-mode instance owns one slot per orphaned key. Each slot's
//! session logs out, asks the server to forget the key and reports back; the
//! slot is then dropped. When no slots remain the instance signals
//! [`Event::AllKeysDestroyed`].

use tracing::{error, info, warn};

use crate::auth_key::AuthKeyPtr;
use crate::config::Mode;
use crate::dc::{ShiftedDcId, bare_dc_id};
use crate::dc_options::DcType;
use crate::events::Event;
use crate::instance::Inner;
use crate::schema::{DestroyAuthKey, DestroyAuthKeyRes, LogOut};

impl Inner {
    pub(crate) fn schedule_key_destroy(&self, shifted: ShiftedDcId) {
        if self.dc_options.read().dc_type(shifted) == DcType::Cdn {
            self.perform_key_destroy(shifted);
            return;
        }
        info!("[mux/destroy] logging out of {shifted} before destroying its key");
        let on_done = self.me.clone();
        let on_fail = self.me.clone();
        self.call(
            &LogOut,
            shifted,
            move |_, _| {
                if let Some(inner) = on_done.upgrade() {
                    inner.perform_key_destroy(shifted);
                }
            },
            move |error, _| {
                if let Some(inner) = on_fail.upgrade() {
                    warn!("[mux/destroy] log-out on {shifted} failed: {error}");
                    inner.perform_key_destroy(shifted);
                }
            },
        );
    }

    fn perform_key_destroy(&self, shifted: ShiftedDcId) {
        let on_done = self.me.clone();
        let on_fail = self.me.clone();
        self.call(
            &DestroyAuthKey,
            shifted,
            move |result, _| {
                let Some(inner) = on_done.upgrade() else { return };
                match result {
                    DestroyAuthKeyRes::Ok => info!("[mux/destroy] key on {shifted} destroyed"),
                    DestroyAuthKeyRes::None => info!("[mux/destroy] key on {shifted} was already gone"),
                    DestroyAuthKeyRes::Fail => {
                        error!("[mux/destroy] server refused to destroy key on {shifted}");
                        inner.kill_session(shifted);
                    }
                }
                inner.key_was_possibly_destroyed(shifted);
            },
            move |error, _| {
                let Some(inner) = on_fail.upgrade() else { return };
                error!("[mux/destroy] destroying key on {shifted} failed: {error}");
                inner.kill_session(shifted);
                inner.key_was_possibly_destroyed(shifted);
            },
        );
    }

    pub(crate) fn key_was_possibly_destroyed(&self, shifted: ShiftedDcId) {
        if self.mode != Mode::KeysDestroyer {
            warn!("[mux/destroy] key for {shifted} reported destroyed outside destroyer mode");
            return;
        }
        self.home.post(move |inner| inner.completed_key_destroy(shifted));
    }

    fn completed_key_destroy(&self, shifted: ShiftedDcId) {
        let (killed, removed, none_left) = {
            let mut pool = self.pool.lock();
            let removed = pool.remove_dc(shifted);
            pool.set_key_for_write(shifted, None);
            let killed = pool.retire(shifted);
            (killed, removed, pool.dc_count() == 0)
        };
        if let Some(session) = killed {
            session.kill();
            self.drain_retired();
        }
        if !removed {
            return;
        }
        info!("[mux/destroy] slot {shifted} done");
        self.emit(Event::KeyDestroyed(shifted));
        if none_left {
            info!("[mux/destroy] all keys destroyed");
            self.emit(Event::AllKeysDestroyed);
        }
    }

    /// The server said it no longer knows key `key_id` of `shifted`.
    pub(crate) fn key_destroyed_on_server(&self, shifted: ShiftedDcId, key_id: u64) {
        let dc_id = bare_dc_id(shifted);
        info!("[mux/destroy] dc {dc_id} forgot key {key_id:016x}");
        let dc = self.pool.lock().find_dc(dc_id);
        if let Some(dc) = dc {
            if dc.destroy_confirmed_forgotten_key(key_id) {
                self.dc_persistent_key_changed(dc_id, None);
            } else {
                info!("[mux/destroy] dc {dc_id} already has another key");
            }
        }
        self.restart_dc(shifted);
    }

    pub(crate) fn add_keys_for_destroy(&self, keys: Vec<AuthKeyPtr>) {
        if self.mode != Mode::KeysDestroyer {
            warn!("[mux/destroy] ignoring {} keys: not in destroyer mode", keys.len());
            return;
        }
        for key in keys {
            let slot = {
                let mut pool = self.pool.lock();
                let slot = pool.free_destroy_slot(key.dc_id());
                pool.set_key_for_write(slot, Some(key.clone()));
                pool.add_dc(slot, Some(key));
                slot
            };
            info!("[mux/destroy] key queued in slot {slot}");
            self.get_session(slot);
        }
    }
}
