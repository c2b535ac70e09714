//! Secret records, live sessions and the main-DC choice.
//!
//! `SessionPool` is plain data behind one mutex. It never calls into a
//! session: methods that stop a session hand it back so the caller can
//! `kill()` it after releasing the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::auth_key::AuthKeyPtr;
use crate::dc::{DcId, ShiftedDcId, bare_dc_id, destroy_key_next_dc_id};
use crate::dcenter::Dcenter;
use crate::session::Session;

#[derive(Default)]
pub(crate) struct SessionPool {
    dcenters:       HashMap<ShiftedDcId, Arc<Dcenter>>,
    sessions:       HashMap<ShiftedDcId, Arc<dyn Session>>,
    /// `None` only in destroyer mode.
    main_dc_id:     Option<DcId>,
    main_forced:    bool,
    /// Killed sessions waiting to be dropped on the home task.
    retired:        Vec<Arc<dyn Session>>,
    keys_for_write: BTreeMap<ShiftedDcId, AuthKeyPtr>,
    closed:         bool,
}

impl SessionPool {
    pub(crate) fn new(main_dc_id: Option<DcId>, main_forced: bool) -> Self {
        Self { main_dc_id, main_forced, ..Self::default() }
    }

    pub(crate) fn is_closed(&self) -> bool { self.closed }

    // ─── Main DC ─────────────────────────────────────────────────────────────

    pub(crate) fn main_dc_id(&self) -> Option<DcId> { self.main_dc_id }

    pub(crate) fn main_forced(&self) -> bool { self.main_forced }

    pub(crate) fn set_main(&mut self, dc_id: DcId) -> Option<DcId> {
        self.main_forced = true;
        self.main_dc_id.replace(dc_id)
    }

    /// Turn `0` into the main DC and a bare-zero shifted id into that shift
    /// on the main DC. `None` when there is no main DC to resolve against.
    pub(crate) fn resolve(&self, shifted: ShiftedDcId) -> Option<ShiftedDcId> {
        if shifted == 0 {
            self.main_dc_id
        } else if bare_dc_id(shifted) == 0 {
            self.main_dc_id.map(|main| shifted + main)
        } else {
            Some(shifted)
        }
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    pub(crate) fn find(&self, shifted: ShiftedDcId) -> Option<Arc<dyn Session>> {
        self.sessions.get(&shifted).cloned()
    }

    /// Insert `session` unless one already exists; returns the winner.
    pub(crate) fn insert(
        &mut self,
        shifted: ShiftedDcId,
        session: Arc<dyn Session>,
    ) -> Result<Arc<dyn Session>, Arc<dyn Session>> {
        if let Some(existing) = self.sessions.get(&shifted) {
            return Err(Arc::clone(existing));
        }
        self.sessions.insert(shifted, Arc::clone(&session));
        Ok(session)
    }

    /// Move `shifted` into the drain pool, returning it for `kill()`.
    pub(crate) fn retire(&mut self, shifted: ShiftedDcId) -> Option<Arc<dyn Session>> {
        let session = self.sessions.remove(&shifted)?;
        self.retired.push(Arc::clone(&session));
        Some(session)
    }

    pub(crate) fn take_retired(&mut self) -> Vec<Arc<dyn Session>> {
        std::mem::take(&mut self.retired)
    }

    pub(crate) fn shifted_ids_for(&self, dc_id: DcId) -> Vec<ShiftedDcId> {
        let mut ids: Vec<_> = self
            .sessions
            .keys()
            .filter(|&&s| bare_dc_id(s) == dc_id)
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn sessions_for(&self, dc_id: DcId) -> Vec<Arc<dyn Session>> {
        self.shifted_ids_for(dc_id).into_iter().filter_map(|s| self.find(s)).collect()
    }

    pub(crate) fn all_sessions(&self) -> Vec<Arc<dyn Session>> {
        self.sessions.values().cloned().collect()
    }

    pub(crate) fn session_count(&self) -> usize { self.sessions.len() }

    /// Teardown: empty the pool and refuse further sessions.
    pub(crate) fn close(&mut self) -> Vec<Arc<dyn Session>> {
        self.closed = true;
        self.main_dc_id = None;
        self.retired.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    // ─── Dcenters ────────────────────────────────────────────────────────────

    pub(crate) fn find_dc(&self, shifted: ShiftedDcId) -> Option<Arc<Dcenter>> {
        self.dcenters.get(&shifted).cloned()
    }

    /// Add a record for `shifted` unless one exists. Returns the record in
    /// place and whether it was created.
    pub(crate) fn add_dc(&mut self, shifted: ShiftedDcId, key: Option<AuthKeyPtr>) -> (Arc<Dcenter>, bool) {
        if let Some(existing) = self.dcenters.get(&shifted) {
            return (Arc::clone(existing), false);
        }
        let dc = Arc::new(Dcenter::new(bare_dc_id(shifted), key));
        self.dcenters.insert(shifted, Arc::clone(&dc));
        (dc, true)
    }

    /// Record for `shifted`: its own (destroy slots), else the bare DC's,
    /// created lazily.
    pub(crate) fn dc_by_id(&mut self, shifted: ShiftedDcId) -> Arc<Dcenter> {
        if let Some(dc) = self.find_dc(shifted) {
            return dc;
        }
        self.add_dc(bare_dc_id(shifted), None).0
    }

    pub(crate) fn remove_dc(&mut self, shifted: ShiftedDcId) -> bool {
        self.dcenters.remove(&shifted).is_some()
    }

    pub(crate) fn dc_count(&self) -> usize { self.dcenters.len() }

    pub(crate) fn dc_ids(&self) -> Vec<ShiftedDcId> {
        let mut ids: Vec<_> = self.dcenters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ─── Write-back key cache ────────────────────────────────────────────────

    pub(crate) fn keys_for_write(&self) -> Vec<AuthKeyPtr> {
        self.keys_for_write.values().cloned().collect()
    }

    pub(crate) fn key_dc_ids(&self) -> Vec<ShiftedDcId> {
        self.keys_for_write.keys().copied().collect()
    }

    pub(crate) fn has_key_slot(&self, shifted: ShiftedDcId) -> bool {
        self.keys_for_write.contains_key(&shifted)
    }

    /// Install or remove the cached key. Returns `true` if it changed.
    pub(crate) fn set_key_for_write(&mut self, shifted: ShiftedDcId, key: Option<AuthKeyPtr>) -> bool {
        let unchanged = match (self.keys_for_write.get(&shifted), key.as_ref()) {
            (Some(current), Some(key)) => Arc::ptr_eq(current, key) || **current == **key,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }
        match key {
            Some(key) => self.keys_for_write.insert(shifted, key),
            None => self.keys_for_write.remove(&shifted),
        };
        true
    }

    /// First free key-destruction slot for `dc_id`.
    pub(crate) fn free_destroy_slot(&self, dc_id: DcId) -> ShiftedDcId {
        let mut slot = destroy_key_next_dc_id(dc_id);
        while self.keys_for_write.contains_key(&slot) || self.dcenters.contains_key(&slot) {
            slot = destroy_key_next_dc_id(slot);
        }
        slot
    }
}
