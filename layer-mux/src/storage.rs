//! Pluggable persistence for keys, the main DC and the config version.
//!
//! Two built-in backends are provided:
//! * [`BinaryFileBackend`]: a compact binary file.
//! * [`InMemoryBackend`]: nothing touches the disk; useful for tests.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::auth_key::{AuthKey, AuthKeyPtr};
use crate::config::Config;
use crate::dc::DcId;

// ─── PersistedState ──────────────────────────────────────────────────────────

/// What survives a restart.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistedState {
    pub main_dc_id:     Option<DcId>,
    pub keys:           Vec<AuthKeyPtr>,
    /// `date` of the last applied server config.
    pub config_version: i32,
}

impl PersistedState {
    const MAGIC: [u8; 4] = *b"LMX1";

    /// Startup configuration equivalent to this state.
    pub fn into_config(self) -> Config {
        Config { main_dc_id: self.main_dc_id, keys: self.keys }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(13 + self.keys.len() * 260);
        b.extend_from_slice(&Self::MAGIC);
        b.extend_from_slice(&self.main_dc_id.unwrap_or(0).to_le_bytes());
        b.extend_from_slice(&self.config_version.to_le_bytes());
        b.push(self.keys.len().min(u8::MAX as usize) as u8);
        for key in self.keys.iter().take(u8::MAX as usize) {
            b.extend_from_slice(&key.dc_id().to_le_bytes());
            b.extend_from_slice(&key.to_bytes());
        }
        b
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut p = 0usize;
        macro_rules! r {
            ($n:expr) => {{
                if p + $n > buf.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated state"));
                }
                let s = &buf[p..p + $n];
                p += $n;
                s
            }};
        }
        let read_i32 = |s: &[u8]| i32::from_le_bytes([s[0], s[1], s[2], s[3]]);

        if r!(4) != Self::MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a layer-mux state file"));
        }
        let main_dc_id = Some(read_i32(r!(4))).filter(|&id| id != 0);
        let config_version = read_i32(r!(4));
        let count = r!(1)[0] as usize;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let dc_id = read_i32(r!(4));
            let mut data = [0u8; 256];
            data.copy_from_slice(r!(256));
            keys.push(Arc::new(AuthKey::from_bytes(dc_id, data)));
        }
        Ok(Self { main_dc_id, keys, config_version })
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// An abstraction over where and how state is persisted.
pub trait StateBackend: Send + Sync {
    fn save(&self, state: &PersistedState) -> io::Result<()>;

    /// Load previously persisted state, or `None` if there is none.
    fn load(&self) -> io::Result<Option<PersistedState>>;

    /// Remove stored state (e.g. after log-out).
    fn delete(&self) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── BinaryFileBackend ────────────────────────────────────────────────────────

/// Stores the state in one binary file, replaced atomically on save.
pub struct BinaryFileBackend {
    path: PathBuf,
}

impl BinaryFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateBackend for BinaryFileBackend {
    fn save(&self, state: &PersistedState) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, state.to_bytes())?;
        std::fs::rename(&tmp, &self.path)
    }

    fn load(&self) -> io::Result<Option<PersistedState>> {
        match std::fs::read(&self.path) {
            Ok(buf) => PersistedState::from_bytes(&buf).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── InMemoryBackend ─────────────────────────────────────────────────────────

/// An ephemeral backend that stores nothing on disk.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<Option<PersistedState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self { Self::default() }
}

impl StateBackend for InMemoryBackend {
    fn save(&self, state: &PersistedState) -> io::Result<()> {
        *self.data.lock() = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedState>> {
        Ok(self.data.lock().clone())
    }

    fn delete(&self) -> io::Result<()> {
        *self.data.lock() = None;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}
