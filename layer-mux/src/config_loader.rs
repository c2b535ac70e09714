//! Fetching `help.getConfig` and `help.getCdnConfig`.
//!
//! The config is asked from the main DC first. If that fails, or takes more
//! than [`ENUMERATE_TIMEOUT`], each known DC is tried in turn over a
//! dedicated config session until one answers.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Mode;
use crate::dc::{DcId, ShiftedDcId, config_dc_id};
use crate::errors::RpcError;
use crate::events::Event;
use crate::instance::Inner;
use crate::request::{RequestId, Response};
use crate::schema::{CdnConfig, GetCdnConfig, GetConfig, ServerConfig};

const ENUMERATE_TIMEOUT: Duration = Duration::from_secs(8);
const CONFIG_BECOMES_OLD_IN: Duration = Duration::from_secs(2 * 60);
const BLOCKED_CONFIG_BECOMES_OLD_IN: Duration = Duration::from_secs(8);
const MAX_EXPIRY_CHECK_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
pub(crate) struct ConfigState {
    loader:            Option<ConfigLoader>,
    last_loaded:       Option<Instant>,
    expires_at:        Option<Instant>,
    /// Bumped on every load so stale expiry timers give up.
    expiry_generation: u64,
    cdn_loading:       bool,
}

#[derive(Default)]
struct ConfigLoader {
    main_request: RequestId,
    enumeration:  Option<(ShiftedDcId, RequestId)>,
    tried:        BTreeSet<DcId>,
}

impl Inner {
    pub(crate) fn request_config(&self) {
        if self.mode == Mode::KeysDestroyer {
            return;
        }
        {
            let mut state = self.config.lock();
            if state.loader.is_some() {
                return;
            }
            state.loader = Some(ConfigLoader::default());
        }
        debug!("[mux/config] requesting config from main dc");
        let id = self.send_get_config(0);
        if let Some(loader) = self.config.lock().loader.as_mut() {
            loader.main_request = id;
        }
        self.home.post_after(ENUMERATE_TIMEOUT, |inner| inner.enumerate_config_dc());
    }

    fn send_get_config(&self, to_dc: ShiftedDcId) -> RequestId {
        let on_done = self.me.clone();
        let on_fail = self.me.clone();
        self.call(
            &GetConfig,
            to_dc,
            move |config, response| {
                if let Some(inner) = on_done.upgrade() {
                    inner.config_load_done(config, response);
                }
            },
            move |error, _| {
                if let Some(inner) = on_fail.upgrade() {
                    inner.config_load_failed(to_dc, error);
                }
            },
        )
    }

    /// Try the next DC over its config session, giving up on the previous one.
    fn enumerate_config_dc(&self) {
        let candidates = self.dc_options.read().config_enum_dc_ids();
        let (next, previous) = {
            let mut state = self.config.lock();
            let Some(loader) = state.loader.as_mut() else { return };
            let mut next = candidates.iter().copied().find(|dc| !loader.tried.contains(dc));
            if next.is_none() {
                loader.tried.clear();
                next = candidates.first().copied();
            }
            let Some(next) = next else {
                warn!("[mux/config] no dc options to enumerate");
                return;
            };
            loader.tried.insert(next);
            (next, loader.enumeration.take())
        };

        if let Some((shifted, request_id)) = previous {
            self.cancel(request_id);
            self.kill_session(shifted);
        }

        let shifted = config_dc_id(next);
        info!("[mux/config] asking dc {next} for config");
        let request_id = self.send_get_config(shifted);
        if let Some(loader) = self.config.lock().loader.as_mut() {
            loader.enumeration = Some((shifted, request_id));
        }
        self.home.post_after(ENUMERATE_TIMEOUT, |inner| inner.enumerate_config_dc());
    }

    fn config_load_done(&self, config: ServerConfig, response: &Response) {
        let now = Instant::now();
        let expires_in = i64::from(config.expires) - chrono::Utc::now().timestamp();
        let (loader, generation) = {
            let mut state = self.config.lock();
            state.last_loaded = Some(now);
            state.expires_at = Some(now + Duration::from_secs(expires_in.max(0) as u64));
            state.expiry_generation += 1;
            (state.loader.take(), state.expiry_generation)
        };
        if let Some(loader) = loader {
            if loader.main_request != response.request_id {
                self.cancel(loader.main_request);
            }
            if let Some((shifted, request_id)) = loader.enumeration {
                if request_id != response.request_id {
                    self.cancel(request_id);
                }
                self.kill_session(shifted);
            }
        }

        let changed = self.dc_options.write().apply(&config.dc_options);
        self.values.write().apply(&config);

        let language = &self.ctx.language;
        language.set_suggested_language(config.suggested_lang_code.as_deref().unwrap_or(""));
        language.set_current_versions(
            config.lang_pack_version.unwrap_or(0),
            config.base_lang_pack_version.unwrap_or(0),
        );

        info!(
            "[mux/config] loaded: {} dc options ({} dcs changed), expires in {expires_in}s",
            config.dc_options.len(),
            changed.len(),
        );
        self.emit(Event::ConfigLoaded);
        self.request_persist();
        self.request_config_if_expired(generation);
    }

    fn config_load_failed(&self, to_dc: ShiftedDcId, error: &RpcError) {
        warn!("[mux/config] config request to {to_dc} failed: {error}");
        self.enumerate_config_dc();
    }

    /// Re-fetch once the loaded config expires, checking at least hourly.
    fn request_config_if_expired(&self, generation: u64) {
        let remaining = {
            let state = self.config.lock();
            if state.expiry_generation != generation {
                return;
            }
            state.expires_at.map(|at| at.saturating_duration_since(Instant::now()))
        };
        match remaining {
            Some(left) if !left.is_zero() => {
                self.home.post_after(left.min(MAX_EXPIRY_CHECK_WAIT), move |inner| {
                    inner.request_config_if_expired(generation)
                });
            }
            _ => self.request_config(),
        }
    }

    pub(crate) fn request_config_if_old(&self) {
        let timeout = if self.values.read().blocked_mode {
            BLOCKED_CONFIG_BECOMES_OLD_IN
        } else {
            CONFIG_BECOMES_OLD_IN
        };
        let old = self.config.lock().last_loaded.is_none_or(|at| at.elapsed() >= timeout);
        if old {
            self.request_config();
        }
    }

    pub(crate) fn request_cdn_config(&self) {
        if self.main_dc_id().is_none() {
            return;
        }
        {
            let mut state = self.config.lock();
            if state.cdn_loading {
                return;
            }
            state.cdn_loading = true;
        }
        let on_done = self.me.clone();
        let on_fail = self.me.clone();
        self.call(
            &GetCdnConfig,
            0,
            move |config, _| {
                if let Some(inner) = on_done.upgrade() {
                    inner.cdn_config_loaded(config);
                }
            },
            move |error, _| {
                if let Some(inner) = on_fail.upgrade() {
                    warn!("[mux/config] cdn config request failed: {error}");
                    inner.config.lock().cdn_loading = false;
                }
            },
        );
    }

    fn cdn_config_loaded(&self, config: CdnConfig) {
        self.config.lock().cdn_loading = false;
        debug!("[mux/config] {} cdn public keys", config.public_keys.len());
        self.dc_options.write().set_cdn_config(&config);
        self.emit(Event::CdnConfigLoaded);
        self.request_persist();
    }
}
