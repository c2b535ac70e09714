//! Startup configuration and the runtime policy values pushed by the server.

use std::fmt;

use crate::auth_key::AuthKeyPtr;
use crate::dc::DcId;
use crate::schema::ServerConfig;

/// What the instance is for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Regular client operation with a main DC.
    #[default]
    Normal,
    /// No main DC: log out and destroy every supplied key, then signal.
    KeysDestroyer,
}

/// Supplied once at construction.
#[derive(Clone, Default)]
pub struct Config {
    /// Main DC. `None` means "not chosen yet": the default DC is used and
    /// the server may still suggest another one.
    pub main_dc_id: Option<DcId>,
    /// Keys loaded from storage.
    pub keys:       Vec<AuthKeyPtr>,
}

impl Config {
    pub fn new() -> Self { Self::default() }

    pub fn with_main_dc(mut self, dc_id: DcId) -> Self {
        self.main_dc_id = Some(dc_id);
        self
    }

    pub fn with_key(mut self, key: AuthKeyPtr) -> Self {
        self.keys.push(key);
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("main_dc_id", &self.main_dc_id)
            .field("keys", &self.keys)
            .finish()
    }
}

// ─── ConfigValues ────────────────────────────────────────────────────────────

/// Shared runtime policy, updated from every loaded server config.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfigValues {
    pub chat_size_max:           i32,
    pub megagroup_size_max:      i32,
    pub forwarded_count_max:     i32,
    pub online_update_period_ms: i32,
    pub offline_blur_timeout_ms: i32,
    pub offline_idle_timeout_ms: i32,
    pub online_cloud_timeout_ms: i32,
    pub notify_cloud_delay_ms:   i32,
    pub notify_default_delay_ms: i32,
    pub saved_gifs_limit:        i32,
    pub edit_time_limit:         i32,
    pub caption_length_max:      i32,
    pub message_length_max:      i32,
    pub webfile_dc_id:           DcId,
    pub me_url_prefix:           String,
    pub autoupdate_url_prefix:   Option<String>,
    pub test_mode:               bool,
    /// Set when the network looks filtered; makes config refreshes eager.
    pub blocked_mode:            bool,
    /// `date` of the last applied config, `0` if none yet.
    pub version:                 i32,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            chat_size_max:           200,
            megagroup_size_max:      10_000,
            forwarded_count_max:     100,
            online_update_period_ms: 120_000,
            offline_blur_timeout_ms: 5_000,
            offline_idle_timeout_ms: 30_000,
            online_cloud_timeout_ms: 300_000,
            notify_cloud_delay_ms:   30_000,
            notify_default_delay_ms: 1_500,
            saved_gifs_limit:        200,
            edit_time_limit:         172_800,
            caption_length_max:      1_024,
            message_length_max:      4_096,
            webfile_dc_id:           4,
            me_url_prefix:           "https://t.me/".to_string(),
            autoupdate_url_prefix:   None,
            test_mode:               false,
            blocked_mode:            false,
            version:                 0,
        }
    }
}

impl ConfigValues {
    pub fn apply(&mut self, cfg: &ServerConfig) {
        self.chat_size_max = cfg.chat_size_max.max(2);
        self.megagroup_size_max = cfg.megagroup_size_max.max(2);
        self.forwarded_count_max = cfg.forwarded_count_max.max(2);
        self.online_update_period_ms = cfg.online_update_period_ms;
        self.offline_blur_timeout_ms = cfg.offline_blur_timeout_ms;
        self.offline_idle_timeout_ms = cfg.offline_idle_timeout_ms;
        self.online_cloud_timeout_ms = cfg.online_cloud_timeout_ms;
        self.notify_cloud_delay_ms = cfg.notify_cloud_delay_ms;
        self.notify_default_delay_ms = cfg.notify_default_delay_ms;
        self.saved_gifs_limit = cfg.saved_gifs_limit;
        self.edit_time_limit = cfg.edit_time_limit;
        self.caption_length_max = cfg.caption_length_max;
        self.message_length_max = cfg.message_length_max;
        self.webfile_dc_id = cfg.webfile_dc_id;
        self.me_url_prefix = cfg.me_url_prefix.clone();
        self.autoupdate_url_prefix = cfg.autoupdate_url_prefix.clone();
        self.test_mode = cfg.test_mode;
        self.version = cfg.date;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_takes_server_limits() {
        let mut values = ConfigValues::default();
        let cfg = ServerConfig {
            date: 1_700_000_000,
            chat_size_max: 0,
            megagroup_size_max: 200_000,
            caption_length_max: 2048,
            me_url_prefix: "https://example.org/".into(),
            ..Default::default()
        };
        values.apply(&cfg);
        assert_eq!(values.chat_size_max, 2);
        assert_eq!(values.megagroup_size_max, 200_000);
        assert_eq!(values.caption_length_max, 2048);
        assert_eq!(values.me_url_prefix, "https://example.org/");
        assert_eq!(values.version, 1_700_000_000);
        assert!(!values.blocked_mode);
    }
}
