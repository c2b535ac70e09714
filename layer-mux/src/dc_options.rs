//! Known endpoints per DC, refreshed from the server config.

use std::collections::{BTreeMap, BTreeSet};

use crate::dc::{DcId, ShiftedDcId, bare_dc_id};
use crate::schema::{CdnConfig, DcOption};

/// How a DC is treated when opening sessions to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DcType {
    Regular,
    Cdn,
}

/// One reachable address of a DC.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
    pub ip:         String,
    pub port:       u16,
    pub ipv6:       bool,
    pub media_only: bool,
    pub tcpo_only:  bool,
    pub cdn:        bool,
    pub is_static:  bool,
}

impl Endpoint {
    pub fn v4(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            ipv6: false,
            media_only: false,
            tcpo_only: false,
            cdn: false,
            is_static: false,
        }
    }

    /// `ip:port`, bracketing IPv6 addresses.
    pub fn address(&self) -> String {
        if self.ipv6 {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }

    fn from_option(option: &DcOption) -> Option<Self> {
        let port = u16::try_from(option.port).ok()?;
        Some(Self {
            ip: option.ip_address.clone(),
            port,
            ipv6: option.ipv6,
            media_only: option.media_only,
            tcpo_only: option.tcpo_only,
            cdn: option.cdn,
            is_static: option.is_static,
        })
    }
}

/// Endpoint table plus the CDN bookkeeping that goes with it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DcOptions {
    data:            BTreeMap<DcId, Vec<Endpoint>>,
    cdn_dc_ids:      BTreeSet<DcId>,
    cdn_public_keys: BTreeMap<DcId, Vec<String>>,
}

impl DcOptions {
    /// An empty table; endpoints arrive with the first config.
    pub fn empty() -> Self { Self::default() }

    /// Built-in production addresses, used until a config is loaded.
    pub fn production() -> Self {
        let mut options = Self::default();
        for (id, ip) in [
            (1, "149.154.175.53"),
            (2, "149.154.167.51"),
            (3, "149.154.175.100"),
            (4, "149.154.167.91"),
            (5, "91.108.56.130"),
        ] {
            options.add(id, Endpoint::v4(ip, 443));
        }
        options
    }

    /// Add `endpoint` unless an identical `ip:port` is already known.
    /// Returns `true` if something was added.
    pub fn add(&mut self, dc_id: DcId, endpoint: Endpoint) -> bool {
        let list = self.data.entry(bare_dc_id(dc_id)).or_default();
        if list.iter().any(|e| e.ip == endpoint.ip && e.port == endpoint.port) {
            return false;
        }
        list.push(endpoint);
        self.compute_cdn_dc_ids();
        true
    }

    /// Replace the whole table with the options from a loaded config.
    ///
    /// An empty list leaves the table untouched. Returns the DCs whose
    /// endpoints changed.
    pub fn apply(&mut self, options: &[DcOption]) -> Vec<DcId> {
        if options.is_empty() {
            return Vec::new();
        }
        let mut data: BTreeMap<DcId, Vec<Endpoint>> = BTreeMap::new();
        for option in options {
            let Some(endpoint) = Endpoint::from_option(option) else {
                tracing::warn!("[mux/options] bad port {} for dc {}", option.port, option.id);
                continue;
            };
            let list = data.entry(option.id).or_default();
            if !list.iter().any(|e| e.ip == endpoint.ip && e.port == endpoint.port) {
                list.push(endpoint);
            }
        }
        let changed = self
            .data
            .keys()
            .chain(data.keys())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|id| self.data.get(id) != data.get(id))
            .collect();
        self.data = data;
        self.compute_cdn_dc_ids();
        changed
    }

    /// Remember the CDN public keys from `help.getCdnConfig`.
    pub fn set_cdn_config(&mut self, config: &CdnConfig) {
        self.cdn_public_keys.clear();
        for key in &config.public_keys {
            self.cdn_public_keys.entry(key.dc_id).or_default().push(key.public_key.clone());
        }
    }

    pub fn has_cdn_keys_for(&self, dc_id: DcId) -> bool {
        self.cdn_public_keys.contains_key(&dc_id)
    }

    pub fn dc_type(&self, shifted: ShiftedDcId) -> DcType {
        if self.cdn_dc_ids.contains(&bare_dc_id(shifted)) {
            DcType::Cdn
        } else {
            DcType::Regular
        }
    }

    /// Endpoints usable for a session of `kind` to `dc_id`.
    pub fn lookup(&self, dc_id: DcId, kind: DcType) -> Vec<Endpoint> {
        self.data
            .get(&bare_dc_id(dc_id))
            .into_iter()
            .flatten()
            .filter(|e| match kind {
                DcType::Cdn => e.cdn,
                DcType::Regular => !e.media_only,
            })
            .cloned()
            .collect()
    }

    /// Non-CDN DCs, ascending; the order the config loader tries them in.
    pub fn config_enum_dc_ids(&self) -> Vec<DcId> {
        self.data
            .keys()
            .filter(|id| !self.cdn_dc_ids.contains(id))
            .copied()
            .collect()
    }

    pub fn dc_ids(&self) -> Vec<DcId> { self.data.keys().copied().collect() }

    fn compute_cdn_dc_ids(&mut self) {
        self.cdn_dc_ids = self
            .data
            .iter()
            .filter(|(_, list)| list.first().is_some_and(|e| e.cdn))
            .map(|(id, _)| *id)
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dc::shift_dc_id;
    use crate::schema::CdnPublicKey;

    fn option(id: i32, ip: &str, cdn: bool) -> DcOption {
        DcOption { id, ip_address: ip.into(), port: 443, cdn, ..Default::default() }
    }

    #[test]
    fn apply_replaces_and_reports_changes() {
        let mut opts = DcOptions::production();
        let changed = opts.apply(&[option(2, "149.154.167.51", false), option(7, "10.0.0.7", false)]);
        assert_eq!(changed, [1, 3, 4, 5, 7]);
        assert_eq!(opts.dc_ids(), [2, 7]);
        assert!(opts.apply(&[]).is_empty());
        assert_eq!(opts.dc_ids(), [2, 7]);
    }

    #[test]
    fn cdn_dcs_are_typed_and_skipped_by_enumeration() {
        let mut opts = DcOptions::empty();
        opts.apply(&[option(2, "10.0.0.2", false), option(203, "10.0.2.3", true)]);
        assert_eq!(opts.dc_type(shift_dc_id(203, 0x11)), DcType::Cdn);
        assert_eq!(opts.dc_type(2), DcType::Regular);
        assert_eq!(opts.config_enum_dc_ids(), [2]);
        assert_eq!(opts.lookup(203, DcType::Cdn).len(), 1);

        opts.set_cdn_config(&CdnConfig {
            public_keys: vec![CdnPublicKey { dc_id: 203, public_key: "-----BEGIN RSA".into() }],
        });
        assert!(opts.has_cdn_keys_for(203));
        assert!(!opts.has_cdn_keys_for(2));
    }

    #[test]
    fn duplicate_endpoints_are_ignored() {
        let mut opts = DcOptions::empty();
        assert!(opts.add(2, Endpoint::v4("10.0.0.2", 443)));
        assert!(!opts.add(2, Endpoint::v4("10.0.0.2", 443)));
        assert_eq!(opts.lookup(2, DcType::Regular)[0].address(), "10.0.0.2:443");
    }
}
