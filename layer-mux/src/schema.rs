//! System calls and result types the multiplexer issues or inspects itself.
//!
//! Only the fields the core consumes are modelled. Each type implements both
//! directions of the codec so that simulated peers (tests, the demo) can
//! produce the same bytes a real server would hand back.

use crate::tl::{
    self, Cursor, Deserializable, Identifiable, RemoteCall, Serializable, serialize_vec,
};

/// `rpc_result#f35c6d01`: the envelope sessions unwrap before delivering.
pub const ID_RPC_RESULT: u32 = 0xf35c6d01;
/// `rpc_error#2144ca19 error_code:int error_message:string`.
pub const ID_RPC_ERROR: u32 = 0x2144ca19;
/// `gzip_packed#3072cfa1 packed_data:bytes`.
pub const ID_GZIP_PACKED: u32 = 0x3072cfa1;

fn expect_id(buf: &mut Cursor<'_>, want: u32) -> tl::Result<()> {
    let id = u32::deserialize(buf)?;
    if id == want { Ok(()) } else { Err(tl::Error::UnexpectedConstructor { id }) }
}

// ─── rpc_error ───────────────────────────────────────────────────────────────

/// Raw `rpc_error` body as it appears on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRpcError {
    pub error_code:    i32,
    pub error_message: String,
}

impl Identifiable for RawRpcError {
    const CONSTRUCTOR_ID: u32 = ID_RPC_ERROR;
}

impl Serializable for RawRpcError {
    fn serialize(&self, buf: &mut Vec<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.error_code.serialize(buf);
        self.error_message.serialize(buf);
    }
}

impl Deserializable for RawRpcError {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            error_code:    i32::deserialize(buf)?,
            error_message: String::deserialize(buf)?,
        })
    }
}

// ─── gzip_packed ─────────────────────────────────────────────────────────────

/// `gzip_packed` wrapper; `packed_data` is a gzip stream.
#[derive(Clone, Debug, PartialEq)]
pub struct GzipPacked {
    pub packed_data: Vec<u8>,
}

impl Serializable for GzipPacked {
    fn serialize(&self, buf: &mut Vec<u8>) {
        ID_GZIP_PACKED.serialize(buf);
        self.packed_data.serialize(buf);
    }
}

impl Deserializable for GzipPacked {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        expect_id(buf, ID_GZIP_PACKED)?;
        Ok(Self { packed_data: Vec::<u8>::deserialize(buf)? })
    }
}

// ─── help.getConfig ──────────────────────────────────────────────────────────

/// `dcOption flags:# ipv6:flags.0?true media_only:flags.1?true
/// tcpo_only:flags.2?true cdn:flags.3?true static:flags.4?true
/// id:int ip_address:string port:int`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DcOption {
    pub ipv6:       bool,
    pub media_only: bool,
    pub tcpo_only:  bool,
    pub cdn:        bool,
    pub is_static:  bool,
    pub id:         i32,
    pub ip_address: String,
    pub port:       i32,
}

impl Identifiable for DcOption {
    const CONSTRUCTOR_ID: u32 = 0x18b7a10d;
}

impl Serializable for DcOption {
    fn serialize(&self, buf: &mut Vec<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        let flags = (self.ipv6 as u32)
            | (self.media_only as u32) << 1
            | (self.tcpo_only as u32) << 2
            | (self.cdn as u32) << 3
            | (self.is_static as u32) << 4;
        flags.serialize(buf);
        self.id.serialize(buf);
        self.ip_address.serialize(buf);
        self.port.serialize(buf);
    }
}

impl Deserializable for DcOption {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        let flags = u32::deserialize(buf)?;
        Ok(Self {
            ipv6:       flags & 1 != 0,
            media_only: flags & (1 << 1) != 0,
            tcpo_only:  flags & (1 << 2) != 0,
            cdn:        flags & (1 << 3) != 0,
            is_static:  flags & (1 << 4) != 0,
            id:         i32::deserialize(buf)?,
            ip_address: String::deserialize(buf)?,
            port:       i32::deserialize(buf)?,
        })
    }
}

/// The subset of `config` the multiplexer applies.
///
/// ```text
/// config flags:# date:int expires:int test_mode:Bool this_dc:int
///   dc_options:Vector<DcOption> chat_size_max:int megagroup_size_max:int
///   forwarded_count_max:int online_update_period_ms:int
///   offline_blur_timeout_ms:int offline_idle_timeout_ms:int
///   online_cloud_timeout_ms:int notify_cloud_delay_ms:int
///   notify_default_delay_ms:int saved_gifs_limit:int edit_time_limit:int
///   caption_length_max:int message_length_max:int webfile_dc_id:int
///   me_url_prefix:string
///   autoupdate_url_prefix:flags.7?string suggested_lang_code:flags.2?string
///   lang_pack_version:flags.2?int base_lang_pack_version:flags.2?int
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerConfig {
    pub date:                    i32,
    pub expires:                 i32,
    pub test_mode:               bool,
    pub this_dc:                 i32,
    pub dc_options:              Vec<DcOption>,
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
    pub webfile_dc_id:           i32,
    pub me_url_prefix:           String,
    pub autoupdate_url_prefix:   Option<String>,
    pub suggested_lang_code:     Option<String>,
    pub lang_pack_version:       Option<i32>,
    pub base_lang_pack_version:  Option<i32>,
}

impl Identifiable for ServerConfig {
    const CONSTRUCTOR_ID: u32 = 0xcc1a241e;
}

impl Serializable for ServerConfig {
    fn serialize(&self, buf: &mut Vec<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        let mut flags = 0u32;
        if self.autoupdate_url_prefix.is_some() { flags |= 1 << 7; }
        if self.suggested_lang_code.is_some() { flags |= 1 << 2; }
        flags.serialize(buf);
        self.date.serialize(buf);
        self.expires.serialize(buf);
        self.test_mode.serialize(buf);
        self.this_dc.serialize(buf);
        serialize_vec(&self.dc_options, buf);
        for v in [
            self.chat_size_max,
            self.megagroup_size_max,
            self.forwarded_count_max,
            self.online_update_period_ms,
            self.offline_blur_timeout_ms,
            self.offline_idle_timeout_ms,
            self.online_cloud_timeout_ms,
            self.notify_cloud_delay_ms,
            self.notify_default_delay_ms,
            self.saved_gifs_limit,
            self.edit_time_limit,
            self.caption_length_max,
            self.message_length_max,
            self.webfile_dc_id,
        ] {
            v.serialize(buf);
        }
        self.me_url_prefix.serialize(buf);
        if let Some(prefix) = &self.autoupdate_url_prefix {
            prefix.serialize(buf);
        }
        if let Some(code) = &self.suggested_lang_code {
            code.serialize(buf);
            self.lang_pack_version.unwrap_or(0).serialize(buf);
            self.base_lang_pack_version.unwrap_or(0).serialize(buf);
        }
    }
}

impl Deserializable for ServerConfig {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        let flags = u32::deserialize(buf)?;
        let mut cfg = Self {
            date:       i32::deserialize(buf)?,
            expires:    i32::deserialize(buf)?,
            test_mode:  bool::deserialize(buf)?,
            this_dc:    i32::deserialize(buf)?,
            dc_options: Vec::<DcOption>::deserialize(buf)?,
            ..Default::default()
        };
        cfg.chat_size_max = i32::deserialize(buf)?;
        cfg.megagroup_size_max = i32::deserialize(buf)?;
        cfg.forwarded_count_max = i32::deserialize(buf)?;
        cfg.online_update_period_ms = i32::deserialize(buf)?;
        cfg.offline_blur_timeout_ms = i32::deserialize(buf)?;
        cfg.offline_idle_timeout_ms = i32::deserialize(buf)?;
        cfg.online_cloud_timeout_ms = i32::deserialize(buf)?;
        cfg.notify_cloud_delay_ms = i32::deserialize(buf)?;
        cfg.notify_default_delay_ms = i32::deserialize(buf)?;
        cfg.saved_gifs_limit = i32::deserialize(buf)?;
        cfg.edit_time_limit = i32::deserialize(buf)?;
        cfg.caption_length_max = i32::deserialize(buf)?;
        cfg.message_length_max = i32::deserialize(buf)?;
        cfg.webfile_dc_id = i32::deserialize(buf)?;
        cfg.me_url_prefix = String::deserialize(buf)?;
        if flags & (1 << 7) != 0 {
            cfg.autoupdate_url_prefix = Some(String::deserialize(buf)?);
        }
        if flags & (1 << 2) != 0 {
            cfg.suggested_lang_code = Some(String::deserialize(buf)?);
            cfg.lang_pack_version = Some(i32::deserialize(buf)?);
            cfg.base_lang_pack_version = Some(i32::deserialize(buf)?);
        }
        Ok(cfg)
    }
}

/// `help.getConfig#c4f9186b = Config`
#[derive(Clone, Debug, Default)]
pub struct GetConfig;

impl Serializable for GetConfig {
    fn serialize(&self, buf: &mut Vec<u8>) { 0xc4f9186bu32.serialize(buf) }
}

impl RemoteCall for GetConfig {
    type Return = ServerConfig;
}

// ─── help.getCdnConfig ───────────────────────────────────────────────────────

/// `cdnPublicKey#c982eaba dc_id:int public_key:string`
#[derive(Clone, Debug, PartialEq)]
pub struct CdnPublicKey {
    pub dc_id:      i32,
    pub public_key: String,
}

impl Serializable for CdnPublicKey {
    fn serialize(&self, buf: &mut Vec<u8>) {
        0xc982eabau32.serialize(buf);
        self.dc_id.serialize(buf);
        self.public_key.serialize(buf);
    }
}

impl Deserializable for CdnPublicKey {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        expect_id(buf, 0xc982eaba)?;
        Ok(Self {
            dc_id:      i32::deserialize(buf)?,
            public_key: String::deserialize(buf)?,
        })
    }
}

/// `cdnConfig#5725e40a public_keys:Vector<CdnPublicKey>`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CdnConfig {
    pub public_keys: Vec<CdnPublicKey>,
}

impl Serializable for CdnConfig {
    fn serialize(&self, buf: &mut Vec<u8>) {
        0x5725e40au32.serialize(buf);
        serialize_vec(&self.public_keys, buf);
    }
}

impl Deserializable for CdnConfig {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        expect_id(buf, 0x5725e40a)?;
        Ok(Self { public_keys: Vec::<CdnPublicKey>::deserialize(buf)? })
    }
}

/// `help.getCdnConfig#52029342 = CdnConfig`
#[derive(Clone, Debug, Default)]
pub struct GetCdnConfig;

impl Serializable for GetCdnConfig {
    fn serialize(&self, buf: &mut Vec<u8>) { 0x52029342u32.serialize(buf) }
}

impl RemoteCall for GetCdnConfig {
    type Return = CdnConfig;
}

// ─── auth.exportAuthorization / auth.importAuthorization ─────────────────────

/// `auth.exportAuthorization#e5bfffcd dc_id:int = auth.ExportedAuthorization`
#[derive(Clone, Debug)]
pub struct ExportAuthorization {
    pub dc_id: i32,
}

impl Serializable for ExportAuthorization {
    fn serialize(&self, buf: &mut Vec<u8>) {
        0xe5bfffcdu32.serialize(buf);
        self.dc_id.serialize(buf);
    }
}

impl RemoteCall for ExportAuthorization {
    type Return = ExportedAuthorization;
}

/// `auth.exportedAuthorization#b434e2b8 id:long bytes:bytes`
#[derive(Clone, Debug, PartialEq)]
pub struct ExportedAuthorization {
    pub id:    i64,
    pub bytes: Vec<u8>,
}

impl Serializable for ExportedAuthorization {
    fn serialize(&self, buf: &mut Vec<u8>) {
        0xb434e2b8u32.serialize(buf);
        self.id.serialize(buf);
        self.bytes.serialize(buf);
    }
}

impl Deserializable for ExportedAuthorization {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        expect_id(buf, 0xb434e2b8)?;
        Ok(Self {
            id:    i64::deserialize(buf)?,
            bytes: Vec::<u8>::deserialize(buf)?,
        })
    }
}

/// `auth.importAuthorization#a57a7dad id:long bytes:bytes = auth.Authorization`
#[derive(Clone, Debug)]
pub struct ImportAuthorization {
    pub id:    i64,
    pub bytes: Vec<u8>,
}

impl Serializable for ImportAuthorization {
    fn serialize(&self, buf: &mut Vec<u8>) {
        0xa57a7dadu32.serialize(buf);
        self.id.serialize(buf);
        self.bytes.serialize(buf);
    }
}

impl RemoteCall for ImportAuthorization {
    type Return = tl::Blob;
}

// ─── auth.logOut / destroy_auth_key ──────────────────────────────────────────

/// `auth.logOut#3e72ba19 = auth.LoggedOut`
#[derive(Clone, Debug, Default)]
pub struct LogOut;

impl Serializable for LogOut {
    fn serialize(&self, buf: &mut Vec<u8>) { 0x3e72ba19u32.serialize(buf) }
}

impl RemoteCall for LogOut {
    type Return = tl::Blob;
}

/// `destroy_auth_key#d1435160 = DestroyAuthKeyRes`
#[derive(Clone, Debug, Default)]
pub struct DestroyAuthKey;

impl Serializable for DestroyAuthKey {
    fn serialize(&self, buf: &mut Vec<u8>) { 0xd1435160u32.serialize(buf) }
}

impl RemoteCall for DestroyAuthKey {
    type Return = DestroyAuthKeyRes;
}

/// Server verdict on a key destruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyAuthKeyRes {
    /// `destroy_auth_key_ok#f660e1d4`
    Ok,
    /// `destroy_auth_key_none#0a9f2259`
    None,
    /// `destroy_auth_key_fail#ea109b13`
    Fail,
}

impl Serializable for DestroyAuthKeyRes {
    fn serialize(&self, buf: &mut Vec<u8>) {
        let id: u32 = match self {
            Self::Ok   => 0xf660e1d4,
            Self::None => 0x0a9f2259,
            Self::Fail => 0xea109b13,
        };
        id.serialize(buf);
    }
}

impl Deserializable for DestroyAuthKeyRes {
    fn deserialize(buf: &mut Cursor<'_>) -> tl::Result<Self> {
        match u32::deserialize(buf)? {
            0xf660e1d4 => Ok(Self::Ok),
            0x0a9f2259 => Ok(Self::None),
            0xea109b13 => Ok(Self::Fail),
            id => Err(tl::Error::UnexpectedConstructor { id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_optional_tail_follows_flags() {
        let cfg = ServerConfig {
            date: 100,
            expires: 3700,
            this_dc: 2,
            dc_options: vec![DcOption { id: 2, ip_address: "10.0.0.2".into(), port: 443, ..Default::default() }],
            me_url_prefix: "https://t.me/".into(),
            suggested_lang_code: Some("de".into()),
            lang_pack_version: Some(7),
            base_lang_pack_version: Some(3),
            ..Default::default()
        };
        let back = ServerConfig::from_bytes(&cfg.to_bytes()).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.autoupdate_url_prefix, None);
    }

    #[test]
    fn rpc_error_has_expected_prefix() {
        let raw = RawRpcError { error_code: 420, error_message: "FLOOD_WAIT_5".into() };
        let bytes = raw.to_bytes();
        assert_eq!(tl::peek_constructor(&bytes), Some(ID_RPC_ERROR));
        assert_eq!(RawRpcError::from_bytes(&bytes).unwrap(), raw);
    }

    #[test]
    fn unknown_destroy_result_is_rejected() {
        assert!(DestroyAuthKeyRes::from_bytes(&0xdeadbeefu32.to_le_bytes()).is_err());
    }
}
