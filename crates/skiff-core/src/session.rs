//! Session descriptors: connection parameters, protocol tunables, tunnel
//! sub-options, and filesystem policy. Every field has a typed default so a
//! descriptor can be built incrementally from a URL, a stored preset, or both.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Sftp,
    Scp,
    Ftp,
    Ftps,
    WebDav,
    WebDavs,
    S3,
    /// Secondary-session mode: a bare shell used to run commands for backends
    /// that cannot.
    Shell,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp | Protocol::Scp | Protocol::Shell => 22,
            Protocol::Ftp => 21,
            Protocol::Ftps => 990,
            Protocol::WebDav => 80,
            Protocol::WebDavs | Protocol::S3 => 443,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Sftp => "sftp",
            Protocol::Scp => "scp",
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::WebDav => "dav",
            Protocol::WebDavs => "davs",
            Protocol::S3 => "s3",
            Protocol::Shell => "shell",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        Some(match scheme {
            "sftp" => Protocol::Sftp,
            "scp" => Protocol::Scp,
            "ftp" => Protocol::Ftp,
            "ftps" => Protocol::Ftps,
            "dav" | "http" => Protocol::WebDav,
            "davs" | "https" => Protocol::WebDavs,
            "s3" => Protocol::S3,
            _ => return None,
        })
    }

    /// True for protocols carried over a secure-shell transport.
    pub fn is_secure_shell(self) -> bool {
        matches!(self, Protocol::Sftp | Protocol::Scp | Protocol::Shell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionSource {
    #[default]
    Unset,
    Stored,
    StoredModified,
}

/// Daylight-saving handling policy for remote timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DstMode {
    Unix,
    #[default]
    Keep,
    Win,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PingType {
    #[default]
    Off,
    NullPacket,
    DummyCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProxyMethod {
    #[default]
    None,
    Socks4,
    Socks5,
    Http,
    Telnet,
    LocalCommand,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    pub method: ProxyMethod,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<SealedSecret>,
    pub telnet_command: String,
    pub local_command: String,
    pub dns: bool,
    pub localhost: bool,
}

/// Tunnel sub-descriptor: credentials and endpoint of the secure-shell hop
/// the primary connection is routed through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<SealedSecret>,
    pub public_key_file: Option<String>,
    /// Explicit local forward port; 0 autoselects from the configured range.
    pub local_port: u16,
}

/// A stored secret, sealed through the host's password codec. The in-memory
/// representation is an opaque string; `Configuration` owns the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret(pub String);

impl SealedSecret {
    /// Seal with the crate default codec (base64). Hosts with a real key
    /// store install their own codec on `Configuration`.
    pub fn seal_default(plain: &str) -> Self {
        SealedSecret(base64::engine::general_purpose::STANDARD.encode(plain))
    }

    pub fn unseal_default(&self) -> Option<String> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.0)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

/// Snapshot of the pre-tunnel endpoint so `rollback_tunnel` is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TunnelSnapshot {
    host: String,
    port: u16,
    proxy_method: ProxyMethod,
}

/// The full session descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<SealedSecret>,
    pub key_file: Option<String>,
    pub key_passphrase: Option<SealedSecret>,
    pub protocol: Protocol,

    // Protocol tunables.
    pub cipher_list: Vec<String>,
    pub kex_list: Vec<String>,
    pub host_key_list: Vec<String>,
    /// Cached host-key fingerprint for later comparison.
    pub host_key_fingerprint: Option<String>,
    pub sftp_max_version: u8,
    pub ftp_passive: bool,
    pub tls_min_version: String,
    pub tls_max_version: String,
    pub proxy: ProxyOptions,

    pub tunnel: Option<TunnelOptions>,
    /// Port-forward directive installed on a forged tunnel descriptor,
    /// `L<port>\t<host>:<port>`.
    pub tunnel_port_fwd: Option<String>,

    // Timing.
    pub ping_interval_secs: u32,
    pub ping_type: PingType,
    pub timeout_secs: u32,
    pub rekey_data: String,
    pub rekey_time_mins: u32,
    pub send_buf: u32,

    // Filesystem policy.
    pub remote_directory: Option<String>,
    pub recycle_bin_path: Option<String>,
    pub delete_to_recycle: bool,
    pub overwrite_to_recycle: bool,
    pub dst_mode: DstMode,
    pub code_page: String,
    pub cache_directories: bool,
    pub cache_directory_changes: bool,
    pub preserve_directory_changes: bool,
    pub resolve_symlinks: bool,

    pub source: SessionSource,
    /// Reopen attempts made since the last successful open.
    #[serde(skip)]
    pub number_of_retries: u32,

    #[serde(skip)]
    pub(crate) tunnel_snapshot: Option<TunnelSnapshot>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 22,
            user: String::new(),
            password: None,
            key_file: None,
            key_passphrase: None,
            protocol: Protocol::Sftp,
            cipher_list: Vec::new(),
            kex_list: Vec::new(),
            host_key_list: Vec::new(),
            host_key_fingerprint: None,
            sftp_max_version: 6,
            ftp_passive: true,
            tls_min_version: "1.2".to_string(),
            tls_max_version: "1.3".to_string(),
            proxy: ProxyOptions::default(),
            tunnel: None,
            tunnel_port_fwd: None,
            ping_interval_secs: 30,
            ping_type: PingType::Off,
            timeout_secs: 15,
            rekey_data: "1G".to_string(),
            rekey_time_mins: 60,
            send_buf: 262_144,
            remote_directory: None,
            recycle_bin_path: None,
            delete_to_recycle: false,
            overwrite_to_recycle: false,
            dst_mode: DstMode::default(),
            code_page: "UTF-8".to_string(),
            cache_directories: true,
            cache_directory_changes: true,
            preserve_directory_changes: false,
            resolve_symlinks: true,
            source: SessionSource::Unset,
            number_of_retries: 0,
            tunnel_snapshot: None,
        }
    }
}

impl SessionData {
    /// Parses `scheme://[user@]host[:port][/initial/dir]` into a descriptor
    /// with typed defaults for everything not present in the URL. IPv6 hosts
    /// must be wrapped in `[]`.
    pub fn parse_url(raw: &str) -> SessionResult<Self> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| SessionError::command(format!("session URL missing scheme: {raw}")))?;
        let protocol = Protocol::from_scheme(scheme)
            .ok_or_else(|| SessionError::command(format!("unknown session scheme '{scheme}'")))?;

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, ""),
        };

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) => (user.to_string(), host_port),
            None => (String::new(), authority),
        };

        let (host, port) = parse_authority(host_port, protocol.default_port())?;
        if host.is_empty() {
            return Err(SessionError::command(format!("session URL missing host: {raw}")));
        }

        let mut data = SessionData {
            host,
            port,
            user,
            protocol,
            ..SessionData::default()
        };
        if !path.is_empty() && path != "/" {
            data.remote_directory = Some(path.to_string());
        }
        Ok(data)
    }

    /// Stable identity for persisted per-session state (change cache, …).
    pub fn session_key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    pub fn session_name(&self) -> String {
        if self.name.is_empty() {
            self.session_key()
        } else {
            self.name.clone()
        }
    }

    /// Point the descriptor at the local tunnel forward, snapshotting the
    /// original endpoint for [`SessionData::rollback_tunnel`].
    pub fn configure_tunnel(&mut self, local_port: u16) {
        if self.tunnel_snapshot.is_none() {
            self.tunnel_snapshot = Some(TunnelSnapshot {
                host: self.host.clone(),
                port: self.port,
                proxy_method: self.proxy.method,
            });
        }
        self.host = "127.0.0.1".to_string();
        self.port = local_port;
        // The tunnel hop carries the proxy; the forwarded leg is direct.
        self.proxy.method = ProxyMethod::None;
    }

    pub fn rollback_tunnel(&mut self) {
        if let Some(snapshot) = self.tunnel_snapshot.take() {
            self.host = snapshot.host;
            self.port = snapshot.port;
            self.proxy.method = snapshot.proxy_method;
        }
    }

    pub fn orig_host_name(&self) -> &str {
        match &self.tunnel_snapshot {
            Some(snapshot) => &snapshot.host,
            None => &self.host,
        }
    }

    pub fn orig_port_number(&self) -> u16 {
        match &self.tunnel_snapshot {
            Some(snapshot) => snapshot.port,
            None => self.port,
        }
    }

    /// Re-seal stored secrets after a master-key change.
    pub fn recrypt_passwords(&mut self, recode: &dyn Fn(&str) -> String) {
        for slot in [
            &mut self.password,
            &mut self.key_passphrase,
            &mut self.proxy.password,
        ] {
            if let Some(secret) = slot.as_mut() {
                let resealed = recode(&secret.0);
                *secret = SealedSecret(resealed);
            }
        }
        if let Some(tunnel) = &mut self.tunnel {
            if let Some(secret) = &mut tunnel.password {
                let resealed = recode(&secret.0);
                *secret = SealedSecret(resealed);
            }
        }
    }
}

fn parse_authority(authority: &str, default_port: u16) -> SessionResult<(String, u16)> {
    if authority.starts_with('[') {
        // IPv6 literal
        let closing = authority
            .find(']')
            .ok_or_else(|| SessionError::command(format!("unterminated IPv6 address: {authority}")))?;
        let host = authority[1..closing].to_string();
        let rest = &authority[closing + 1..];
        let port = if rest.is_empty() {
            default_port
        } else if let Some(port) = rest.strip_prefix(':') {
            parse_port(port, default_port)?
        } else {
            return Err(SessionError::command(format!("invalid authority {authority}")));
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port, default_port)?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(raw: &str, default_port: u16) -> SessionResult<u16> {
    if raw.is_empty() {
        return Ok(default_port);
    }
    raw.parse::<u16>()
        .map_err(|_| SessionError::command(format!("invalid port '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_url() {
        let data = SessionData::parse_url("sftp://deploy@files.example.com:2022/srv/www").unwrap();
        assert_eq!(data.protocol, Protocol::Sftp);
        assert_eq!(data.user, "deploy");
        assert_eq!(data.host, "files.example.com");
        assert_eq!(data.port, 2022);
        assert_eq!(data.remote_directory.as_deref(), Some("/srv/www"));
    }

    #[test]
    fn defaults_port_per_protocol() {
        let data = SessionData::parse_url("ftp://example.com").unwrap();
        assert_eq!(data.port, 21);
        assert!(data.remote_directory.is_none());
    }

    #[test]
    fn parses_ipv6_authority() {
        let data = SessionData::parse_url("scp://[::1]:2200").unwrap();
        assert_eq!(data.host, "::1");
        assert_eq!(data.port, 2200);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(SessionData::parse_url("gopher://example.com").is_err());
    }

    #[test]
    fn tunnel_configure_and_rollback_round_trip() {
        let mut data = SessionData::parse_url("sftp://user@real.example.com:22").unwrap();
        data.proxy.method = ProxyMethod::Socks5;
        data.configure_tunnel(50_001);
        assert_eq!(data.host, "127.0.0.1");
        assert_eq!(data.port, 50_001);
        assert_eq!(data.proxy.method, ProxyMethod::None);
        assert_eq!(data.orig_host_name(), "real.example.com");
        assert_eq!(data.orig_port_number(), 22);
        data.rollback_tunnel();
        assert_eq!(data.host, "real.example.com");
        assert_eq!(data.port, 22);
        assert_eq!(data.proxy.method, ProxyMethod::Socks5);
    }

    #[test]
    fn recrypt_touches_every_secret_slot() {
        let mut data = SessionData::default();
        data.password = Some(SealedSecret("aaa".into()));
        data.tunnel = Some(TunnelOptions {
            password: Some(SealedSecret("bbb".into())),
            ..TunnelOptions::default()
        });
        data.recrypt_passwords(&|old| format!("v2:{old}"));
        assert_eq!(data.password.as_ref().unwrap().0, "v2:aaa");
        assert_eq!(
            data.tunnel.as_ref().unwrap().password.as_ref().unwrap().0,
            "v2:bbb"
        );
    }
}
