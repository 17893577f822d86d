//! Configuration management
//!
//! A client is configured from one of three sources:
//! - a TOML file
//! - inline options, `key=value` pairs separated by semicolons
//! - the shadowsocks plugin environment (`SS_LOCAL_HOST`, `SS_LOCAL_PORT`,
//!   `SS_REMOTE_HOST`, `SS_REMOTE_PORT`, `SS_PLUGIN_OPTIONS`)
//!
//! Keys are snake_case; the CamelCase spellings used by existing client
//! configs (`ServerName`, `NumConn`, ...) are accepted as aliases.

use crate::bootstrap::{BootstrapConfig, RetryPolicy};
use crate::crypto::PublicKey;
use crate::handshake::{HandshakeParams, PROXY_METHOD_LEN, UID_LEN};
use crate::obfuscation::MAX_SERVER_NAME_LEN;
use crate::transport::format_addr;
use crate::tunnel::EncryptionMethod;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Proxy method announced when running as a shadowsocks plugin
pub const PLUGIN_PROXY_METHOD: &str = "shadowsocks";

/// Keys whose inline values are integers
const NUMERIC_KEYS: &[&str] = &[
    "localport",
    "remoteport",
    "numconn",
    "retryinitialsecs",
    "retrymaxsecs",
    "retrymultiplier",
    "connecttimeoutsecs",
];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Failed to write config: {0}")]
    Write(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address local proxy clients connect to
    #[serde(alias = "LocalHost")]
    pub local_host: String,
    #[serde(alias = "LocalPort")]
    pub local_port: u16,
    /// Relay host; required
    #[serde(alias = "RemoteHost")]
    pub remote_host: String,
    #[serde(alias = "RemotePort")]
    pub remote_port: u16,
    /// Connections per session
    #[serde(alias = "NumConn")]
    pub num_conn: usize,
    #[serde(alias = "EncryptionMethod")]
    pub encryption_method: EncryptionMethod,
    /// User id (base64, 16 bytes)
    #[serde(alias = "UID")]
    pub uid: String,
    /// Relay's static public key (base64, 32 bytes)
    #[serde(alias = "PublicKey")]
    pub public_key: String,
    /// Host name placed in the SNI
    #[serde(alias = "ServerName")]
    pub server_name: String,
    /// Upstream proxy the relay hands streams to
    #[serde(alias = "ProxyMethod")]
    pub proxy_method: String,
    /// Browser whose handshake is reproduced; only "firefox"
    #[serde(alias = "BrowserSig")]
    pub browser_sig: String,
    #[serde(alias = "RetryInitialSecs")]
    pub retry_initial_secs: u64,
    #[serde(alias = "RetryMaxSecs")]
    pub retry_max_secs: u64,
    #[serde(alias = "RetryMultiplier")]
    pub retry_multiplier: u32,
    #[serde(alias = "ConnectTimeoutSecs")]
    pub connect_timeout_secs: u64,
    /// Time source for handshake timestamps
    #[serde(skip, default = "default_clock")]
    pub clock: fn() -> SystemTime,
}

fn default_clock() -> fn() -> SystemTime {
    SystemTime::now
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            local_port: 1984,
            remote_host: String::new(),
            remote_port: 443,
            num_conn: 4,
            encryption_method: EncryptionMethod::default(),
            uid: String::new(),
            public_key: String::new(),
            server_name: "www.bing.com".to_string(),
            proxy_method: PLUGIN_PROXY_METHOD.to_string(),
            browser_sig: "firefox".to_string(),
            retry_initial_secs: 3,
            retry_max_secs: 30,
            retry_multiplier: 2,
            connect_timeout_secs: 10,
            clock: default_clock(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Write(e.to_string()))
    }

    /// Parse `key=value;key=value` options
    ///
    /// Only the first `=` of a pair separates key from value, so base64
    /// padding survives.
    pub fn from_inline(options: &str) -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();

        for pair in options.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Parse(format!("expected key=value, got {:?}", pair)))?;
            let key = key.trim();
            let value = value.trim();

            let value = if NUMERIC_KEYS.contains(&normalize_key(key).as_str()) {
                value.parse::<i64>().map(toml::Value::Integer).map_err(|_| {
                    ConfigError::Parse(format!("{} must be an integer, got {:?}", key, value))
                })?
            } else {
                toml::Value::String(value.to_string())
            };
            table.insert(key.to_string(), value);
        }

        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    /// Interpret a `-c` argument: an existing file, else inline options
    pub fn from_arg(arg: &str) -> Result<Self, ConfigError> {
        if Path::new(arg).is_file() {
            Self::load(arg)
        } else if arg.contains('=') {
            Self::from_inline(arg)
        } else {
            Err(ConfigError::Read(format!("{}: no such file", arg)))
        }
    }

    /// Take endpoints from the plugin environment and announce shadowsocks
    pub fn apply_plugin_env(&mut self, env: &PluginEnv) {
        self.local_host = env.local_host.clone();
        self.local_port = env.local_port;
        self.remote_host = env.remote_host.clone();
        self.remote_port = env.remote_port;
        self.proxy_method = PLUGIN_PROXY_METHOD.to_string();
    }

    /// Check every setting the client needs before it listens
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with_admin(false)
    }

    /// Like [`ClientConfig::validate`]; an admin client brings its own uid,
    /// so the configured one may be absent
    pub fn validate_with_admin(&self, admin: bool) -> Result<(), ConfigError> {
        if self.remote_host.is_empty() {
            return Err(ConfigError::Missing("remote_host"));
        }
        if self.local_port == 0 {
            return Err(ConfigError::Missing("local_port"));
        }
        if self.num_conn == 0 {
            return Err(invalid("num_conn", "must be at least 1"));
        }
        if !self.browser_sig.eq_ignore_ascii_case("firefox") {
            return Err(invalid(
                "browser_sig",
                format!("unsupported browser {:?}", self.browser_sig),
            ));
        }
        if self.server_name.is_empty() || self.server_name.len() > MAX_SERVER_NAME_LEN {
            return Err(invalid(
                "server_name",
                format!("must be 1 to {} bytes", MAX_SERVER_NAME_LEN),
            ));
        }
        if self.retry_initial_secs == 0 {
            return Err(invalid("retry_initial_secs", "must be at least 1"));
        }
        if self.retry_max_secs < self.retry_initial_secs {
            return Err(invalid(
                "retry_max_secs",
                format!("must be at least retry_initial_secs ({})", self.retry_initial_secs),
            ));
        }
        if self.retry_multiplier == 0 {
            return Err(invalid("retry_multiplier", "must be at least 1"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect_timeout_secs", "must be at least 1"));
        }
        if self.proxy_method.len() > PROXY_METHOD_LEN {
            return Err(invalid(
                "proxy_method",
                format!("must be at most {} bytes", PROXY_METHOD_LEN),
            ));
        }
        if !admin {
            self.uid_bytes()?;
        }
        self.server_public_key()?;
        Ok(())
    }

    /// Decoded user id
    pub fn uid_bytes(&self) -> Result<[u8; UID_LEN], ConfigError> {
        if self.uid.is_empty() {
            return Err(ConfigError::Missing("uid"));
        }
        decode_uid(&self.uid)
    }

    /// Decoded relay public key
    pub fn server_public_key(&self) -> Result<PublicKey, ConfigError> {
        if self.public_key.is_empty() {
            return Err(ConfigError::Missing("public_key"));
        }
        PublicKey::from_base64(&self.public_key).map_err(|e| invalid("public_key", e.to_string()))
    }

    pub fn local_addr(&self) -> String {
        format_addr(&self.local_host, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format_addr(&self.remote_host, self.remote_port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_secs(self.retry_initial_secs),
            max: Duration::from_secs(self.retry_max_secs),
            multiplier: self.retry_multiplier,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Handshake inputs; `admin_uid` replaces the configured user id
    pub fn handshake_params(
        &self,
        admin_uid: Option<[u8; UID_LEN]>,
    ) -> Result<HandshakeParams, ConfigError> {
        let uid = match admin_uid {
            Some(uid) => uid,
            None => self.uid_bytes()?,
        };
        Ok(HandshakeParams {
            uid,
            server_public_key: self.server_public_key()?,
            server_name: self.server_name.clone(),
            proxy_method: self.proxy_method.clone(),
            encryption_method: self.encryption_method,
            clock: self.clock,
        })
    }

    pub fn bootstrap_config(&self, admin: bool) -> BootstrapConfig {
        BootstrapConfig {
            remote_addr: self.remote_addr(),
            num_conn: self.num_conn,
            admin,
            encryption_method: self.encryption_method,
            retry: self.retry_policy(),
        }
    }
}

/// Decode a base64 user id
pub fn decode_uid(encoded: &str) -> Result<[u8; UID_LEN], ConfigError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| invalid("uid", e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| invalid("uid", format!("expected {} bytes, got {}", UID_LEN, bytes.len())))
}

/// Endpoints and options handed over by a shadowsocks client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnv {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub options: String,
}

impl PluginEnv {
    /// Read the plugin environment; `None` unless `SS_LOCAL_HOST` is set
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let local_host = match lookup("SS_LOCAL_HOST") {
            Some(host) if !host.is_empty() => host,
            _ => return Ok(None),
        };

        let port = |key: &'static str| -> Result<u16, ConfigError> {
            let value = lookup(key).ok_or(ConfigError::Missing(key))?;
            value
                .trim()
                .parse()
                .map_err(|_| invalid(key, format!("not a port: {:?}", value)))
        };

        Ok(Some(Self {
            local_host,
            local_port: port("SS_LOCAL_PORT")?,
            remote_host: lookup("SS_REMOTE_HOST").ok_or(ConfigError::Missing("SS_REMOTE_HOST"))?,
            remote_port: port("SS_REMOTE_PORT")?,
            options: lookup("SS_PLUGIN_OPTIONS").unwrap_or_default(),
        }))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
