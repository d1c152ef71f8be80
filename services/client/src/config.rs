//! Client configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides
//! (environment variables feed the handshake, not the config).
//! Default config path: `/etc/remora/client.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `provider.hostname`
//! - `registry.hostname` when `auth.method = "token"`
//! - `auth.cert_path` and `auth.key_path` when `auth.method = "certificate"`

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub schema_version: u32,
    /// Prefix of environment variables forwarded in the handshake.
    pub env_prefix: String,
    pub provider: ProviderConfig,
    pub registry: RegistryConfig,
    pub auth: AuthConfig,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub hostname: String,
    pub port: u16,
    pub ws_path: String,
}

impl ProviderConfig {
    pub fn ws_url(&self) -> String {
        format!("wss://{}:{}{}", self.hostname, self.port, self.ws_path)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub hostname: String,
    pub port: u16,
}

impl RegistryConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    Certificate,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub method: AuthMethod,
    /// One-time OpenID authorization code for the first token exchange.
    pub authorization_code: Option<String>,
    /// Refresh this long before the access token expires.
    pub refresh_margin: Duration,
    /// Grant certificate confirmation without an interactive prompt.
    pub confirm_certificate: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub handshake_retry: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub attr_expiry: Duration,
    pub location_renew_window: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    env_prefix: Option<String>,
    provider: Option<RawProviderConfig>,
    registry: Option<RawRegistryConfig>,
    auth: Option<RawAuthConfig>,
    pool: Option<RawPoolSettings>,
    cache: Option<RawCacheSettings>,
}

#[derive(Debug, Deserialize)]
struct RawProviderConfig {
    hostname: Option<String>,
    port: Option<u16>,
    ws_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRegistryConfig {
    hostname: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    method: Option<String>,
    authorization_code: Option<String>,
    refresh_margin_secs: Option<u64>,
    confirm_certificate: Option<bool>,
    cert_path: Option<String>,
    key_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPoolSettings {
    size: Option<usize>,
    handshake_retry_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCacheSettings {
    attr_expiry_secs: Option<u64>,
    location_renew_window_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/remora/client.toml`.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/remora/client.toml"))
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let raw_provider = raw
        .provider
        .ok_or_else(|| ConfigError::MissingField("provider".to_owned()))?;
    let provider = ProviderConfig {
        hostname: raw_provider
            .hostname
            .ok_or_else(|| ConfigError::MissingField("provider.hostname".to_owned()))?,
        port: raw_provider.port.unwrap_or(443),
        ws_path: raw_provider
            .ws_path
            .unwrap_or_else(|| "/client/protocol".to_owned()),
    };

    let raw_auth = raw.auth.unwrap_or(RawAuthConfig {
        method: None,
        authorization_code: None,
        refresh_margin_secs: None,
        confirm_certificate: None,
        cert_path: None,
        key_path: None,
    });
    let method = match raw_auth.method.as_deref().unwrap_or("token") {
        "token" => AuthMethod::Token,
        "certificate" => AuthMethod::Certificate,
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "auth.method must be 'token' or 'certificate', got '{}'",
                other
            )));
        }
    };
    if method == AuthMethod::Certificate
        && (raw_auth.cert_path.is_none() || raw_auth.key_path.is_none())
    {
        return Err(ConfigError::MissingField(
            "auth.cert_path and auth.key_path".to_owned(),
        ));
    }
    let auth = AuthConfig {
        method,
        authorization_code: raw_auth.authorization_code,
        refresh_margin: Duration::from_secs(raw_auth.refresh_margin_secs.unwrap_or(60)),
        confirm_certificate: raw_auth.confirm_certificate.unwrap_or(false),
        cert_path: raw_auth.cert_path,
        key_path: raw_auth.key_path,
    };

    // The registry only matters for token sessions, but a hostname is
    // required there.
    let registry = match raw.registry {
        Some(r) => RegistryConfig {
            hostname: match r.hostname {
                Some(hostname) => hostname,
                None if method == AuthMethod::Token => {
                    return Err(ConfigError::MissingField("registry.hostname".to_owned()));
                }
                None => String::new(),
            },
            port: r.port.unwrap_or(8443),
        },
        None if method == AuthMethod::Token => {
            return Err(ConfigError::MissingField("registry".to_owned()));
        }
        None => RegistryConfig {
            hostname: String::new(),
            port: 8443,
        },
    };

    let pool = match raw.pool {
        Some(p) => PoolSettings {
            size: p.size.unwrap_or(2).max(1),
            handshake_retry: Duration::from_secs(p.handshake_retry_secs.unwrap_or(3)),
        },
        None => PoolSettings {
            size: 2,
            handshake_retry: Duration::from_secs(3),
        },
    };

    let cache = match raw.cache {
        Some(c) => CacheSettings {
            attr_expiry: Duration::from_secs(c.attr_expiry_secs.unwrap_or(20)),
            location_renew_window: Duration::from_secs(
                c.location_renew_window_secs.unwrap_or(30),
            ),
        },
        None => CacheSettings {
            attr_expiry: Duration::from_secs(20),
            location_renew_window: Duration::from_secs(30),
        },
    };

    Ok(ClientConfig {
        schema_version,
        env_prefix: raw.env_prefix.unwrap_or_else(|| "REMORA_".to_owned()),
        provider,
        registry,
        auth,
        pool,
        cache,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
schema_version = 1

[provider]
hostname = "provider.example.com"

[registry]
hostname = "registry.example.com"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.provider.port, 443);
        assert_eq!(
            cfg.provider.ws_url(),
            "wss://provider.example.com:443/client/protocol"
        );
        assert_eq!(cfg.registry.base_url(), "https://registry.example.com:8443");
        assert_eq!(cfg.auth.method, AuthMethod::Token);
        assert_eq!(cfg.auth.refresh_margin, Duration::from_secs(60));
        assert_eq!(cfg.pool.size, 2);
        assert_eq!(cfg.pool.handshake_retry, Duration::from_secs(3));
        assert_eq!(cfg.cache.attr_expiry, Duration::from_secs(20));
        assert_eq!(cfg.env_prefix, "REMORA_");
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let err = load_config_from_str("[provider]\nhostname = \"p\"").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "schema_version"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = load_config_from_str("schema_version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn token_method_requires_registry() {
        let err = load_config_from_str(
            "schema_version = 1\n[provider]\nhostname = \"p\"",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "registry"));
    }

    #[test]
    fn certificate_method_requires_identity_paths() {
        let toml = r#"
schema_version = 1
[provider]
hostname = "p"
[auth]
method = "certificate"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));

        let toml = r#"
schema_version = 1
[provider]
hostname = "p"
[auth]
method = "certificate"
cert_path = "/id/cert.pem"
key_path = "/id/key.pem"
"#;
        let cfg = load_config_from_str(toml).unwrap();
        assert_eq!(cfg.auth.method, AuthMethod::Certificate);
    }

    #[test]
    fn unknown_auth_method_is_rejected() {
        let toml = "schema_version = 1\n[provider]\nhostname = \"p\"\n[auth]\nmethod = \"kerberos\"";
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
