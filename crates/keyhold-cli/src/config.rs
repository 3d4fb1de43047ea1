//! `keyhold.toml` loading and environment overrides.
//!
//! Order of precedence, lowest first: built-in defaults, the TOML file,
//! `.env` (via `dotenvy`), then process environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use keyhold_auth::FlowVariant;
use keyhold_endpoint::{EndpointOptions, TlsOptions};
use keyhold_session::BrokerOptions;
use keyhold_transport::{AuthMode, ClientConfig, CredentialSource, ReconnectPolicy};
use keyhold_vault::HostCapabilities;
use serde::Deserialize;
use zeroize::Zeroizing;

/// Default configuration file, read only when present.
pub const DEFAULT_CONFIG_FILE: &str = "keyhold.toml";

const DEFAULT_AUTH_URL: &str = "https://auth.keyhold.dev";
const DEFAULT_RESOURCE_URL: &str = "https://api.keyhold.dev";
const DEFAULT_KEYCHAIN_SERVICE: &str = "keyhold";

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct KeyholdConfig {
    pub mode: Option<AuthMode>,
    pub auth_url: Option<String>,
    pub resource_url: Option<String>,
    pub channel_url: Option<String>,
    pub client_id: Option<String>,
    /// Prefer `KEYHOLD_API_KEY` over writing the key into the file.
    pub api_key: Option<String>,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
    pub allow_insecure_http: bool,
    pub allowed_hosts: Vec<String>,
    pub request_timeout_secs: Option<u64>,
    pub reconnect: Option<ReconnectPolicy>,
    pub storage: StorageSection,
    pub tls: TlsSection,
    pub session: SessionSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    /// Keychain service name. An empty string disables the keychain.
    pub keychain_service: Option<String>,
    /// Directory for the encrypted file backend.
    pub data_dir: Option<PathBuf>,
    /// Plaintext credentials file written by older clients.
    pub legacy_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    pub ca_file: Option<PathBuf>,
    pub pins: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub require_approval: bool,
    pub ttl_secs: Option<u64>,
    pub approval_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

impl std::fmt::Debug for KeyholdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyholdConfig")
            .field("mode", &self.mode)
            .field("auth_url", &self.auth_url)
            .field("resource_url", &self.resource_url)
            .field("client_id", &self.client_id)
            .field("has_api_key", &self.api_key.is_some())
            .field("allow_insecure_http", &self.allow_insecure_http)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl KeyholdConfig {
    /// Load `path` (or `./keyhold.toml` when present), then apply `.env` and
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        tracing::debug!(config = ?config, "configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `KEYHOLD_*` variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("KEYHOLD_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(id) = get("KEYHOLD_CLIENT_ID") {
            self.client_id = Some(id);
        }
        if let Some(url) = get("KEYHOLD_AUTH_URL") {
            self.auth_url = Some(url);
        }
        if let Some(url) = get("KEYHOLD_RESOURCE_URL") {
            self.resource_url = Some(url);
        }
        if let Some(mode) = get("KEYHOLD_MODE") {
            self.mode = Some(parse_mode(&mode)?);
        }
        if let Some(flag) = get("KEYHOLD_ALLOW_INSECURE_HTTP") {
            self.allow_insecure_http = parse_flag(&flag)
                .with_context(|| format!("KEYHOLD_ALLOW_INSECURE_HTTP: `{flag}` is not a boolean"))?;
        }
        Ok(())
    }

    pub fn auth_url(&self) -> &str {
        self.auth_url.as_deref().unwrap_or(DEFAULT_AUTH_URL)
    }

    pub fn resource_url(&self) -> &str {
        self.resource_url.as_deref().unwrap_or(DEFAULT_RESOURCE_URL)
    }

    pub fn credential_source(&self) -> CredentialSource {
        CredentialSource {
            mode: self.mode,
            api_key: self.api_key.clone().map(Zeroizing::new),
            client_id: self.client_id.clone(),
            auth_base_url: Some(self.auth_url().to_string()),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.credential_source().effective_mode()
    }

    pub fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            allow_insecure_http: self.allow_insecure_http,
            allowed_hosts: self.allowed_hosts.clone(),
        }
    }

    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            ca_file: self.tls.ca_file.clone(),
            ca: None,
            pins: self.tls.pins.clone(),
        }
    }

    /// Build the transport configuration for the effective mode.
    pub fn client_config(&self, variant: FlowVariant) -> Result<ClientConfig> {
        let credential = self
            .credential_source()
            .resolve()
            .context("incomplete credential configuration")?;
        let mut config = ClientConfig::new(credential, self.resource_url());
        config.channel_url = self.channel_url.clone();
        config.endpoint_options = self.endpoint_options();
        config.tls = self.tls_options();
        config.flow_variant = variant;
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(reconnect) = self.reconnect {
            config.reconnect = reconnect;
        }
        Ok(config)
    }

    /// Keychain first, then encrypted files under the data directory.
    pub fn host_capabilities(&self) -> HostCapabilities {
        let keychain_service = match &self.storage.keychain_service {
            Some(name) if name.is_empty() => None,
            Some(name) => Some(name.clone()),
            None => Some(DEFAULT_KEYCHAIN_SERVICE.to_string()),
        };
        HostCapabilities {
            keychain_service,
            data_dir: Some(self.data_dir()),
            ..Default::default()
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
    }

    pub fn legacy_file(&self) -> PathBuf {
        self.storage
            .legacy_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("credentials.json"))
    }

    pub fn broker_options(&self, approval: bool, reason: Option<String>) -> BrokerOptions {
        let defaults = BrokerOptions::default();
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };
        BrokerOptions {
            require_approval: approval || self.session.require_approval,
            ttl: secs(self.session.ttl_secs, defaults.ttl),
            reason,
            approval_timeout: secs(self.session.approval_timeout_secs, defaults.approval_timeout),
            poll_interval: secs(self.session.poll_interval_secs, defaults.poll_interval),
        }
    }
}

fn parse_mode(raw: &str) -> Result<AuthMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "oauth" => Ok(AuthMode::OAuth),
        "api-key" | "api_key" | "apikey" | "key" => Ok(AuthMode::ApiKey),
        other => bail!("KEYHOLD_MODE: unknown mode `{other}` (expected `oauth` or `api-key`)"),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Platform data directory: `~/.local/share/keyhold` on Linux,
/// `~/Library/Application Support/keyhold` on macOS, `%APPDATA%\keyhold` on
/// Windows. `~/.keyhold` when the platform has none.
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("keyhold"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".keyhold")))
        .unwrap_or_else(|| PathBuf::from(".keyhold"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn data_dir_defaults_to_platform_location() {
        let config = KeyholdConfig::default();
        let dir = config.data_dir();
        assert!(dir.ends_with("keyhold") || dir.ends_with(".keyhold"));
        if let Some(platform) = dirs::data_dir() {
            assert_eq!(dir, platform.join("keyhold"));
        }
        assert_eq!(config.legacy_file(), dir.join("credentials.json"));
    }

    #[test]
    fn parses_a_full_file() {
        let config = KeyholdConfig::parse(
            r#"
            mode = "oauth"
            auth_url = "https://auth.example.com"
            resource_url = "https://api.example.com"
            client_id = "cli"
            scopes = ["secrets:read"]

            [storage]
            keychain_service = ""
            data_dir = "/tmp/keyhold"

            [tls]
            pins = ["sha256/tRUkwp4Hskh0ISxKDNu8nlToo+AL8BMHD2n5rrizcOA="]

            [session]
            require_approval = true
            ttl_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Some(AuthMode::OAuth));
        assert_eq!(config.resource_url(), "https://api.example.com");
        assert_eq!(config.tls_options().pins.len(), 1);
        assert!(config.host_capabilities().keychain_service.is_none());
        assert_eq!(config.legacy_file(), PathBuf::from("/tmp/keyhold/credentials.json"));

        let options = config.broker_options(false, None);
        assert!(options.require_approval);
        assert_eq!(options.ttl, Duration::from_secs(60));
        assert_eq!(options.approval_timeout, Duration::from_secs(300));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(KeyholdConfig::parse("resource = \"https://x\"").is_err());
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = KeyholdConfig::parse("client_id = \"from-file\"").unwrap();
        config
            .apply_env(env(&[
                ("KEYHOLD_API_KEY", "kh_live_abc"),
                ("KEYHOLD_RESOURCE_URL", "http://127.0.0.1:8080"),
                ("KEYHOLD_ALLOW_INSECURE_HTTP", "true"),
                ("KEYHOLD_CLIENT_ID", ""),
            ]))
            .unwrap();

        assert_eq!(config.client_id.as_deref(), Some("from-file"));
        assert_eq!(config.mode(), AuthMode::ApiKey);
        assert!(config.endpoint_options().allow_insecure_http);
        assert!(!format!("{config:?}").contains("kh_live_abc"));

        let client = config.client_config(FlowVariant::Device).unwrap();
        assert_eq!(client.mode(), AuthMode::ApiKey);
        assert_eq!(client.resource_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn explicit_mode_wins_over_api_key() {
        let mut config = KeyholdConfig::default();
        config
            .apply_env(env(&[("KEYHOLD_API_KEY", "kh_live_abc"), ("KEYHOLD_MODE", "oauth")]))
            .unwrap();
        assert_eq!(config.mode(), AuthMode::OAuth);
        // OAuth without a client id cannot be resolved.
        assert!(config.client_config(FlowVariant::Device).is_err());
    }

    #[test]
    fn bad_env_values_are_errors() {
        let mut config = KeyholdConfig::default();
        assert!(config.apply_env(env(&[("KEYHOLD_MODE", "magic")])).is_err());
        assert!(
            config
                .apply_env(env(&[("KEYHOLD_ALLOW_INSECURE_HTTP", "maybe")]))
                .is_err()
        );
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "resource_url = \"https://api.example.com\"").unwrap();
        let config = KeyholdConfig::from_file(file.path()).unwrap();
        assert_eq!(config.resource_url(), "https://api.example.com");

        assert!(KeyholdConfig::from_file(Path::new("/nonexistent/keyhold.toml")).is_err());
    }
}
