//! Configuration management

use std::{env, fmt, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// OIDC client configuration
    pub oidc: OidcConfig,
    /// Backend components
    pub components: ComponentsConfig,
    /// Browser console assets
    pub console: ConsoleConfig,
    /// Interactive terminal bridge
    pub webtty: WebTtyConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // TKE_GATEWAY_OIDC__CLIENT_SECRET=... style overrides
        figment = figment.merge(Env::prefixed("TKE_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Check every invariant that must hold before the gateway starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        self.oidc.validate()?;
        for (kind, component) in self.components.enabled() {
            component.auth_mode(kind)?;
        }
        if let (Some(_), None) | (None, Some(_)) =
            (&self.server.tls_cert_file, &self.server.tls_key_file)
        {
            return Err(Error::Config(
                "server.tls_cert_file and server.tls_key_file must be set together".to_string(),
            ));
        }
        if self.webtty.buffer_size == 0 {
            return Err(Error::Config("webtty.buffer_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secret-bearing values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        self.oidc.client_secret = Self::expand_string(&re, &self.oidc.client_secret);
        self.oidc.client_id = Self::expand_string(&re, &self.oidc.client_id);
        self.oidc.issuer_url = Self::expand_string(&re, &self.oidc.issuer_url);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Time allowed until response headers are produced
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// PEM certificate for serving HTTPS
    pub tls_cert_file: Option<String>,
    /// PEM private key for serving HTTPS
    pub tls_key_file: Option<String>,
    /// Public origin of the gateway (e.g. `https://console.example.com`).
    /// When unset it is derived from each request's forwarding headers.
    pub external_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9441,
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            tls_cert_file: None,
            tls_key_file: None,
            external_url: None,
        }
    }
}

impl ServerConfig {
    /// Whether the listener terminates TLS itself
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_file.is_some() && self.tls_key_file.is_some()
    }
}

/// OIDC client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URL; discovery metadata is fetched from below it
    pub issuer_url: String,
    /// OAuth2 client id, also the expected ID token audience
    pub client_id: String,
    /// OAuth2 client secret (supports `${VAR}`)
    pub client_secret: String,
    /// CA bundle used to reach the IdP
    pub ca_file: Option<String>,
    /// Scopes requested in every grant
    pub scopes: Vec<String>,
    /// Claim carrying the user name
    pub username_claim: String,
    /// Prefix prepended to user names
    pub username_prefix: String,
    /// Claim carrying group memberships
    pub groups_claim: String,
    /// Prefix prepended to every group
    pub groups_prefix: String,
    /// Claim carrying the tenant id
    pub tenant_id_claim: String,
    /// Send browsers straight to the IdP instead of through `/oidc/`
    pub disable_oidc_proxy: bool,
    /// Fixed OAuth2 redirect URL; derived from the request when unset
    pub redirect_url: Option<String>,
    /// How long a fetched JWKS is trusted
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            ca_file: None,
            scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
                "groups".to_string(),
                "offline_access".to_string(),
            ],
            username_claim: "name".to_string(),
            username_prefix: String::new(),
            groups_claim: "groups".to_string(),
            groups_prefix: String::new(),
            tenant_id_claim: "federated_claims".to_string(),
            disable_oidc_proxy: false,
            redirect_url: None,
            jwks_cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl OidcConfig {
    fn validate(&self) -> Result<()> {
        if self.issuer_url.is_empty() {
            return Err(Error::Config("oidc.issuer_url is required".to_string()));
        }
        Url::parse(&self.issuer_url)
            .map_err(|e| Error::Config(format!("oidc.issuer_url is invalid: {e}")))?;
        if self.client_id.is_empty() {
            return Err(Error::Config("oidc.client_id is required".to_string()));
        }
        Ok(())
    }
}

/// Known backend components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    /// Cluster/platform API
    Platform,
    /// Business (project/namespace) API
    Business,
    /// Notification API
    Notify,
    /// Monitoring API
    Monitor,
    /// Image and chart registry
    Registry,
    /// Identity API and IdP
    Auth,
    /// Audit API
    Audit,
    /// Log collection API
    Logagent,
    /// Application API
    Application,
    /// Service mesh API
    Mesh,
}

impl ComponentKind {
    /// Every component, in registration order
    pub const ALL: [Self; 10] = [
        Self::Platform,
        Self::Business,
        Self::Notify,
        Self::Monitor,
        Self::Registry,
        Self::Auth,
        Self::Audit,
        Self::Logagent,
        Self::Application,
        Self::Mesh,
    ];

    /// Lowercase component name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Business => "business",
            Self::Notify => "notify",
            Self::Monitor => "monitor",
            Self::Registry => "registry",
            Self::Auth => "auth",
            Self::Audit => "audit",
            Self::Logagent => "logagent",
            Self::Application => "application",
            Self::Mesh => "mesh",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One optional entry per known component
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComponentsConfig {
    pub platform: Option<ComponentConfig>,
    pub business: Option<ComponentConfig>,
    pub notify: Option<ComponentConfig>,
    pub monitor: Option<ComponentConfig>,
    pub registry: Option<ComponentConfig>,
    pub auth: Option<ComponentConfig>,
    pub audit: Option<ComponentConfig>,
    pub logagent: Option<ComponentConfig>,
    pub application: Option<ComponentConfig>,
    pub mesh: Option<ComponentConfig>,
}

impl ComponentsConfig {
    /// Configuration for `kind`, if that component is enabled
    #[must_use]
    pub fn get(&self, kind: ComponentKind) -> Option<&ComponentConfig> {
        match kind {
            ComponentKind::Platform => self.platform.as_ref(),
            ComponentKind::Business => self.business.as_ref(),
            ComponentKind::Notify => self.notify.as_ref(),
            ComponentKind::Monitor => self.monitor.as_ref(),
            ComponentKind::Registry => self.registry.as_ref(),
            ComponentKind::Auth => self.auth.as_ref(),
            ComponentKind::Audit => self.audit.as_ref(),
            ComponentKind::Logagent => self.logagent.as_ref(),
            ComponentKind::Application => self.application.as_ref(),
            ComponentKind::Mesh => self.mesh.as_ref(),
        }
    }

    /// Enabled components only
    pub fn enabled(&self) -> impl Iterator<Item = (ComponentKind, &ComponentConfig)> {
        ComponentKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|c| (kind, c)))
    }
}

/// A backend component: where it lives and how requests are authenticated
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComponentConfig {
    /// Base URL, e.g. `https://tke-platform-api:9443`
    pub address: String,
    /// Forward the caller's bearer token over one-way TLS
    pub passthrough: Option<PassthroughConfig>,
    /// Translate the session into identity headers over mutual TLS
    pub front_proxy: Option<FrontProxyConfig>,
}

/// Validated authentication treatment of a component
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// Identity headers over mutual TLS
    FrontProxy(FrontProxyConfig),
    /// Bearer token over one-way TLS
    Passthrough(PassthroughConfig),
}

impl AuthMode {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FrontProxy(_) => "front-proxy",
            Self::Passthrough(_) => "passthrough",
        }
    }
}

impl ComponentConfig {
    /// Parsed component address
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is empty, not absolute or
    /// not http(s).
    pub fn address_url(&self, kind: ComponentKind) -> Result<Url> {
        if self.address.is_empty() {
            return Err(Error::Config(format!(
                "components.{kind}.address is required"
            )));
        }
        let url = Url::parse(&self.address)
            .map_err(|e| Error::Config(format!("components.{kind}.address is invalid: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "components.{kind}.address must be http or https, got {}",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// Resolve exactly one of `front_proxy` / `passthrough`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when both or neither are set, when the
    /// address is invalid, or when the front-proxy certificate trio is
    /// incomplete.
    pub fn auth_mode(&self, kind: ComponentKind) -> Result<AuthMode> {
        self.address_url(kind)?;
        match (&self.front_proxy, &self.passthrough) {
            (Some(front_proxy), None) => {
                front_proxy.validate(kind)?;
                Ok(AuthMode::FrontProxy(front_proxy.clone()))
            }
            (None, Some(passthrough)) => Ok(AuthMode::Passthrough(passthrough.clone())),
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "components.{kind}: front_proxy and passthrough are mutually exclusive"
            ))),
            (None, None) => Err(Error::Config(format!(
                "components.{kind}: one of front_proxy or passthrough must be set"
            ))),
        }
    }
}

/// One-way TLS settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PassthroughConfig {
    /// CA bundle that signed the component's serving certificate;
    /// the platform roots are used when unset
    pub ca_file: Option<String>,
}

/// Mutual TLS settings plus the identity header names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontProxyConfig {
    /// CA bundle that signed the component's serving certificate
    pub ca_file: String,
    /// Client certificate presented to the component
    pub client_cert_file: String,
    /// Key for `client_cert_file`
    pub client_key_file: String,
    /// Header carrying the user name
    pub username_header: String,
    /// Header carrying groups (one value per group)
    pub groups_header: String,
    /// Prefix of one header per extra attribute
    pub extra_prefix_header: String,
}

impl Default for FrontProxyConfig {
    fn default() -> Self {
        Self {
            ca_file: String::new(),
            client_cert_file: String::new(),
            client_key_file: String::new(),
            username_header: "X-Remote-User".to_string(),
            groups_header: "X-Remote-Group".to_string(),
            extra_prefix_header: "X-Remote-Extra-".to_string(),
        }
    }
}

impl FrontProxyConfig {
    fn validate(&self, kind: ComponentKind) -> Result<()> {
        for (field, value) in [
            ("ca_file", &self.ca_file),
            ("client_cert_file", &self.client_cert_file),
            ("client_key_file", &self.client_key_file),
            ("username_header", &self.username_header),
            ("groups_header", &self.groups_header),
            ("extra_prefix_header", &self.extra_prefix_header),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!(
                    "components.{kind}.front_proxy.{field} is required"
                )));
            }
        }
        Ok(())
    }
}

/// Browser console assets
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Directory holding the built console; no console is served when unset
    pub assets_dir: Option<String>,
}

/// Interactive terminal bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebTtyConfig {
    /// Capacity of the stdin, stdout and resize queues of one session
    pub buffer_size: usize,
    /// Command run when the request names none
    pub default_command: String,
}

impl Default for WebTtyConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            default_command: "/bin/sh".to_string(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn passthrough(address: &str) -> ComponentConfig {
        ComponentConfig {
            address: address.to_string(),
            passthrough: Some(PassthroughConfig::default()),
            front_proxy: None,
        }
    }

    fn front_proxy() -> FrontProxyConfig {
        FrontProxyConfig {
            ca_file: "/etc/tke/ca.crt".to_string(),
            client_cert_file: "/etc/tke/admin.crt".to_string(),
            client_key_file: "/etc/tke/admin.key".to_string(),
            ..FrontProxyConfig::default()
        }
    }

    #[test]
    fn both_modes_set_is_rejected() {
        let component = ComponentConfig {
            address: "https://platform:9443".to_string(),
            passthrough: Some(PassthroughConfig::default()),
            front_proxy: Some(front_proxy()),
        };
        let err = component.auth_mode(ComponentKind::Platform).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn neither_mode_set_is_rejected() {
        let component = ComponentConfig {
            address: "https://platform:9443".to_string(),
            ..ComponentConfig::default()
        };
        let err = component.auth_mode(ComponentKind::Platform).unwrap_err();
        assert!(err.to_string().contains("must be set"));
    }

    #[test]
    fn incomplete_front_proxy_trio_is_rejected() {
        let component = ComponentConfig {
            address: "https://business:9447".to_string(),
            passthrough: None,
            front_proxy: Some(FrontProxyConfig {
                client_key_file: String::new(),
                ..front_proxy()
            }),
        };
        let err = component.auth_mode(ComponentKind::Business).unwrap_err();
        assert!(err.to_string().contains("client_key_file"));
    }

    #[test]
    fn missing_address_is_rejected() {
        let component = passthrough("");
        assert!(component.auth_mode(ComponentKind::Notify).is_err());
        let component = passthrough("ftp://notify");
        assert!(component.auth_mode(ComponentKind::Notify).is_err());
    }

    #[test]
    fn single_mode_resolves() {
        let mode = passthrough("https://platform:9443")
            .auth_mode(ComponentKind::Platform)
            .unwrap();
        assert_eq!(mode.name(), "passthrough");

        let component = ComponentConfig {
            address: "https://business:9447".to_string(),
            passthrough: None,
            front_proxy: Some(front_proxy()),
        };
        let mode = component.auth_mode(ComponentKind::Business).unwrap();
        assert_eq!(mode.name(), "front-proxy");
    }

    #[test]
    fn validate_requires_oidc_issuer_and_client() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.oidc.issuer_url = "https://idp.example.com/oidc".to_string();
        assert!(config.validate().is_err());
        config.oidc.client_id = "default".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_half_configured_listener_tls() {
        let mut config = Config::default();
        config.oidc.issuer_url = "https://idp.example.com/oidc".to_string();
        config.oidc.client_id = "default".to_string();
        config.server.tls_cert_file = Some("/etc/tke/server.crt".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_components_follow_registration_order() {
        let components = ComponentsConfig {
            audit: Some(passthrough("https://audit:9491")),
            platform: Some(passthrough("https://platform:9443")),
            ..ComponentsConfig::default()
        };
        let kinds: Vec<_> = components.enabled().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![ComponentKind::Platform, ComponentKind::Audit]);
    }

    #[test]
    fn components_deserialize_from_yaml() {
        let yaml = r#"
oidc:
  issuer_url: "https://tke-auth-api/oidc"
  client_id: default
  disable_oidc_proxy: true
components:
  platform:
    address: "https://tke-platform-api:9443"
    passthrough:
      ca_file: /app/certs/ca.crt
  business:
    address: "https://tke-business-api:9447"
    front_proxy:
      ca_file: /app/certs/ca.crt
      client_cert_file: /app/certs/admin.crt
      client_key_file: /app/certs/admin.key
webtty:
  buffer_size: 64
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.oidc.disable_oidc_proxy);
        assert_eq!(config.oidc.username_claim, "name");
        let business = config.components.business.as_ref().unwrap();
        let fp = business.front_proxy.as_ref().unwrap();
        assert_eq!(fp.username_header, "X-Remote-User");
        assert_eq!(config.webtty.buffer_size, 64);
        assert_eq!(config.webtty.default_command, "/bin/sh");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn durations_accept_units() {
        let yaml = "request_timeout: 250ms\nshutdown_timeout: 2m\n";
        let server: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(server.request_timeout, Duration::from_millis(250));
        assert_eq!(server.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn client_secret_expands_env_default() {
        let mut config = Config::default();
        config.oidc.client_secret = "${TKE_GW_TEST_UNSET_SECRET:-fallback}".to_string();
        config.expand_env_vars();
        assert_eq!(config.oidc.client_secret, "fallback");
    }

    #[test]
    fn load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "TKE_GW_TEST_ENV_FILE_KEY=from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("TKE_GW_TEST_ENV_FILE_KEY").unwrap(), "from_env_file");
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/gateway.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
