use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::caddy_client::RetryPolicy;
use crate::health::HealthPolicy;
use crate::ports::PortRange;

#[derive(Debug, Deserialize)]
pub struct DeploymentConfig {
    pub app: AppConfig,
    #[serde(default)]
    pub caddy: CaddyConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub container_port: u16,
    // Docker network the instance joins, if any
    #[serde(default)]
    pub network: Option<String>,
    // KEY=VALUE pairs passed to the container
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub port_range: PortRange,
}

impl AppConfig {
    /// Credentials for pulling the image, if both halves are configured.
    pub fn registry_credentials(&self) -> Option<&RegistryConfig> {
        self.registry
            .as_ref()
            .filter(|r| !r.username.is_empty() && !r.password.expose_secret().is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct CaddyConfig {
    #[serde(default = "default_admin_api")]
    pub admin_api: String,
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default)]
    pub rules: Vec<ProxyRule>,
    #[serde(default = "default_push_timeout")]
    pub push_timeout_seconds: u64,
    #[serde(default = "default_push_attempts")]
    pub push_attempts: u32,
    #[serde(default = "default_push_backoff")]
    pub push_backoff_millis: u64,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            admin_api: default_admin_api(),
            listen: default_listen(),
            rules: Vec::new(),
            push_timeout_seconds: default_push_timeout(),
            push_attempts: default_push_attempts(),
            push_backoff_millis: default_push_backoff(),
        }
    }
}

impl CaddyConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.push_attempts,
            initial_backoff: Duration::from_millis(self.push_backoff_millis),
        }
    }
}

/// A site block: host match plus ordered backend targets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyRule {
    #[serde(rename = "match")]
    pub match_expr: String,
    #[serde(default)]
    pub tls: Option<String>,
    #[serde(default)]
    pub reverse_proxy: Vec<ReverseProxyTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReverseProxyTarget {
    #[serde(default)]
    pub path: String,
    /// Upstream address; may contain the `{port}` placeholder.
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_retries")]
    pub max_retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: default_health_endpoint(),
            host: default_health_host(),
            timeout_seconds: default_health_timeout(),
            interval_seconds: default_health_interval(),
            max_retries: default_health_retries(),
        }
    }
}

impl HealthCheckConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            endpoint: self.endpoint.clone(),
            timeout_per_attempt: Duration::from_secs(self.timeout_seconds),
            interval: Duration::from_secs(self.interval_seconds),
            max_retries: self.max_retries,
        }
    }

    /// Base URL of an instance bound to `port`.
    pub fn target(&self, port: u16) -> String {
        format!("http://{}:{}", self.host, port)
    }
}

fn default_admin_api() -> String {
    "http://localhost:2019".to_string()
}

fn default_listen() -> Vec<String> {
    vec![":80".to_string(), ":443".to_string()]
}

fn default_push_timeout() -> u64 {
    10
}

fn default_push_attempts() -> u32 {
    3
}

fn default_push_backoff() -> u64 {
    200
}

fn default_health_endpoint() -> String {
    "/".to_string()
}

fn default_health_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    5
}

fn default_health_retries() -> u32 {
    3
}

impl DeploymentConfig {
    /// Load from a YAML file, overlaid with `SLICK__SECTION__KEY` environment
    /// variables, then resolve `{env.NAME}` references and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        #[cfg(debug_assertions)]
        let _ = dotenvy::from_filename(".env.local");

        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix("SLICK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let mut config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.resolve_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without resolving or validating it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        ConfigBuilder::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Resolve environment references in TLS directives and the registry password.
    ///
    /// A registry password that names an existing variable is replaced by its
    /// value; otherwise it goes through the same templating as TLS directives.
    pub fn resolve_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for rule in &mut self.caddy.rules {
            if let Some(tls) = &rule.tls {
                let resolved = interpolate(tls, &lookup)
                    .with_context(|| format!("tls directive of rule {:?}", rule.match_expr))?;
                rule.tls = Some(resolved);
            }
        }

        if let Some(registry) = &mut self.app.registry {
            let raw = registry.password.expose_secret();
            let resolved = match lookup(raw) {
                Some(value) => value,
                None => interpolate(raw, &lookup).context("registry password")?,
            };
            registry.password = SecretString::from(resolved);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.app.name.trim().is_empty(), "app.name must not be empty");
        ensure!(!self.app.image.trim().is_empty(), "app.image must not be empty");
        ensure!(self.app.container_port != 0, "app.container_port must be set");

        let range = self.app.port_range;
        ensure!(
            range.start > 0 && range.start <= range.end,
            "app.port_range is invalid: {}-{}",
            range.start,
            range.end
        );

        let admin = Url::parse(&self.caddy.admin_api)
            .with_context(|| format!("caddy.admin_api is not a URL: {}", self.caddy.admin_api))?;
        ensure!(
            matches!(admin.scheme(), "http" | "https"),
            "caddy.admin_api must be an http(s) URL"
        );
        ensure!(self.caddy.push_timeout_seconds > 0, "caddy.push_timeout_seconds must be > 0");
        ensure!(self.caddy.push_attempts > 0, "caddy.push_attempts must be > 0");
        for rule in &self.caddy.rules {
            ensure!(
                !rule.match_expr.trim().is_empty(),
                "caddy rule with empty match expression"
            );
        }

        let health = &self.health_check;
        ensure!(health.timeout_seconds > 0, "health_check.timeout_seconds must be > 0");
        ensure!(health.interval_seconds > 0, "health_check.interval_seconds must be > 0");
        ensure!(health.max_retries > 0, "health_check.max_retries must be > 0");

        Ok(())
    }
}

/// An `{env.NAME}` reference the lookup could not resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolved environment reference {{env.{name}}}")]
pub struct UnresolvedReference {
    pub name: String,
}

static ENV_REFERENCE: LazyLock<regress::Regex> = LazyLock::new(|| {
    regress::Regex::new(r"\{env\.([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("valid env reference pattern")
});

/// Substitute every `{env.NAME}` in `input` using `lookup`.
pub fn interpolate<F>(input: &str, lookup: F) -> Result<String, UnresolvedReference>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    for m in ENV_REFERENCE.find_iter(input) {
        let Some(name) = m.group(1).map(|range| &input[range]) else {
            continue;
        };
        let value = lookup(name).ok_or_else(|| UnresolvedReference {
            name: name.to_string(),
        })?;
        out.push_str(&input[cursor..m.start()]);
        out.push_str(&value);
        cursor = m.end();
    }
    out.push_str(&input[cursor..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const FULL: &str = r#"
app:
  name: "Test App"
  image: "testapp/image"
  container_port: 8080
  env: ["ENV_VAR=VALUE"]
  port_range:
    start: 8000
    end: 9000
caddy:
  admin_api: "http://localhost:2019"
  rules:
    - match: "example.com"
      tls: "{env.TLS_EMAIL}"
      reverse_proxy:
        - path: "/*"
          to: "localhost:{port}"
    - match: "api.example.com"
      reverse_proxy:
        - path: "/v1/*"
          to: "localhost:{port}"
health_check:
  endpoint: "/health"
  timeout_seconds: 30
"#;

    #[test]
    fn parses_full_document() {
        let config = DeploymentConfig::from_yaml_str(FULL).unwrap();
        assert_eq!(config.app.name, "Test App");
        assert_eq!(config.app.image, "testapp/image");
        assert_eq!(config.app.container_port, 8080);
        assert_eq!(config.app.env, vec!["ENV_VAR=VALUE".to_string()]);
        assert_eq!(config.caddy.admin_api, "http://localhost:2019");
        assert_eq!(config.health_check.endpoint, "/health");
        assert_eq!(config.health_check.timeout_seconds, 30);
        // unset fields fall back to defaults
        assert_eq!(config.health_check.interval_seconds, 5);
        assert_eq!(config.health_check.max_retries, 3);

        let matches: Vec<_> = config.caddy.rules.iter().map(|r| r.match_expr.as_str()).collect();
        assert_eq!(matches, vec!["example.com", "api.example.com"]);
        assert_eq!(config.caddy.rules[1].reverse_proxy[0].path, "/v1/*");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn applies_defaults() {
        let config = DeploymentConfig::from_yaml_str("app:\n  name: \"Test App\"\n").unwrap();
        assert_eq!(config.app.port_range, PortRange { start: 8000, end: 9000 });
        assert_eq!(config.caddy.admin_api, "http://localhost:2019");
        assert_eq!(config.caddy.listen, vec![":80".to_string(), ":443".to_string()]);
        assert_eq!(config.health_check.endpoint, "/");
        assert_eq!(config.health_check.timeout_seconds, 5);
        assert!(config.caddy.rules.is_empty());
        assert!(config.app.registry_credentials().is_none());
    }

    #[test]
    fn rejects_malformed_document() {
        assert!(DeploymentConfig::from_yaml_str("app: \"Thou shall fail\"\n").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(DeploymentConfig::load("nonexistent.yaml").is_err());
    }

    #[test]
    fn resolves_tls_reference() {
        let mut config = DeploymentConfig::from_yaml_str(FULL).unwrap();
        config
            .resolve_env(env(&[("TLS_EMAIL", "ops@example.com")]))
            .unwrap();
        assert_eq!(config.caddy.rules[0].tls.as_deref(), Some("ops@example.com"));
        assert_eq!(config.caddy.rules[1].tls, None);
    }

    #[test]
    fn unresolved_tls_reference_blocks_loading() {
        let mut config = DeploymentConfig::from_yaml_str(FULL).unwrap();
        let err = config.resolve_env(env(&[])).unwrap_err();
        assert!(format!("{err:#}").contains("{env.TLS_EMAIL}"));
    }

    #[test]
    fn registry_password_from_named_variable() {
        let yaml = r#"
app:
  name: "Test App"
  image: "testapp/image"
  container_port: 8080
  registry:
    username: "testuser"
    password: TEST_REGISTRY_PASSWORD
"#;
        let mut config = DeploymentConfig::from_yaml_str(yaml).unwrap();
        config
            .resolve_env(env(&[("TEST_REGISTRY_PASSWORD", "testpassword")]))
            .unwrap();
        let registry = config.app.registry_credentials().unwrap();
        assert_eq!(registry.username, "testuser");
        assert_eq!(registry.password.expose_secret(), "testpassword");
    }

    #[test]
    fn registry_password_literal_is_kept() {
        let yaml = r#"
app:
  name: "Test App"
  registry:
    username: "testuser"
    password: "hunter2"
"#;
        let mut config = DeploymentConfig::from_yaml_str(yaml).unwrap();
        config.resolve_env(env(&[])).unwrap();
        let registry = config.app.registry_credentials().unwrap();
        assert_eq!(registry.password.expose_secret(), "hunter2");
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = DeploymentConfig::from_yaml_str(FULL).unwrap();
        config.app.port_range = PortRange { start: 9000, end: 8000 };
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::from_yaml_str(FULL).unwrap();
        config.caddy.admin_api = "localhost:2019".to_string();
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::from_yaml_str(FULL).unwrap();
        config.health_check.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::from_yaml_str(FULL).unwrap();
        config.health_check.interval_seconds = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("interval_seconds"));

        let config = DeploymentConfig::from_yaml_str("app:\n  name: \"Test App\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn interpolate_substitutes_all_references() {
        let lookup = env(&[("A", "1"), ("B", "two")]);
        assert_eq!(interpolate("{env.A}-{env.B}-{env.A}", &lookup).unwrap(), "1-two-1");
        assert_eq!(interpolate("plain", &lookup).unwrap(), "plain");
        assert_eq!(interpolate("", &lookup).unwrap(), "");
        // not a well-formed reference, left alone
        assert_eq!(interpolate("{env.1X}", &lookup).unwrap(), "{env.1X}");
    }

    #[test]
    fn interpolate_reports_unresolved_name() {
        let lookup = env(&[("A", "1")]);
        assert_eq!(
            interpolate("{env.A} {env.MISSING}", &lookup),
            Err(UnresolvedReference {
                name: "MISSING".to_string()
            })
        );
    }
}
