//! Layered configuration: built-in defaults, `config.default.yaml`, the user's
//! `config.yaml`, then environment variables. Later layers win key by key.

use std::{fs, path::Path, time::Duration};

use once_cell::sync::Lazy;
use rand::{Rng, distr::Alphanumeric, rng};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendType {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheRedisConfig {
    /// Appended to the connection-wide prefix for model cache keys.
    #[serde(default = "default_cache_redis_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheRedisConfig {
    fn default() -> Self {
        Self { key_prefix: default_cache_redis_key_prefix() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendType,
    /// Seconds a cached model view stays fresh.
    #[serde(default = "default_ttl_seconds")]
    pub ttl: u64,
    /// Seconds an empty discovery result is remembered.
    #[serde(default = "default_negative_ttl_seconds")]
    pub negative_ttl: u64,
    #[serde(default)]
    pub redis: CacheRedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendType::default(),
            ttl: default_ttl_seconds(),
            negative_ttl: default_negative_ttl_seconds(),
            redis: CacheRedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl)
    }
}

/// The built-in inference backend every organization can fall back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    #[serde(default = "default_inference_url")]
    pub inference_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Register the shared platform provider in the default organization on boot.
    #[serde(default)]
    pub setup: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            inference_url: default_inference_url(),
            api_key: None,
            setup: false,
        }
    }
}

fn default_ttl_seconds() -> u64 {
    600
}

fn default_negative_ttl_seconds() -> u64 {
    30
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "model-relay:".to_string()
}

fn default_cache_redis_key_prefix() -> String {
    "cache:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_inference_url() -> String {
    "http://127.0.0.1:8101/v1".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub admin_token: String,
    pub provider_secret: Option<String>,
    pub default_organization_id: i64,
    pub db_url: String,
    pub proxy: Option<String>,
    pub log_level: String,
    /// Seconds allowed for a backend model discovery call.
    pub discovery_timeout: u64,
    /// Seconds allowed for a buffered completion call.
    pub request_timeout: u64,
    /// Seconds between platform model refreshes.
    pub model_refresh_interval: u64,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl FinalConfig {
    fn programmatic_defaults() -> Self {
        FinalConfig {
            host: "0.0.0.0".to_string(),
            port: 8000,
            base_path: "/ai".to_string(),
            admin_token: generate_random_string(48),
            provider_secret: None,
            default_organization_id: 1,
            db_url: "./storage/sqlite.db".to_string(),
            proxy: None,
            log_level: "info".to_string(),
            discovery_timeout: 20,
            request_timeout: 600,
            model_refresh_interval: 60,
            platform: PlatformConfig::default(),
            redis: None,
            cache: CacheConfig::default(),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn model_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.model_refresh_interval.max(1))
    }

    /// Settles combinations that cannot work as written.
    fn normalize(&mut self) {
        if self.redis.is_none() && self.cache.backend == CacheBackendType::Redis {
            self.cache.backend = CacheBackendType::Memory;
        }
        if self.provider_secret.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.provider_secret = None;
        }
    }
}

fn generate_random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Overlays `layer` onto `base`. Mappings merge recursively; anything else replaces.
fn merge_layer(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Mapping(base), Value::Mapping(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(slot) => merge_layer(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// How an environment value is read before it is placed into the layer.
#[derive(Clone, Copy)]
enum EnvValue {
    /// Kept verbatim, so numeric-looking secrets stay strings.
    Text,
    /// Parsed as a YAML scalar, so `9000` and `true` keep their types.
    Scalar,
}

const ENV_KEYS: &[(&str, &[&str], EnvValue)] = &[
    ("HOST", &["host"], EnvValue::Text),
    ("PORT", &["port"], EnvValue::Scalar),
    ("BASE_PATH", &["base_path"], EnvValue::Text),
    ("ADMIN_TOKEN", &["admin_token"], EnvValue::Text),
    ("MODEL_PROVIDER_SECRET", &["provider_secret"], EnvValue::Text),
    ("DEFAULT_ORGANIZATION_ID", &["default_organization_id"], EnvValue::Scalar),
    ("DB_URL", &["db_url"], EnvValue::Text),
    ("PROXY", &["proxy"], EnvValue::Text),
    ("LOG_LEVEL", &["log_level"], EnvValue::Text),
    ("DISCOVERY_TIMEOUT", &["discovery_timeout"], EnvValue::Scalar),
    ("REQUEST_TIMEOUT", &["request_timeout"], EnvValue::Scalar),
    ("MODEL_REFRESH_INTERVAL", &["model_refresh_interval"], EnvValue::Scalar),
    ("PLATFORM_INFERENCE_URL", &["platform", "inference_url"], EnvValue::Text),
    ("PLATFORM_INFERENCE_API_KEY", &["platform", "api_key"], EnvValue::Text),
    ("PLATFORM_INFERENCE_SETUP", &["platform", "setup"], EnvValue::Scalar),
    ("REDIS_URL", &["redis", "url"], EnvValue::Text),
];

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut layer = Value::Mapping(Mapping::new());
    for (var, path, kind) in ENV_KEYS {
        let Some(raw) = lookup(var) else {
            continue;
        };
        let value = match kind {
            EnvValue::Text => Value::String(raw),
            EnvValue::Scalar => serde_yaml::from_str(&raw).unwrap_or(Value::String(raw)),
        };
        let nested = path
            .iter()
            .rev()
            .fold(value, |inner, key| {
                let mut mapping = Mapping::new();
                mapping.insert(Value::String(key.to_string()), inner);
                Value::Mapping(mapping)
            });
        merge_layer(&mut layer, nested);
    }
    layer
}

fn read_layer(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    let layer: Value = serde_yaml::from_str(&raw)
        .unwrap_or_else(|e| panic!("Failed to parse configuration file at {:?}: {}", path, e));
    // An empty file parses as null and contributes nothing.
    (!layer.is_null()).then_some(layer)
}

fn resolve(layers: Vec<Value>) -> Result<FinalConfig, serde_yaml::Error> {
    let mut merged = serde_yaml::to_value(FinalConfig::programmatic_defaults())?;
    for layer in layers {
        merge_layer(&mut merged, layer);
    }
    let mut config: FinalConfig = serde_yaml::from_value(merged)?;
    config.normalize();
    Ok(config)
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(|| {
    let (default_path, user_path) = if cfg!(debug_assertions) {
        let local = Path::new("../config.local.yaml");
        let user = if local.exists() { local } else { Path::new("../config.yaml") };
        (Path::new("../config.default.yaml"), user)
    } else {
        (Path::new("config.default.yaml"), Path::new("config.yaml"))
    };

    // The defaults file is rewritten on every boot so newly added keys show up in it.
    let defaults = resolve(read_layer(default_path).into_iter().collect())
        .unwrap_or_else(|e| panic!("Invalid default configuration at {:?}: {}", default_path, e));
    match serde_yaml::to_string(&defaults) {
        Ok(yaml) => {
            if let Err(e) = fs::write(default_path, yaml) {
                eprintln!("could not write default configuration to {:?}: {}", default_path, e);
            }
        }
        Err(e) => eprintln!("could not serialize default configuration: {}", e),
    }

    let mut layers = vec![serde_yaml::to_value(&defaults).unwrap_or(Value::Null)];
    layers.extend(read_layer(user_path));
    layers.push(env_layer(|key| std::env::var(key).ok()));
    resolve(layers).unwrap_or_else(|e| panic!("Invalid configuration: {}", e))
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn yaml(raw: &str) -> Value {
        serde_yaml::from_str(raw).unwrap()
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let config = resolve(vec![yaml(
            r#"
port: 9000
provider_secret: s3cret
platform:
  inference_url: http://inference.internal/v1
  setup: true
cache:
  ttl: 120
"#,
        )])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.provider_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.platform.inference_url, "http://inference.internal/v1");
        assert!(config.platform.setup);
        assert_eq!(config.cache.ttl(), Duration::from_secs(120));
        assert_eq!(config.cache.negative_ttl(), Duration::from_secs(30));
        assert_eq!(config.discovery_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(resolve(vec![yaml("jwt_secret: x\n")]).is_err());
        assert!(resolve(vec![yaml("cache:\n  size: 3\n")]).is_err());
    }

    #[test]
    fn test_env_layer_wins_and_keeps_types() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "9100"),
            ("ADMIN_TOKEN", "12345"),
            ("PLATFORM_INFERENCE_SETUP", "true"),
            ("REDIS_URL", "redis://cache:6379/"),
        ]);
        let env = env_layer(|key| env.get(key).map(|v| v.to_string()));
        let config = resolve(vec![yaml("port: 9000\nadmin_token: from-file\n"), env]).unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.admin_token, "12345");
        assert!(config.platform.setup);
        let redis = config.redis.unwrap();
        assert_eq!(redis.url, "redis://cache:6379/");
        assert_eq!(redis.pool_size, 10);
    }

    #[test]
    fn test_redis_cache_without_redis_falls_back_to_memory() {
        let config = resolve(vec![yaml("provider_secret: '  '\ncache:\n  backend: redis\n")]).unwrap();
        assert_eq!(config.cache.backend, CacheBackendType::Memory);
        assert!(config.provider_secret.is_none());

        let config = resolve(vec![yaml("redis:\n  url: redis://cache:6379/\ncache:\n  backend: redis\n")]).unwrap();
        assert_eq!(config.cache.backend, CacheBackendType::Redis);
        assert_eq!(config.redis.unwrap().key_prefix, "model-relay:");
    }
}
