use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::orion::DEFAULT_SCORE_THRESHOLD;
use crate::{MerseError, Result};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

/// Environment lookups with an in-memory overlay. Blank values count as unset.
#[derive(Clone)]
pub struct Env {
    pub overrides: BTreeMap<String, String>,
    process: bool,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            overrides: BTreeMap::new(),
            process: true,
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.overrides.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("override_keys", &keys).finish()
    }
}

impl Env {
    /// Lookups that never consult the process environment.
    pub fn isolated(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            overrides: pairs.into_iter().collect(),
            process: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(key) {
            return Some(value.clone()).filter(|value| !value.trim().is_empty());
        }
        if !self.process {
            return None;
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    /// First non-blank value among `keys`.
    pub fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CounterConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub prefix: Option<String>,
    pub redis_url: Option<String>,
}

impl std::fmt::Debug for CounterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("prefix", &self.prefix)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalLimitsConfig {
    /// Requests per window for the per-user limiter on ledger routes.
    pub default_limit: u32,
    pub window_ms: u64,
}

impl Default for LocalLimitsConfig {
    fn default() -> Self {
        Self {
            default_limit: 30,
            window_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrionConfig {
    pub base_url: Option<String>,
    pub score_threshold: f64,
}

impl Default for OrionConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub listen: String,
    pub store: StoreConfig,
    pub counter: CounterConfig,
    pub limits: LocalLimitsConfig,
    pub orion: OrionConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            store: StoreConfig::default(),
            counter: CounterConfig::default(),
            limits: LocalLimitsConfig::default(),
            orion: OrionConfig::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|err| MerseError::Config(format!("toml: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
            .map_err(|err| MerseError::Config(format!("{}: {err}", path.display())))
    }

    /// Environment wins over file values for the counter and loop endpoints.
    pub fn apply_env(&mut self, env: &Env) {
        if let Some(url) = env.first(&["MERSE_COUNTER_URL", "UPSTASH_REDIS_REST_URL"]) {
            self.counter.url = Some(url);
        }
        if let Some(token) = env.first(&["MERSE_COUNTER_TOKEN", "UPSTASH_REDIS_REST_TOKEN"]) {
            self.counter.token = Some(token);
        }
        if let Some(redis_url) = env.get("MERSE_REDIS_URL") {
            self.counter.redis_url = Some(redis_url);
        }
        if let Some(base_url) = env.get("MERSE_ORION_BASE_URL") {
            self.orion.base_url = Some(base_url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.window_ms == 0 {
            return Err(MerseError::Config(
                "limits.window_ms must be greater than zero".to_string(),
            ));
        }
        let threshold = self.orion.score_threshold;
        if !threshold.is_finite() || !(0.0..=10.0).contains(&threshold) {
            return Err(MerseError::Config(format!(
                "orion.score_threshold must be within 0..=10 (got {threshold})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Env {
        Env::isolated(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        )
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = LedgerConfig::from_toml_str("").expect("config");
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.orion.score_threshold, 8.5);
        assert_eq!(config.limits.window_ms, 60_000);
    }

    #[test]
    fn parses_sections() {
        let config = LedgerConfig::from_toml_str(
            r#"
listen = "0.0.0.0:9000"

[store]
sqlite_path = "/var/lib/merse/credits.sqlite"

[counter]
url = "https://counter.example"
token = "t0k"
prefix = "merse"

[limits]
default_limit = 5
window_ms = 1000

[orion]
base_url = "https://app.example"
score_threshold = 9.0
"#,
        )
        .expect("config");
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.counter.prefix.as_deref(), Some("merse"));
        assert_eq!(config.limits.default_limit, 5);
        assert_eq!(config.orion.score_threshold, 9.0);
        assert!(!format!("{:?}", config.counter).contains("t0k"));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(LedgerConfig::from_toml_str("[store]\npath = \"x\"").is_err());
        assert!(LedgerConfig::from_toml_str("[limits]\nwindow_ms = 0").is_err());
        assert!(LedgerConfig::from_toml_str("[orion]\nscore_threshold = 11.0").is_err());
    }

    #[test]
    fn env_overrides_counter_and_ignores_blank_values() {
        let mut config = LedgerConfig::default();
        config.counter.url = Some("https://from-file".to_string());
        config.apply_env(&env(&[
            ("MERSE_COUNTER_URL", "  "),
            ("UPSTASH_REDIS_REST_URL", "https://upstash.example"),
            ("UPSTASH_REDIS_REST_TOKEN", "secret"),
            ("MERSE_ORION_BASE_URL", "https://orion.example"),
        ]));
        assert_eq!(
            config.counter.url.as_deref(),
            Some("https://upstash.example")
        );
        assert_eq!(config.counter.token.as_deref(), Some("secret"));
        assert_eq!(
            config.orion.base_url.as_deref(),
            Some("https://orion.example")
        );
    }
}
