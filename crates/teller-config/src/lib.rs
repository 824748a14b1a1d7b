use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub ledger: Ledger,
    pub classifier: Classifier,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub executor: Executor,
    #[serde(default)]
    pub reconciler: Reconciler,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub mode: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub signer_endpoint: Option<String>,
    #[serde(default = "default_ledger_timeout_ms")]
    pub timeout_ms: u64,
    /// Identity used when `mode` is `memory`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classifier {
    pub mode: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_classifier_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_elide_threshold")]
    pub elide_threshold: usize,
    #[serde(default = "default_on_pending")]
    pub on_pending: String,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            elide_threshold: default_elide_threshold(),
            on_pending: default_on_pending(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    #[serde(default = "default_ui_wait_ms")]
    pub ui_wait_ms: u64,
    #[serde(default = "default_settlement_timeout_ms")]
    pub settlement_timeout_ms: u64,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            ui_wait_ms: default_ui_wait_ms(),
            settlement_timeout_ms: default_settlement_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciler {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_tournament_probe_limit")]
    pub tournament_probe_limit: u64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_concurrency: default_max_concurrency(),
            tournament_probe_limit: default_tournament_probe_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

fn default_ledger_timeout_ms() -> u64 {
    10_000
}

fn default_token_symbol() -> String {
    "ESPX".to_string()
}

fn default_classifier_timeout_ms() -> u64 {
    15_000
}

fn default_retry_max_attempts() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    0
}

fn default_temperature() -> f64 {
    0.1
}

/// Shortest text an elided summary value may be cut from.
pub const MIN_ELIDE_THRESHOLD: usize = 10;

fn default_elide_threshold() -> usize {
    10
}

fn default_on_pending() -> String {
    "replace".to_string()
}

fn default_ui_wait_ms() -> u64 {
    30_000
}

fn default_settlement_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_page_size() -> usize {
    500
}

fn default_max_concurrency() -> usize {
    16
}

fn default_tournament_probe_limit() -> u64 {
    256
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite" && is_blank(cfg.store.sqlite_path.as_deref()) {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    match cfg.ledger.mode.as_str() {
        "memory" => {
            if is_blank(cfg.ledger.address.as_deref()) {
                return Err(ConfigError::UnsupportedConfig(
                    "ledger.address is required when ledger.mode=memory".to_string(),
                ));
            }
        }
        "http" => {
            if is_blank(cfg.ledger.endpoint.as_deref())
                || is_blank(cfg.ledger.signer_endpoint.as_deref())
            {
                return Err(ConfigError::UnsupportedConfig(
                    "ledger.endpoint and ledger.signer_endpoint are required when ledger.mode=http"
                        .to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "ledger.mode={other} is not implemented; supported: memory, http"
            )));
        }
    }
    if cfg.classifier.mode != "gemini" && cfg.classifier.mode != "http" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "classifier.mode={} is not implemented; supported: gemini, http",
            cfg.classifier.mode
        )));
    }
    if cfg.classifier.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "classifier.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.gate.on_pending != "replace" && cfg.gate.on_pending != "reject" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "gate.on_pending={} is not implemented; supported: replace, reject",
            cfg.gate.on_pending
        )));
    }
    if cfg.gate.elide_threshold < MIN_ELIDE_THRESHOLD {
        return Err(ConfigError::UnsupportedConfig(format!(
            "gate.elide_threshold must be >= {MIN_ELIDE_THRESHOLD} (6 leading and 4 trailing characters are kept)"
        )));
    }
    if cfg.executor.ui_wait_ms == 0 || cfg.executor.settlement_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "executor.ui_wait_ms and executor.settlement_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.executor.ui_wait_ms > cfg.executor.settlement_timeout_ms {
        return Err(ConfigError::UnsupportedConfig(
            "executor.ui_wait_ms must not exceed executor.settlement_timeout_ms".to_string(),
        ));
    }
    if cfg.reconciler.page_size == 0 || cfg.reconciler.max_concurrency == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "reconciler.page_size and reconciler.max_concurrency must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("teller-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

ledger:
  mode: "memory"
  address: "0x00000000000000000000000000000000000000a1"

classifier:
  mode: "gemini"
  endpoint: "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
  api_key_env: "GEMINI_API_KEY"

audit:
  jsonl_path: "./teller-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_optional_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.gate.elide_threshold, 10);
        assert_eq!(cfg.gate.on_pending, "replace");
        assert_eq!(cfg.ledger.token_symbol, "ESPX");
        assert_eq!(cfg.classifier.retry_max_attempts, 1);
        assert!(cfg.executor.ui_wait_ms <= cfg.executor.settlement_timeout_ms);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn http_ledger_requires_both_endpoints() {
        let yaml = base_yaml().replace(
            "mode: \"memory\"\n  address: \"0x00000000000000000000000000000000000000a1\"",
            "mode: \"http\"\n  endpoint: \"http://127.0.0.1:8545\"",
        );
        let err = parse_and_validate(&yaml).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_gate_policy() {
        let yaml = format!("{}\ngate:\n  on_pending: \"queue\"\n", base_yaml());
        let err = parse_and_validate(&yaml).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_ui_wait_longer_than_settlement_bound() {
        let yaml = format!(
            "{}\nexecutor:\n  ui_wait_ms: 5000\n  settlement_timeout_ms: 1000\n",
            base_yaml()
        );
        let err = parse_and_validate(&yaml).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_elide_threshold_below_the_kept_characters() {
        let yaml = format!("{}\ngate:\n  elide_threshold: 8\n", base_yaml());
        assert!(parse_and_validate(&yaml).is_err());

        let mut cfg = parse_and_validate(&base_yaml()).unwrap();
        cfg.gate.elide_threshold = 8;
        let err = validate_runtime_support(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));

        cfg.gate.elide_threshold = 24;
        assert!(validate_runtime_support(&cfg).is_ok());
    }
}
