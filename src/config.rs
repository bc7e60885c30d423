use std::collections::HashMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, AssetId};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub log_to_stdout: bool,
    #[serde(default)]
    pub exchange: ExchangeSeed,
}

/// Initial exchange state applied by the exchange module at load time.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ExchangeSeed {
    #[serde(default)]
    pub epsilon: Option<f64>,
    #[serde(default)]
    pub ask_fee_pct: Option<f64>,
    #[serde(default)]
    pub bid_fee_pct: Option<f64>,
    #[serde(default)]
    pub fee_account: Option<AccountId>,
    #[serde(default)]
    pub assets: Vec<AssetSeed>,
    #[serde(default)]
    pub markets: Vec<MarketSeed>,
    /// Free-form variables, applied after the named fields above.
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssetSeed {
    pub name: String,
    pub id: AssetId,
}

/// Market seed; assets are referenced by name or numeric id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MarketSeed {
    pub name: String,
    pub order_asset: String,
    pub payment_asset: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            log_file: "bourse.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            log_to_stdout: false,
            exchange: ExchangeSeed::default(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(content: &str) -> serde_yaml::Result<Self> {
        serde_yaml::from_str(content)
    }

    /// Read `config/{env}.yaml`, falling back to defaults when the file
    /// does not exist. A present but malformed file is a hard error.
    pub fn load_or_default(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        match fs::read_to_string(&config_path) {
            Ok(content) => Self::from_yaml(&content)
                .unwrap_or_else(|e| panic!("Failed to parse {}: {}", config_path, e)),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
log_level: debug
log_dir: logs
log_file: test.log
use_json: true
rotation: never
log_to_stdout: true
exchange:
  epsilon: 0.01
  ask_fee_pct: 0.002
  bid_fee_pct: 0.001
  fee_account: 99
  assets:
    - name: XBT
      id: 0
    - name: USD
      id: 1
  markets:
    - name: XBT/USD
      order_asset: XBT
      payment_asset: USD
  vars:
    exchange.epsilon: "0.02"
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.use_json);
        assert_eq!(config.exchange.epsilon, Some(0.01));
        assert_eq!(config.exchange.fee_account, Some(99));
        assert_eq!(config.exchange.assets.len(), 2);
        assert_eq!(config.exchange.assets[1].name, "USD");
        assert_eq!(config.exchange.markets[0].order_asset, "XBT");
        assert_eq!(
            config.exchange.vars.get("exchange.epsilon"),
            Some(&"0.02".to_string())
        );
    }

    #[test]
    fn test_exchange_section_is_optional() {
        let yaml = r#"
log_level: info
log_dir: logs
log_file: app.log
use_json: false
rotation: daily
log_to_stdout: false
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(config.exchange.assets.is_empty());
        assert!(config.exchange.epsilon.is_none());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_or_default("no_such_env_for_tests");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.rotation, "daily");
    }
}
