use std::{fs, path::Path};

use serde::Deserialize;

use crate::core::error::EngineError;
use crate::core::types::Severity;

/// How campaign keys are scoped. IP-only is the default: path-scoped keys
/// under-count scanners that sweep many paths from one address.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KeyScheme {
    SourceIp,
    IpPath,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Correlation window length in milliseconds.
    pub window_ms: u64,
    /// Qualifying events from one key that make a campaign.
    pub threshold: u64,
    pub key_scheme: KeyScheme,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            window_ms: 300_000,
            threshold: 10,
            key_scheme: KeyScheme::SourceIp,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Duplicate alerts for the same key are suppressed for this long.
    pub cooldown_ms: u64,
    /// Single-event threats below this severity never raise an alert on
    /// their own; they still feed campaign detection.
    pub min_severity_for_alert: Severity,
    pub webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 300_000,
            min_severity_for_alert: Severity::High,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Floor severity that allows auto-blocking. Applies to campaign-level
    /// severity; isolated single events never block unless
    /// `block_on_single_event` is set.
    pub min_severity_for_block: Severity,
    pub block_ttl_ms: u64,
    pub block_on_single_event: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            min_severity_for_block: Severity::High,
            block_ttl_ms: 3_600_000,
            block_on_single_event: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DetectorConfig {
    /// Extra attack-signature regexes appended to the built-in set.
    pub extra_signature_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub org_id: String,
    pub campaign: CampaignConfig,
    pub alert: AlertConfig,
    pub block: BlockConfig,
    pub detector: DetectorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            org_id: "default".to_string(),
            campaign: CampaignConfig::default(),
            alert: AlertConfig::default(),
            block: BlockConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

pub fn load_config(path: Option<&str>) -> Result<EngineConfig, EngineError> {
    let default_path = Path::new("config/osprey.toml");
    let path = path.map(Path::new).unwrap_or(default_path);

    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| EngineError::Config(e.to_string()))?;
    let cfg: EngineConfig =
        toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.campaign.threshold, 10);
        assert_eq!(cfg.campaign.window_ms, 300_000);
        assert_eq!(cfg.campaign.key_scheme, KeyScheme::SourceIp);
        assert_eq!(cfg.alert.cooldown_ms, 300_000);
        assert_eq!(cfg.alert.min_severity_for_alert, Severity::High);
        assert_eq!(cfg.block.min_severity_for_block, Severity::High);
        assert!(!cfg.block.block_on_single_event);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            org_id = "acme"
            [campaign]
            threshold = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.org_id, "acme");
        assert_eq!(cfg.campaign.threshold, 3);
        assert_eq!(cfg.campaign.window_ms, 300_000);
        assert_eq!(cfg.block.block_ttl_ms, 3_600_000);
    }
}
