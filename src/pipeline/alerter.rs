use std::sync::Arc;
use std::time::Duration;

use crate::config::AlertConfig;
use crate::core::alert::send_webhook_alert;
use crate::core::error::EngineError;
use crate::core::fingerprint::sha256_hex;
use crate::core::kv::{keys, CorrelationStore};
use crate::core::time::now_utc;
use crate::core::types::{
    AlertDeliveryResult, CampaignDetectionResult, ThreatAnalysis, WafAlert,
};

/// What an alert is raised about: one event's analysis, or a campaign
/// crossing its threshold.
pub enum AlertSource<'a> {
    Threat(&'a ThreatAnalysis),
    Campaign(&'a CampaignDetectionResult),
}

/// Decides whether and how to notify. Throttle markers live in the same
/// correlation store the campaign detector uses, so they expire via TTL
/// like everything else.
pub struct AlertEngine {
    store: Arc<dyn CorrelationStore>,
    cfg: AlertConfig,
    org_id: String,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn CorrelationStore>, cfg: AlertConfig, org_id: impl Into<String>) -> Self {
        Self {
            store,
            cfg,
            org_id: org_id.into(),
        }
    }

    pub fn create_alert(&self, source: &AlertSource) -> WafAlert {
        let created_at = now_utc();
        match source {
            AlertSource::Threat(analysis) => {
                let throttle_key = format!("threat:{:?}:{}", analysis.threat_type, analysis.source_ip);
                WafAlert {
                    id: alert_id(&throttle_key, created_at.timestamp_millis()),
                    created_at,
                    severity: analysis.severity,
                    source_ip: analysis.source_ip.clone(),
                    threat_type: Some(analysis.threat_type),
                    campaign_key: None,
                    title: format!("{:?} from {}", analysis.threat_type, analysis.source_ip),
                    detail: format!(
                        "{} {} matched {} (firewall action: {})",
                        analysis.method,
                        analysis.path,
                        analysis.matched_pattern.as_deref().unwrap_or("-"),
                        if analysis.blocked_by_firewall { "blocked" } else { "passed" },
                    ),
                    throttle_key,
                }
            }
            AlertSource::Campaign(result) => {
                let throttle_key = format!("campaign:{}", result.key);
                WafAlert {
                    id: alert_id(&throttle_key, created_at.timestamp_millis()),
                    created_at,
                    severity: result.severity,
                    source_ip: result.source_ip.clone(),
                    threat_type: None,
                    campaign_key: Some(result.key.clone()),
                    title: format!("Attack campaign from {}", result.source_ip),
                    detail: format!(
                        "{} qualifying events (threshold {})",
                        result.event_count, result.threshold
                    ),
                    throttle_key,
                }
            }
        }
    }

    /// Cooldown throttle: the first caller inside the window wins and arms
    /// a marker whose expiry stays anchored at that send. Duplicates are
    /// suppressed without extending the marker, so under sustained traffic
    /// the alert re-fires once per cooldown. The set-if-absent is atomic,
    /// so two workers cannot both win. A store failure propagates; the
    /// caller surfaces it rather than guessing.
    pub fn should_send_alert(&self, alert: &WafAlert) -> Result<bool, EngineError> {
        let key = keys::alert_throttle(&self.org_id, &alert.throttle_key);
        self.store
            .set_nx_with_ttl(&key, "1", Duration::from_millis(self.cfg.cooldown_ms))
    }

    /// Dispatches to the configured webhook. Never returns an error:
    /// delivery failure is part of the result value.
    pub async fn send_alert(&self, client: &reqwest::Client, alert: &WafAlert) -> AlertDeliveryResult {
        match self.cfg.webhook_url.as_deref() {
            Some(url) => send_webhook_alert(client, url, alert).await,
            None => {
                tracing::debug!("alert {} not delivered: no webhook configured", alert.id);
                AlertDeliveryResult {
                    alert_id: alert.id.clone(),
                    delivered: false,
                    error: Some("no webhook configured".to_string()),
                }
            }
        }
    }
}

fn alert_id(throttle_key: &str, created_ms: i64) -> String {
    format!(
        "alert_{}",
        sha256_hex(format!("{}|{}", throttle_key, created_ms).as_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv::MemoryStore;
    use crate::core::types::{MatchStrength, Severity, ThreatType};

    fn engine(cooldown_ms: u64) -> AlertEngine {
        AlertEngine::new(
            Arc::new(MemoryStore::new()),
            AlertConfig {
                cooldown_ms,
                ..AlertConfig::default()
            },
            "org-1",
        )
    }

    fn threat() -> ThreatAnalysis {
        ThreatAnalysis {
            threat_type: ThreatType::SensitivePathAccess,
            severity: Severity::Medium,
            match_strength: MatchStrength::Strong,
            source_ip: "203.0.113.4".into(),
            path: "/.env".into(),
            method: "GET".into(),
            user_agent: None,
            matched_pattern: Some("path:/.env".into()),
            blocked_by_firewall: false,
            timestamp: now_utc(),
        }
    }

    #[test]
    fn duplicate_alerts_are_throttled_within_cooldown() {
        let engine = engine(60_000);
        let analysis = threat();
        let alert = engine.create_alert(&AlertSource::Threat(&analysis));
        assert!(engine.should_send_alert(&alert).unwrap());
        assert!(!engine.should_send_alert(&alert).unwrap());
    }

    #[test]
    fn throttle_marker_expires() {
        let engine = engine(30);
        let analysis = threat();
        let alert = engine.create_alert(&AlertSource::Threat(&analysis));
        assert!(engine.should_send_alert(&alert).unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert!(engine.should_send_alert(&alert).unwrap());
    }

    #[test]
    fn sustained_duplicates_refire_once_per_cooldown() {
        let engine = engine(80);
        let analysis = threat();
        let alert = engine.create_alert(&AlertSource::Threat(&analysis));
        assert!(engine.should_send_alert(&alert).unwrap());

        // Duplicates arriving faster than the cooldown must not keep
        // pushing the marker's expiry out.
        let mut refires = 0;
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(30));
            if engine.should_send_alert(&alert).unwrap() {
                refires += 1;
            }
        }
        assert!(refires >= 2, "expected periodic re-fires, got {}", refires);
    }

    #[tokio::test]
    async fn missing_webhook_is_recorded_not_thrown() {
        let engine = engine(1000);
        let analysis = threat();
        let alert = engine.create_alert(&AlertSource::Threat(&analysis));
        let client = reqwest::Client::new();
        let result = engine.send_alert(&client, &alert).await;
        assert!(!result.delivered);
        assert!(result.error.is_some());
    }
}
