use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{CampaignConfig, KeyScheme};
use crate::core::error::EngineError;
use crate::core::kv::{keys, CorrelationStore};
use crate::core::types::{CampaignDetectionResult, CampaignState, ThreatAnalysis};

/// Upper bound on the grace margin added to the window when setting key
/// TTLs, so a campaign that stops producing events self-expires without a
/// cleanup pass. The effective grace never exceeds the window itself.
const CAMPAIGN_TTL_GRACE_MS: u64 = 60_000;

/// Keeps at most this many distinct paths per campaign state blob.
const MAX_TRACKED_PATHS: usize = 32;

/// Correlates many individually low-grade events from one attacker key
/// into a single campaign. All state lives in the injected correlation
/// store; any number of workers can feed the same campaign concurrently.
///
/// The event counter is a dedicated store key touched only through the
/// atomic increment, so the threshold crossing is observed by exactly one
/// worker. The descriptive state blob is a separate key where
/// last-writer-wins is acceptable.
pub struct CampaignDetector {
    store: Arc<dyn CorrelationStore>,
    cfg: CampaignConfig,
    org_id: String,
}

impl CampaignDetector {
    pub fn new(store: Arc<dyn CorrelationStore>, cfg: CampaignConfig, org_id: impl Into<String>) -> Self {
        Self {
            store,
            cfg,
            org_id: org_id.into(),
        }
    }

    fn scope_for(&self, analysis: &ThreatAnalysis) -> String {
        match self.cfg.key_scheme {
            KeyScheme::SourceIp => analysis.source_ip.clone(),
            KeyScheme::IpPath => format!("{}|{}", analysis.source_ip, analysis.path),
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.cfg.window_ms.min(CAMPAIGN_TTL_GRACE_MS))
    }

    fn key_ttl(&self) -> Duration {
        Duration::from_millis(self.cfg.window_ms) + self.grace()
    }

    /// Feeds one analysis into the campaign keyed by its source. Events
    /// that carry no threat are not counted. Fails closed: a store error
    /// propagates instead of silently reporting "no campaign".
    pub fn detect_campaign(
        &self,
        analysis: &ThreatAnalysis,
    ) -> Result<CampaignDetectionResult, EngineError> {
        if !analysis.is_threat() {
            return Ok(CampaignDetectionResult {
                key: String::new(),
                source_ip: analysis.source_ip.clone(),
                counted: false,
                event_count: 0,
                threshold: self.cfg.threshold,
                just_detected: false,
                active: false,
                severity: analysis.severity,
            });
        }

        let scope = self.scope_for(analysis);
        let count_key = keys::campaign_count(&self.org_id, &scope);
        let state_key = keys::campaign_state(&self.org_id, &scope);
        let ttl = self.key_ttl();

        let count = self.store.incr_with_ttl(&count_key, ttl)?;

        // A resolved blob lingering in its grace window must not absorb a
        // renewed attack; the new events start a fresh campaign.
        let mut state = self
            .store
            .get(&state_key)?
            .map(|json| serde_json::from_str::<CampaignState>(&json))
            .transpose()?
            .filter(|prev| !prev.resolved)
            .unwrap_or_else(|| CampaignState {
                key: state_key.clone(),
                org_id: self.org_id.clone(),
                source_ip: analysis.source_ip.clone(),
                window_start: analysis.timestamp,
                last_event_at: analysis.timestamp,
                event_count: 0,
                distinct_paths: Vec::new(),
                severity: analysis.severity,
                resolved: false,
            });
        state.event_count = state.event_count.max(count);
        state.last_event_at = analysis.timestamp;
        state.severity = state.severity.max(analysis.severity);
        if !state.distinct_paths.iter().any(|p| p == &analysis.path)
            && state.distinct_paths.len() < MAX_TRACKED_PATHS
        {
            state.distinct_paths.push(analysis.path.clone());
        }
        self.store
            .set_with_ttl(&state_key, &serde_json::to_string(&state)?, ttl)?;

        let just_detected = count == self.cfg.threshold;
        let active = count >= self.cfg.threshold;
        if just_detected {
            tracing::info!(
                "campaign detected: key={} events={} paths={}",
                state_key,
                count,
                state.distinct_paths.len()
            );
        }

        Ok(CampaignDetectionResult {
            key: state_key,
            source_ip: analysis.source_ip.clone(),
            counted: true,
            event_count: count,
            threshold: self.cfg.threshold,
            just_detected,
            active,
            severity: state.severity,
        })
    }

    /// Campaigns for this org that crossed the threshold and are not yet
    /// resolved. Expired ones fall out via TTL and never appear here.
    pub fn get_active_campaigns(&self) -> Result<Vec<CampaignState>, EngineError> {
        let prefix = keys::campaign_state(&self.org_id, "");
        let mut out = Vec::new();
        for (_, json) in self.store.scan_prefix(&prefix)? {
            let state: CampaignState = serde_json::from_str(&json)?;
            if !state.resolved && state.event_count >= self.cfg.threshold {
                out.push(state);
            }
        }
        Ok(out)
    }

    /// Marks a campaign resolved and drops its counter. The state blob is
    /// kept for a short grace period so late readers see the resolution
    /// instead of a half-deleted campaign.
    pub fn resolve_campaign(&self, campaign_key: &str) -> Result<bool, EngineError> {
        let Some(json) = self.store.get(campaign_key)? else {
            return Ok(false);
        };
        let mut state: CampaignState = serde_json::from_str(&json)?;
        state.resolved = true;
        self.store
            .set_with_ttl(campaign_key, &serde_json::to_string(&state)?, self.grace())?;
        if let Some(scope) = campaign_key.strip_prefix(&keys::campaign_state(&self.org_id, "")) {
            self.store.delete(&keys::campaign_count(&self.org_id, scope))?;
        }
        Ok(true)
    }

    /// Removes campaigns whose last event predates `older_than`. Safe to
    /// run concurrently with detection: every delete is per-key atomic,
    /// and a racing event simply restarts the campaign window from one.
    pub fn cleanup_old_campaigns(&self, older_than: DateTime<Utc>) -> Result<usize, EngineError> {
        let prefix = keys::campaign_state(&self.org_id, "");
        let mut removed = 0usize;
        for (key, json) in self.store.scan_prefix(&prefix)? {
            let state: CampaignState = serde_json::from_str(&json)?;
            if state.last_event_at < older_than {
                if let Some(scope) = key.strip_prefix(&prefix) {
                    self.store.delete(&keys::campaign_count(&self.org_id, scope))?;
                }
                self.store.delete(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Point lookup used by the alert and auto-block stages to avoid
    /// redundant work.
    pub fn is_ip_in_campaign(&self, ip: &str) -> Result<bool, EngineError> {
        match self.cfg.key_scheme {
            KeyScheme::SourceIp => {
                let count_key = keys::campaign_count(&self.org_id, ip);
                match self.store.get(&count_key)? {
                    Some(value) => {
                        let count: u64 = value.parse().map_err(|_| {
                            EngineError::Store(format!("non-numeric counter at {}", count_key))
                        })?;
                        Ok(count >= self.cfg.threshold)
                    }
                    None => Ok(false),
                }
            }
            KeyScheme::IpPath => {
                let prefix = keys::campaign_state(&self.org_id, "");
                for (_, json) in self.store.scan_prefix(&prefix)? {
                    let state: CampaignState = serde_json::from_str(&json)?;
                    if state.source_ip == ip
                        && !state.resolved
                        && state.event_count >= self.cfg.threshold
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv::MemoryStore;
    use crate::core::types::{MatchStrength, Severity, ThreatType};

    fn analysis(ip: &str, path: &str, severity: Severity) -> ThreatAnalysis {
        ThreatAnalysis {
            threat_type: ThreatType::AttackSignature,
            severity,
            match_strength: MatchStrength::Strong,
            source_ip: ip.into(),
            path: path.into(),
            method: "GET".into(),
            user_agent: None,
            matched_pattern: Some("signature:../".into()),
            blocked_by_firewall: false,
            timestamp: crate::core::time::now_utc(),
        }
    }

    fn detector(threshold: u64) -> CampaignDetector {
        let cfg = CampaignConfig {
            threshold,
            ..CampaignConfig::default()
        };
        CampaignDetector::new(Arc::new(MemoryStore::new()), cfg, "org-1")
    }

    #[test]
    fn non_threat_events_are_not_counted() {
        let det = detector(3);
        let mut a = analysis("10.0.0.1", "/x", Severity::Info);
        a.threat_type = ThreatType::None;
        let res = det.detect_campaign(&a).unwrap();
        assert!(!res.counted);
        assert_eq!(res.event_count, 0);
    }

    #[test]
    fn state_tracks_distinct_paths_and_max_severity() {
        let det = detector(10);
        det.detect_campaign(&analysis("10.0.0.1", "/a", Severity::Medium)).unwrap();
        det.detect_campaign(&analysis("10.0.0.1", "/b", Severity::High)).unwrap();
        det.detect_campaign(&analysis("10.0.0.1", "/a", Severity::Low)).unwrap();
        let res = det.detect_campaign(&analysis("10.0.0.1", "/c", Severity::Low)).unwrap();
        assert_eq!(res.event_count, 4);
        assert_eq!(res.severity, Severity::High);

        let key = res.key;
        let json = det.store.get(&key).unwrap().unwrap();
        let state: CampaignState = serde_json::from_str(&json).unwrap();
        assert_eq!(state.distinct_paths, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn campaigns_are_tenant_scoped() {
        let store: Arc<dyn CorrelationStore> = Arc::new(MemoryStore::new());
        let det_a = CampaignDetector::new(store.clone(), CampaignConfig { threshold: 2, ..CampaignConfig::default() }, "org-a");
        let det_b = CampaignDetector::new(store, CampaignConfig { threshold: 2, ..CampaignConfig::default() }, "org-b");

        det_a.detect_campaign(&analysis("10.0.0.1", "/a", Severity::High)).unwrap();
        det_a.detect_campaign(&analysis("10.0.0.1", "/a", Severity::High)).unwrap();

        assert!(det_a.is_ip_in_campaign("10.0.0.1").unwrap());
        assert!(!det_b.is_ip_in_campaign("10.0.0.1").unwrap());
        assert_eq!(det_b.get_active_campaigns().unwrap().len(), 0);
    }

    #[test]
    fn resolve_retires_campaign() {
        let det = detector(2);
        det.detect_campaign(&analysis("10.0.0.9", "/a", Severity::High)).unwrap();
        let res = det.detect_campaign(&analysis("10.0.0.9", "/a", Severity::High)).unwrap();
        assert!(res.just_detected);
        assert_eq!(det.get_active_campaigns().unwrap().len(), 1);

        assert!(det.resolve_campaign(&res.key).unwrap());
        assert!(det.get_active_campaigns().unwrap().is_empty());
        assert!(!det.is_ip_in_campaign("10.0.0.9").unwrap());
    }

    #[test]
    fn renewed_attack_after_resolve_is_a_fresh_campaign() {
        let det = detector(2);
        det.detect_campaign(&analysis("10.0.0.9", "/a", Severity::High)).unwrap();
        let first = det.detect_campaign(&analysis("10.0.0.9", "/b", Severity::High)).unwrap();
        assert!(first.just_detected);
        assert!(det.resolve_campaign(&first.key).unwrap());
        assert!(det.get_active_campaigns().unwrap().is_empty());

        // The attacker comes back before the resolved blob's grace TTL has
        // run out. Detection and the active view must agree again.
        det.detect_campaign(&analysis("10.0.0.9", "/c", Severity::High)).unwrap();
        let second = det.detect_campaign(&analysis("10.0.0.9", "/d", Severity::High)).unwrap();
        assert!(second.just_detected);
        assert_eq!(second.event_count, 2);
        assert_eq!(det.get_active_campaigns().unwrap().len(), 1);
        assert!(det.is_ip_in_campaign("10.0.0.9").unwrap());

        let state: CampaignState =
            serde_json::from_str(&det.store.get(&second.key).unwrap().unwrap()).unwrap();
        assert!(!state.resolved);
        assert_eq!(state.distinct_paths, vec!["/c", "/d"]);
    }

    #[test]
    fn cleanup_removes_stale_campaigns_only() {
        let det = detector(1);
        det.detect_campaign(&analysis("10.0.0.1", "/a", Severity::High)).unwrap();
        let cutoff = crate::core::time::now_utc() + chrono::Duration::seconds(1);
        assert_eq!(det.cleanup_old_campaigns(cutoff).unwrap(), 1);
        assert!(det.get_active_campaigns().unwrap().is_empty());
    }
}
