use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Five-level severity scale shared by findings and WAF analyses.
/// Ordering is derive-based, so `Info` ranks lowest and `Critical` highest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    New,
    Active,
    Resolved,
    Reopened,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::New => "new",
            FindingStatus::Active => "active",
            FindingStatus::Resolved => "resolved",
            FindingStatus::Reopened => "reopened",
        }
    }
}

/// Persisted security finding, tracked through its lifecycle rather than
/// re-created on every scan. Exactly one exists per fingerprint within an
/// org+account scope; resolution is a status change, never a delete.
///
/// `status` stays a string because pre-existing rows carry legacy values
/// (`open`, `pending`, mixed case); the classifier normalizes before any
/// transition lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub fingerprint: String,
    pub org_id: String,
    pub account_id: String,
    pub scan_type: String,
    pub title: String,
    pub severity: Severity,
    pub resource_arn: Option<String>,
    pub resource_id: String,
    pub status: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub occurrence_count: u64,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub suppression_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub evidence: serde_json::Value,
}

/// One finding as reported by a single scan run. Consumed once by the
/// classifier and not owned beyond the reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFinding {
    pub org_id: String,
    pub account_id: String,
    pub scan_type: String,
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub resource_arn: Option<String>,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub evidence: serde_json::Value,
}

/// What the firewall itself decided for the request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FirewallAction {
    Allow,
    Block,
    Count,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleGroupAction {
    pub rule_group: String,
    pub action: String,
    pub terminating_rule: Option<String>,
}

/// Canonical shape of one firewall log record after parsing. Derived from
/// the raw line, not persisted verbatim by this engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedWafEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub country: Option<String>,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
    pub user_agent: Option<String>,
    pub action: FirewallAction,
    pub web_acl: Option<String>,
    pub terminating_rule: Option<String>,
    pub rule_group_actions: Vec<RuleGroupAction>,
}

impl ParsedWafEvent {
    /// True when the firewall already stopped this request, either at the
    /// top-level action or inside a rule group.
    pub fn blocked_by_firewall(&self) -> bool {
        self.action == FirewallAction::Block
            || self
                .rule_group_actions
                .iter()
                .any(|r| r.action.eq_ignore_ascii_case("BLOCK"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatType {
    SuspiciousUserAgent,
    SensitivePathAccess,
    AttackSignature,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrength {
    Weak,
    Strong,
}

/// Stateless per-event verdict from the threat detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAnalysis {
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub match_strength: MatchStrength,
    pub source_ip: String,
    pub path: String,
    pub method: String,
    pub user_agent: Option<String>,
    pub matched_pattern: Option<String>,
    pub blocked_by_firewall: bool,
    pub timestamp: DateTime<Utc>,
}

impl ThreatAnalysis {
    pub fn is_threat(&self) -> bool {
        self.threat_type != ThreatType::None
    }
}

/// Shared, mutable correlation state for one attacker key. Lives in the
/// correlation store under a TTL; any worker may read or update it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignState {
    pub key: String,
    pub org_id: String,
    pub source_ip: String,
    pub window_start: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub event_count: u64,
    pub distinct_paths: Vec<String>,
    pub severity: Severity,
    #[serde(default)]
    pub resolved: bool,
}

/// Outcome of feeding one analysis into the campaign detector.
/// `just_detected` is true exactly once per campaign: on the event whose
/// atomic increment crossed the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignDetectionResult {
    pub key: String,
    pub source_ip: String,
    pub counted: bool,
    pub event_count: u64,
    pub threshold: u64,
    pub just_detected: bool,
    pub active: bool,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafAlert {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub severity: Severity,
    pub source_ip: String,
    pub threat_type: Option<ThreatType>,
    pub campaign_key: Option<String>,
    pub title: String,
    pub detail: String,
    /// Key used for cooldown throttling in the correlation store.
    pub throttle_key: String,
}

/// Dispatch outcome. Delivery failures are recorded here, never thrown;
/// retry policy belongs to the collaborator behind the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDeliveryResult {
    pub alert_id: String,
    pub delivered: bool,
    pub error: Option<String>,
}

/// Persisted block entry. At most one active (non-expired) record per IP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockRecord {
    pub ip: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResult {
    pub ip: String,
    pub expires_at: DateTime<Utc>,
    pub created: bool,
    pub extended: bool,
}

/// One existing/incoming pair for a finding present in both the store and
/// the current scan. The caller persists `next_status`, bumps
/// `occurrence_count` and refreshes `last_seen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingUpdate {
    pub existing: Finding,
    pub incoming: ScanFinding,
    pub next_status: FindingStatus,
}

/// Partition of a scan against the stored finding set. The union of
/// `to_create`, `to_update` and the untouched remainder of the stored set
/// reconstructs the next state exactly; nothing is silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Classification {
    pub to_create: Vec<Finding>,
    pub to_update: Vec<FindingUpdate>,
    pub to_resolve: Vec<Finding>,
    pub expired_suppressions: Vec<Finding>,
}
