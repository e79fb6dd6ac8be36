use regex::Regex;

use crate::core::error::EngineError;
use crate::core::types::{
    MatchStrength, ParsedWafEvent, Severity, ThreatAnalysis, ThreatType,
};

/// User agents belonging to known scanners and attack tooling.
const SCANNER_AGENTS: &[&str] = &[
    "sqlmap", "nikto", "nessus", "masscan", "nmap", "zgrab", "dirbuster", "gobuster", "wpscan",
    "hydra", "acunetix", "netsparker", "jorgee", "libwww-perl",
];

/// Administrative, credential or configuration paths that legitimate
/// traffic has no business requesting, regardless of response code.
const SENSITIVE_PATHS: &[&str] = &[
    "/admin", "/wp-admin", "/wp-login", "/.env", "/.git", "/.aws", "/phpmyadmin", "/config",
    "/console", "/actuator", "/server-status", "/backup", "/etc/passwd", "/cgi-bin",
];

/// Payload fragments consistent with injection, traversal or known
/// exploit strings, including common URL-encoded spellings.
const ATTACK_SIGNATURES: &[&str] = &[
    "union select", "union+select", "union%20select", " or 1=1", "' or '1'='1", "or 1=1--",
    "information_schema", "xp_cmdshell", "sleep(", "benchmark(", "../", "..%2f", "%2e%2e/",
    "%2e%2e%2f", "/etc/passwd", "<script", "%3cscript", "javascript:", "onerror=", "${jndi:",
    "$(", "wget http", "curl http", "/bin/sh", "etc/shadow",
];

/// Compiled signature set: the built-in fragments plus any extra regexes
/// from configuration. Build once per run, share across all events.
#[derive(Default)]
pub struct SignatureSet {
    extra: Vec<Regex>,
}

impl SignatureSet {
    pub fn from_patterns(patterns: &[String]) -> Result<Self, EngineError> {
        let mut extra = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let re = Regex::new(pattern)
                .map_err(|e| EngineError::Config(format!("bad signature pattern: {}", e)))?;
            extra.push(re);
        }
        Ok(Self { extra })
    }
}

/// Stateless per-event analysis. Depends only on the event's own fields,
/// so batches can run it concurrently in any order.
pub fn analyze(event: &ParsedWafEvent, signatures: &SignatureSet) -> ThreatAnalysis {
    let blocked = event.blocked_by_firewall();

    let hit = detect_attack_signatures(event, signatures)
        .map(|(pattern, strength)| (ThreatType::AttackSignature, pattern, strength))
        .or_else(|| {
            detect_sensitive_path_access(event)
                .map(|(pattern, strength)| (ThreatType::SensitivePathAccess, pattern, strength))
        })
        .or_else(|| {
            detect_suspicious_user_agent(event)
                .map(|(pattern, strength)| (ThreatType::SuspiciousUserAgent, pattern, strength))
        });

    let (threat_type, matched_pattern, match_strength) = match hit {
        Some((tt, pattern, strength)) => (tt, Some(pattern), strength),
        None => (ThreatType::None, None, MatchStrength::Weak),
    };

    ThreatAnalysis {
        threat_type,
        severity: calculate_severity(threat_type, match_strength, blocked),
        match_strength,
        source_ip: event.client_ip.clone(),
        path: event.path.clone(),
        method: event.method.clone(),
        user_agent: event.user_agent.clone(),
        matched_pattern,
        blocked_by_firewall: blocked,
        timestamp: event.timestamp,
    }
}

/// Known scanner signatures are strong matches; a missing or implausibly
/// short user agent is only a weak one.
pub fn detect_suspicious_user_agent(event: &ParsedWafEvent) -> Option<(String, MatchStrength)> {
    match event.user_agent.as_deref() {
        None => Some(("missing-user-agent".to_string(), MatchStrength::Weak)),
        Some(ua) => {
            let trimmed = ua.trim();
            if trimmed.is_empty() {
                return Some(("empty-user-agent".to_string(), MatchStrength::Weak));
            }
            let lowered = trimmed.to_lowercase();
            for sig in SCANNER_AGENTS {
                if lowered.contains(sig) {
                    return Some((format!("user-agent:{}", sig), MatchStrength::Strong));
                }
            }
            if trimmed.len() < 4 {
                return Some(("malformed-user-agent".to_string(), MatchStrength::Weak));
            }
            None
        }
    }
}

pub fn detect_sensitive_path_access(event: &ParsedWafEvent) -> Option<(String, MatchStrength)> {
    let path = event.path.to_lowercase();
    for candidate in SENSITIVE_PATHS {
        if path.starts_with(candidate) {
            return Some((format!("path:{}", candidate), MatchStrength::Strong));
        }
        if path.contains(candidate) {
            return Some((format!("path:{}", candidate), MatchStrength::Weak));
        }
    }
    None
}

pub fn detect_attack_signatures(
    event: &ParsedWafEvent,
    signatures: &SignatureSet,
) -> Option<(String, MatchStrength)> {
    let mut haystack = String::new();
    haystack.push_str(&event.path);
    if let Some(query) = &event.query {
        haystack.push(' ');
        haystack.push_str(query);
    }
    for (_, value) in &event.headers {
        haystack.push(' ');
        haystack.push_str(value);
    }
    let lowered = haystack.to_lowercase();

    for sig in ATTACK_SIGNATURES {
        if lowered.contains(sig) {
            return Some((format!("signature:{}", sig), MatchStrength::Strong));
        }
    }
    for re in &signatures.extra {
        if re.is_match(&lowered) {
            return Some((format!("signature:{}", re.as_str()), MatchStrength::Strong));
        }
    }
    None
}

/// Maps a detector hit to the five-level scale. A request the firewall
/// already blocked lands one level lower than the same request passed
/// through unblocked; the unblocked one is the more urgent signal.
pub fn calculate_severity(
    threat_type: ThreatType,
    match_strength: MatchStrength,
    blocked_by_firewall: bool,
) -> Severity {
    let base = match (threat_type, match_strength) {
        (ThreatType::AttackSignature, MatchStrength::Strong) => Severity::High,
        (ThreatType::AttackSignature, MatchStrength::Weak) => Severity::Medium,
        (ThreatType::SensitivePathAccess, MatchStrength::Strong) => Severity::Medium,
        (ThreatType::SensitivePathAccess, MatchStrength::Weak) => Severity::Low,
        (ThreatType::SuspiciousUserAgent, MatchStrength::Strong) => Severity::Medium,
        (ThreatType::SuspiciousUserAgent, MatchStrength::Weak) => Severity::Low,
        (ThreatType::None, _) => Severity::Info,
    };
    if blocked_by_firewall {
        downgrade(base)
    } else {
        base
    }
}

fn downgrade(severity: Severity) -> Severity {
    match severity {
        Severity::Critical => Severity::High,
        Severity::High => Severity::Medium,
        Severity::Medium => Severity::Low,
        Severity::Low | Severity::Info => Severity::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::core::types::FirewallAction;

    fn event(path: &str, query: Option<&str>, ua: Option<&str>, action: FirewallAction) -> ParsedWafEvent {
        let mut headers = vec![("Host".to_string(), "app.example.com".to_string())];
        if let Some(ua) = ua {
            headers.push(("User-Agent".to_string(), ua.to_string()));
        }
        ParsedWafEvent {
            timestamp: Utc::now(),
            client_ip: "203.0.113.9".into(),
            country: Some("US".into()),
            method: "GET".into(),
            path: path.into(),
            query: query.map(str::to_string),
            http_version: "HTTP/1.1".into(),
            headers,
            user_agent: ua.map(str::to_string),
            action,
            web_acl: None,
            terminating_rule: None,
            rule_group_actions: vec![],
        }
    }

    #[test]
    fn scanner_user_agent_is_strong_match() {
        let e = event("/", None, Some("sqlmap/1.7"), FirewallAction::Allow);
        let hit = detect_suspicious_user_agent(&e).unwrap();
        assert_eq!(hit.1, MatchStrength::Strong);
    }

    #[test]
    fn missing_user_agent_is_weak_match() {
        let e = event("/", None, None, FirewallAction::Allow);
        let hit = detect_suspicious_user_agent(&e).unwrap();
        assert_eq!(hit.1, MatchStrength::Weak);
    }

    #[test]
    fn sensitive_path_flagged_regardless_of_action() {
        for action in [FirewallAction::Allow, FirewallAction::Block] {
            let e = event("/wp-admin/setup.php", None, Some("Mozilla/5.0"), action);
            assert!(detect_sensitive_path_access(&e).is_some());
        }
    }

    #[test]
    fn traversal_in_query_is_attack_signature() {
        let e = event(
            "/download",
            Some("file=../../etc/passwd"),
            Some("Mozilla/5.0"),
            FirewallAction::Allow,
        );
        let analysis = analyze(&e, &SignatureSet::default());
        assert_eq!(analysis.threat_type, ThreatType::AttackSignature);
        assert_eq!(analysis.severity, Severity::High);
    }

    #[test]
    fn blocked_request_is_capped_below_unblocked() {
        let allowed = analyze(
            &event("/", Some("q=union select 1"), Some("Mozilla/5.0"), FirewallAction::Allow),
            &SignatureSet::default(),
        );
        let blocked = analyze(
            &event("/", Some("q=union select 1"), Some("Mozilla/5.0"), FirewallAction::Block),
            &SignatureSet::default(),
        );
        assert!(blocked.severity < allowed.severity);
    }

    #[test]
    fn clean_request_is_none() {
        let e = event("/products", Some("page=2"), Some("Mozilla/5.0 (X11; Linux)"), FirewallAction::Allow);
        let analysis = analyze(&e, &SignatureSet::default());
        assert_eq!(analysis.threat_type, ThreatType::None);
        assert_eq!(analysis.severity, Severity::Info);
        assert!(!analysis.is_threat());
    }

    #[test]
    fn extra_configured_pattern_matches() {
        let set = SignatureSet::from_patterns(&["x-custom-exploit=[0-9]+".to_string()]).unwrap();
        let e = event("/", Some("x-custom-exploit=42"), Some("Mozilla/5.0"), FirewallAction::Allow);
        let analysis = analyze(&e, &set);
        assert_eq!(analysis.threat_type, ThreatType::AttackSignature);
    }
}
