use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::core::fingerprint::fingerprint_for;
use crate::core::types::{
    Classification, Finding, FindingStatus, FindingUpdate, ScanFinding,
};

/// Maps a stored status string onto the lifecycle state machine. Legacy
/// values (`open`, `pending`, arbitrary casing or whitespace) collapse to
/// `active`; they are pre-existing data, not a fifth state.
pub fn normalize_status(raw: &str) -> FindingStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "new" => FindingStatus::New,
        "resolved" => FindingStatus::Resolved,
        "reopened" => FindingStatus::Reopened,
        _ => FindingStatus::Active,
    }
}

/// Transition table for one reconciliation pass.
pub fn next_status(current: FindingStatus, present_in_scan: bool) -> FindingStatus {
    match (current, present_in_scan) {
        (FindingStatus::New, true) => FindingStatus::Active,
        (FindingStatus::Active, true) => FindingStatus::Active,
        (FindingStatus::Resolved, true) => FindingStatus::Reopened,
        (FindingStatus::Reopened, true) => FindingStatus::Active,
        (_, false) => FindingStatus::Resolved,
    }
}

/// Partitions a scan's findings against the stored set for the same
/// org+account scope. Single pass, O(N+M) with hash-map lookups.
///
/// The caller must serialize reconciliation per org+account: this function
/// assumes `existing` is a consistent snapshot and two concurrent scans
/// over the same scope could otherwise double-create a fingerprint.
pub fn classify(
    new_findings: &[ScanFinding],
    existing: &[Finding],
    now: DateTime<Utc>,
) -> Classification {
    let by_fingerprint: HashMap<&str, &Finding> = existing
        .iter()
        .map(|f| (f.fingerprint.as_str(), f))
        .collect();

    let mut out = Classification::default();
    let mut seen_in_scan: HashSet<String> = HashSet::new();

    for incoming in new_findings {
        let fp = fingerprint_for(incoming);
        // A scan may report the same issue twice (e.g. two evidence rows
        // for one resource); only the first occurrence counts.
        if !seen_in_scan.insert(fp.clone()) {
            continue;
        }
        match by_fingerprint.get(fp.as_str()) {
            Some(found) => {
                let current = normalize_status(&found.status);
                out.to_update.push(FindingUpdate {
                    existing: (*found).clone(),
                    incoming: incoming.clone(),
                    next_status: next_status(current, true),
                });
            }
            None => {
                out.to_create.push(materialize(incoming, &fp, now));
            }
        }
    }

    for found in existing {
        if !seen_in_scan.contains(&found.fingerprint) {
            let current = normalize_status(&found.status);
            if matches!(
                current,
                FindingStatus::New | FindingStatus::Active | FindingStatus::Reopened
            ) {
                let mut resolved = found.clone();
                resolved.status = FindingStatus::Resolved.as_str().to_string();
                resolved.resolved_at = Some(now);
                out.to_resolve.push(resolved);
            }
        }

        // Suppression expiry is independent of scan presence.
        if found.suppressed {
            if let Some(expires) = found.suppression_expires_at {
                if expires <= now {
                    out.expired_suppressions.push(found.clone());
                }
            }
        }
    }

    debug_assert!(partition_is_disjoint(&out));
    out
}

/// Applies one update pair, producing the persisted next state.
pub fn apply_update(update: &FindingUpdate, now: DateTime<Utc>) -> Finding {
    let mut next = update.existing.clone();
    next.status = update.next_status.as_str().to_string();
    next.last_seen = now;
    next.occurrence_count = next.occurrence_count.saturating_add(1);
    next.severity = update.incoming.severity;
    next.evidence = update.incoming.evidence.clone();
    if update.next_status != FindingStatus::Resolved {
        next.resolved_at = None;
    }
    next
}

fn materialize(incoming: &ScanFinding, fingerprint: &str, now: DateTime<Utc>) -> Finding {
    Finding {
        fingerprint: fingerprint.to_string(),
        org_id: incoming.org_id.clone(),
        account_id: incoming.account_id.clone(),
        scan_type: incoming.scan_type.clone(),
        title: incoming.title.clone(),
        severity: incoming.severity,
        resource_arn: incoming.resource_arn.clone(),
        resource_id: incoming.resource_id.clone(),
        status: FindingStatus::New.as_str().to_string(),
        first_seen: now,
        last_seen: now,
        resolved_at: None,
        occurrence_count: 1,
        suppressed: false,
        suppression_expires_at: None,
        evidence: incoming.evidence.clone(),
    }
}

fn partition_is_disjoint(out: &Classification) -> bool {
    let created: HashSet<&str> = out.to_create.iter().map(|f| f.fingerprint.as_str()).collect();
    let updated: HashSet<&str> = out
        .to_update
        .iter()
        .map(|u| u.existing.fingerprint.as_str())
        .collect();
    let resolved: HashSet<&str> = out.to_resolve.iter().map(|f| f.fingerprint.as_str()).collect();
    created.is_disjoint(&updated) && created.is_disjoint(&resolved) && updated.is_disjoint(&resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_exact() {
        use FindingStatus::*;
        let cases = [
            (New, true, Active),
            (Active, true, Active),
            (Resolved, true, Reopened),
            (Reopened, true, Active),
            (New, false, Resolved),
            (Active, false, Resolved),
            (Reopened, false, Resolved),
            (Resolved, false, Resolved),
        ];
        for (current, present, expected) in cases {
            assert_eq!(next_status(current, present), expected);
        }
    }

    #[test]
    fn legacy_statuses_normalize_to_active() {
        assert_eq!(normalize_status("open"), FindingStatus::Active);
        assert_eq!(normalize_status("pending"), FindingStatus::Active);
        assert_eq!(normalize_status("  Active "), FindingStatus::Active);
        assert_eq!(normalize_status("RESOLVED"), FindingStatus::Resolved);
        assert_eq!(normalize_status("New"), FindingStatus::New);
        assert_eq!(normalize_status("???"), FindingStatus::Active);
    }

    #[test]
    fn legacy_open_present_in_scan_stays_active() {
        // open -> (normalize) active -> active, not reopened
        assert_eq!(
            next_status(normalize_status("open"), true),
            FindingStatus::Active
        );
    }
}
