use sha2::{Digest, Sha256};

use crate::core::types::ScanFinding;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable identity hash for a finding. Two findings are the same iff this
/// matches exactly; there is no fuzzy matching anywhere downstream.
pub fn fingerprint(resource_arn: &str, scan_type: &str, title: &str) -> String {
    let payload = format!("{}|{}|{}", resource_arn, scan_type, title);
    sha256_hex(payload.as_bytes())
}

/// Variant for resources that never get an ARN (some scan providers only
/// return an opaque resource id).
pub fn fallback_fingerprint(scan_type: &str, title: &str, resource_id: &str) -> String {
    let payload = format!("{}|{}|{}", scan_type, title, resource_id);
    sha256_hex(payload.as_bytes())
}

/// Picks the right variant for a scan finding. Missing fields degrade to
/// the empty string rather than failing.
pub fn fingerprint_for(finding: &ScanFinding) -> String {
    match finding.resource_arn.as_deref() {
        Some(arn) if !arn.is_empty() => fingerprint(arn, &finding.scan_type, &finding.title),
        _ => fallback_fingerprint(&finding.scan_type, &finding.title, &finding.resource_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint("arn:aws:ec2:us-east-1:123:instance/i-1", "ec2", "open ssh port");
        let b = fingerprint("arn:aws:ec2:us-east-1:123:instance/i-1", "ec2", "open ssh port");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_is_lowercase_hex64() {
        let fp = fingerprint("arn", "scan", "title");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn any_field_change_changes_the_hash() {
        let base = fingerprint("arn", "ec2", "title");
        assert_ne!(base, fingerprint("arn2", "ec2", "title"));
        assert_ne!(base, fingerprint("arn", "sqs", "title"));
        assert_ne!(base, fingerprint("arn", "ec2", "other"));
    }

    #[test]
    fn missing_fields_degrade_to_empty_string() {
        assert_eq!(fingerprint("", "", ""), sha256_hex(b"||"));
    }

    #[test]
    fn fallback_used_when_arn_absent() {
        let finding = ScanFinding {
            org_id: "org".into(),
            account_id: "acct".into(),
            scan_type: "sqs".into(),
            title: "queue unencrypted".into(),
            severity: crate::core::types::Severity::Medium,
            resource_arn: None,
            resource_id: "q-1".into(),
            evidence: serde_json::Value::Null,
        };
        assert_eq!(
            fingerprint_for(&finding),
            fallback_fingerprint("sqs", "queue unencrypted", "q-1")
        );
    }
}
