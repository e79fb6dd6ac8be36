use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;
use crate::core::types::{FirewallAction, ParsedWafEvent, RuleGroupAction};

/// Wire shape of one firewall log record (AWS WAF JSON). Kept separate
/// from the domain type so field renames stay in one place.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWafLog {
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    webacl_id: Option<String>,
    action: FirewallAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    terminating_rule_id: Option<String>,
    http_request: RawHttpRequest,
    #[serde(default)]
    rule_group_list: Vec<RawRuleGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHttpRequest {
    client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<String>,
    http_version: String,
    http_method: String,
    #[serde(default)]
    headers: Vec<RawHeader>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRuleGroup {
    rule_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    terminating_rule: Option<RawTerminatingRule>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTerminatingRule {
    rule_id: String,
    action: String,
}

/// One unparseable line out of a batch. Scoped to the item; the batch
/// always continues.
#[derive(Debug, Clone, Serialize)]
pub struct ParseFailure {
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub parsed: Vec<ParsedWafEvent>,
    pub failed: Vec<ParseFailure>,
}

/// Cheap structural pre-check, usable before a full parse.
pub fn is_valid_log(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.starts_with('{')
        && trimmed.ends_with('}')
        && trimmed.contains("\"httpRequest\"")
        && trimmed.contains("\"timestamp\"")
}

pub fn parse(raw: &str) -> Result<ParsedWafEvent, EngineError> {
    let log: RawWafLog =
        serde_json::from_str(raw).map_err(|e| EngineError::Parse(e.to_string()))?;

    if log.http_request.client_ip.trim().is_empty() {
        return Err(EngineError::Parse("missing clientIp".into()));
    }
    let timestamp = Utc
        .timestamp_millis_opt(log.timestamp)
        .single()
        .ok_or_else(|| EngineError::Parse(format!("invalid timestamp {}", log.timestamp)))?;

    let headers: Vec<(String, String)> = log
        .http_request
        .headers
        .iter()
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect();
    let user_agent = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
        .map(|(_, value)| value.clone());

    let rule_group_actions = log
        .rule_group_list
        .iter()
        .filter_map(|g| {
            g.terminating_rule.as_ref().map(|r| RuleGroupAction {
                rule_group: g.rule_group_id.clone(),
                action: r.action.clone(),
                terminating_rule: Some(r.rule_id.clone()),
            })
        })
        .collect();

    Ok(ParsedWafEvent {
        timestamp,
        client_ip: log.http_request.client_ip,
        country: log.http_request.country,
        method: log.http_request.http_method,
        path: log.http_request.uri,
        query: log.http_request.args.filter(|a| !a.is_empty()),
        http_version: log.http_request.http_version,
        headers,
        user_agent,
        action: log.action,
        web_acl: log.webacl_id,
        terminating_rule: log.terminating_rule_id,
        rule_group_actions,
    })
}

/// Each line fails independently; one malformed record never aborts the
/// rest of the batch. Blank lines are skipped.
pub fn parse_batch<'a>(lines: impl IntoIterator<Item = &'a str>) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    for (idx, line) in lines.into_iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse(line) {
            Ok(event) => outcome.parsed.push(event),
            Err(err) => outcome.failed.push(ParseFailure {
                line: idx + 1,
                error: err.to_string(),
            }),
        }
    }
    outcome
}

/// Inverse of `parse`, used for storage round-tripping. Field order and
/// whitespace are normalized; `parse(serialize(parse(x)))` equals
/// `parse(x)` for every valid input.
pub fn serialize(event: &ParsedWafEvent) -> Result<String, EngineError> {
    let raw = RawWafLog {
        timestamp: event.timestamp.timestamp_millis(),
        format_version: None,
        webacl_id: event.web_acl.clone(),
        action: event.action,
        terminating_rule_id: event.terminating_rule.clone(),
        http_request: RawHttpRequest {
            client_ip: event.client_ip.clone(),
            country: event.country.clone(),
            uri: event.path.clone(),
            args: event.query.clone(),
            http_version: event.http_version.clone(),
            http_method: event.method.clone(),
            headers: event
                .headers
                .iter()
                .map(|(name, value)| RawHeader {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        },
        rule_group_list: event
            .rule_group_actions
            .iter()
            .map(|r| RawRuleGroup {
                rule_group_id: r.rule_group.clone(),
                terminating_rule: Some(RawTerminatingRule {
                    rule_id: r.terminating_rule.clone().unwrap_or_default(),
                    action: r.action.clone(),
                }),
            })
            .collect(),
    };
    serde_json::to_string(&raw).map_err(|e| EngineError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_line() -> String {
        serde_json::json!({
            "timestamp": 1700000000000_i64,
            "formatVersion": 1,
            "webaclId": "arn:aws:wafv2:us-east-1:123:regional/webacl/app/abc",
            "action": "ALLOW",
            "terminatingRuleId": "Default_Action",
            "httpRequest": {
                "clientIp": "198.51.100.7",
                "country": "US",
                "uri": "/wp-admin/setup.php",
                "args": "step=1",
                "httpVersion": "HTTP/1.1",
                "httpMethod": "GET",
                "headers": [
                    {"name": "Host", "value": "app.example.com"},
                    {"name": "User-Agent", "value": "sqlmap/1.7"}
                ]
            },
            "ruleGroupList": [
                {
                    "ruleGroupId": "AWS#AWSManagedRulesCommonRuleSet",
                    "terminatingRule": {"ruleId": "NoUserAgent_HEADER", "action": "COUNT"}
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn parses_canonical_fields() {
        let event = parse(&sample_line()).unwrap();
        assert_eq!(event.client_ip, "198.51.100.7");
        assert_eq!(event.method, "GET");
        assert_eq!(event.path, "/wp-admin/setup.php");
        assert_eq!(event.query.as_deref(), Some("step=1"));
        assert_eq!(event.user_agent.as_deref(), Some("sqlmap/1.7"));
        assert_eq!(event.action, FirewallAction::Allow);
        assert_eq!(event.rule_group_actions.len(), 1);
        assert_eq!(event.timestamp.timestamp_millis(), 1700000000000);
    }

    #[test]
    fn round_trip_is_stable() {
        let first = parse(&sample_line()).unwrap();
        let reparsed = parse(&serialize(&first).unwrap()).unwrap();
        assert_eq!(first, reparsed);
    }

    #[test]
    fn batch_isolates_bad_lines() {
        let good = sample_line();
        let lines = [good.as_str(), "not json", "", "{\"timestamp\": true}"];
        let outcome = parse_batch(lines);
        assert_eq!(outcome.parsed.len(), 1);
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(outcome.failed[0].line, 2);
        assert_eq!(outcome.failed[1].line, 4);
    }

    #[test]
    fn missing_client_ip_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&sample_line()).unwrap();
        value["httpRequest"]["clientIp"] = serde_json::json!("");
        assert!(parse(&value.to_string()).is_err());
    }

    #[test]
    fn is_valid_log_screens_garbage() {
        assert!(is_valid_log(&sample_line()));
        assert!(!is_valid_log("GET /index.html 200"));
        assert!(!is_valid_log("{\"timestamp\": 1}"));
    }
}
