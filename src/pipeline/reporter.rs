use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{
    AlertDeliveryResult, BlockResult, CampaignState, Classification, ThreatAnalysis, WafAlert,
};
use crate::pipeline::parser::ParseFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Markdown,
}

pub fn format_extension(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Json => "json",
        OutputFormat::Jsonl => "jsonl",
        OutputFormat::Markdown => "md",
    }
}

/// Everything one `analyze` run produced, bundled for output.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub events_parsed: usize,
    pub parse_failures: Vec<ParseFailure>,
    pub analyses: Vec<ThreatAnalysis>,
    pub campaigns: Vec<CampaignState>,
    pub alerts: Vec<WafAlert>,
    pub deliveries: Vec<AlertDeliveryResult>,
    pub blocks: Vec<BlockResult>,
}

pub fn write_delta_report(
    classification: &Classification,
    format: OutputFormat,
    path: &Path,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(classification)?;
            fs::write(path, json)?;
        }
        OutputFormat::Jsonl => {
            let mut out = String::new();
            for f in &classification.to_create {
                push_jsonl_record(&mut out, "create", f)?;
            }
            for u in &classification.to_update {
                push_jsonl_record(&mut out, "update", u)?;
            }
            for f in &classification.to_resolve {
                push_jsonl_record(&mut out, "resolve", f)?;
            }
            for f in &classification.expired_suppressions {
                push_jsonl_record(&mut out, "unsuppress", f)?;
            }
            fs::write(path, out)?;
        }
        OutputFormat::Markdown => {
            fs::write(path, delta_markdown(classification))?;
        }
    }
    Ok(())
}

fn push_jsonl_record<T: Serialize>(out: &mut String, action: &str, payload: &T) -> Result<()> {
    let record = serde_json::json!({ "action": action, "record": payload });
    out.push_str(&serde_json::to_string(&record)?);
    out.push('\n');
    Ok(())
}

fn delta_markdown(classification: &Classification) -> String {
    let mut out = String::new();
    out.push_str("# Finding Reconciliation\n\n");
    out.push_str(&format!("Generated: {}\n\n", Utc::now().to_rfc3339()));
    out.push_str(&format!(
        "- Created: {}\n- Updated: {}\n- Resolved: {}\n- Suppressions expired: {}\n\n",
        classification.to_create.len(),
        classification.to_update.len(),
        classification.to_resolve.len(),
        classification.expired_suppressions.len()
    ));

    if !classification.to_create.is_empty() {
        out.push_str("## New findings\n");
        for f in &classification.to_create {
            out.push_str(&format!(
                "- `{}` {:?} {} ({})\n",
                &f.fingerprint[..12.min(f.fingerprint.len())],
                f.severity,
                f.title,
                f.resource_id
            ));
        }
        out.push('\n');
    }
    if !classification.to_resolve.is_empty() {
        out.push_str("## Resolved findings\n");
        for f in &classification.to_resolve {
            out.push_str(&format!(
                "- `{}` {}\n",
                &f.fingerprint[..12.min(f.fingerprint.len())],
                f.title
            ));
        }
        out.push('\n');
    }
    out
}

pub fn write_analysis_report(report: &AnalysisReport, format: OutputFormat, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(report)?;
            fs::write(path, json)?;
        }
        OutputFormat::Jsonl => {
            let mut out = String::new();
            for a in &report.analyses {
                push_jsonl_record(&mut out, "analysis", a)?;
            }
            for c in &report.campaigns {
                push_jsonl_record(&mut out, "campaign", c)?;
            }
            for alert in &report.alerts {
                push_jsonl_record(&mut out, "alert", alert)?;
            }
            for b in &report.blocks {
                push_jsonl_record(&mut out, "block", b)?;
            }
            fs::write(path, out)?;
        }
        OutputFormat::Markdown => {
            fs::write(path, analysis_markdown(report))?;
        }
    }
    Ok(())
}

fn analysis_markdown(report: &AnalysisReport) -> String {
    let mut out = String::new();
    out.push_str("# WAF Analysis\n\n");
    out.push_str(&format!("Generated: {}\n\n", report.generated_at.to_rfc3339()));
    let threats = report.analyses.iter().filter(|a| a.is_threat()).count();
    out.push_str(&format!(
        "- Events parsed: {}\n- Parse failures: {}\n- Threats: {}\n- Active campaigns: {}\n- Alerts raised: {}\n- Blocks applied: {}\n\n",
        report.events_parsed,
        report.parse_failures.len(),
        threats,
        report.campaigns.len(),
        report.alerts.len(),
        report.blocks.len()
    ));

    if !report.campaigns.is_empty() {
        out.push_str("## Campaigns\n");
        for c in &report.campaigns {
            out.push_str(&format!(
                "- {} | events={} paths={} severity={:?}\n",
                c.source_ip,
                c.event_count,
                c.distinct_paths.len(),
                c.severity
            ));
        }
        out.push('\n');
    }
    if !report.alerts.is_empty() {
        out.push_str("## Alerts\n");
        for alert in &report.alerts {
            out.push_str(&format!("- [{:?}] {}\n", alert.severity, alert.title));
        }
        out.push('\n');
    }
    if !report.blocks.is_empty() {
        out.push_str("## Blocks\n");
        for b in &report.blocks {
            out.push_str(&format!(
                "- {} until {} ({})\n",
                b.ip,
                b.expires_at.to_rfc3339(),
                if b.created { "new" } else { "extended" }
            ));
        }
        out.push('\n');
    }
    if !report.parse_failures.is_empty() {
        out.push_str("## Parse failures\n");
        for f in &report.parse_failures {
            out.push_str(&format!("- line {}: {}\n", f.line, f.error));
        }
        out.push('\n');
    }
    out
}
