use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;

use crate::cli::flags::{Cli, Command, OutputFormatArg};
use crate::config::{load_config, EngineConfig};
use crate::core::kv::MemoryStore;
use crate::core::store::Store;
use crate::core::time::now_utc;
use crate::core::types::{BlockResult, ScanFinding, WafAlert};
use crate::pipeline::alerter::{AlertEngine, AlertSource};
use crate::pipeline::blocker::AutoBlocker;
use crate::pipeline::campaign::CampaignDetector;
use crate::pipeline::classifier::{apply_update, classify};
use crate::pipeline::detector::{analyze, SignatureSet};
use crate::pipeline::parser::parse_batch;
use crate::pipeline::reporter::{
    format_extension, write_analysis_report, write_delta_report, AnalysisReport, OutputFormat,
};

pub async fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Reconcile {
            scan,
            org,
            account,
            format,
            output,
            dry_run,
        } => run_reconcile(
            &cli.db_path,
            &scan,
            &org,
            &account,
            resolve_format(format),
            &output,
            dry_run,
        ),
        Command::Analyze {
            log,
            webhook_url,
            format,
            output,
        } => {
            let mut cfg = cfg;
            if webhook_url.is_some() {
                cfg.alert.webhook_url = webhook_url;
            }
            run_analyze(&cli.db_path, &log, cfg, resolve_format(format), &output).await
        }
        Command::Sweep => run_sweep(&cli.db_path, &cfg),
        Command::Report {
            org,
            account,
            format,
            output,
        } => run_report(&cli.db_path, &org, &account, resolve_format(format), &output),
    }
}

fn resolve_format(arg: Option<OutputFormatArg>) -> OutputFormat {
    arg.map(OutputFormat::from).unwrap_or(OutputFormat::Json)
}

/// Output can be a file (has an extension) or a directory; directories get
/// a dated file name.
fn resolve_output_path(output: &Path, stem: &str, format: OutputFormat) -> PathBuf {
    if output.extension().is_some() {
        return output.to_path_buf();
    }
    output.join(format!(
        "{}-{}.{}",
        stem,
        now_utc().format("%Y%m%dT%H%M%SZ"),
        format_extension(format)
    ))
}

fn run_reconcile(
    db_path: &Path,
    scan_path: &Path,
    org: &str,
    account: &str,
    format: OutputFormat,
    output: &Path,
    dry_run: bool,
) -> Result<()> {
    let raw = fs::read_to_string(scan_path)
        .with_context(|| format!("reading scan file {}", scan_path.display()))?;
    let scan: Vec<ScanFinding> =
        serde_json::from_str(&raw).context("scan file must be a JSON array of findings")?;

    let mut store = Store::new(db_path)?;
    let existing = store.load_findings(org, account)?;
    let now = now_utc();
    let classification = classify(&scan, &existing, now);

    tracing::info!(
        "reconciled {}/{}: create={} update={} resolve={} unsuppress={}",
        org,
        account,
        classification.to_create.len(),
        classification.to_update.len(),
        classification.to_resolve.len(),
        classification.expired_suppressions.len()
    );

    if !dry_run {
        let mut mutations = classification.to_create.clone();
        for update in &classification.to_update {
            mutations.push(apply_update(update, now));
        }
        mutations.extend(classification.to_resolve.iter().cloned());

        // Unsuppression merges into the row already being written for that
        // fingerprint; a second row would win the INSERT OR REPLACE and
        // undo the lifecycle transition.
        let mut by_fingerprint: HashMap<String, usize> = mutations
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.fingerprint.clone(), idx))
            .collect();
        for finding in &classification.expired_suppressions {
            match by_fingerprint.get(&finding.fingerprint) {
                Some(&idx) => {
                    mutations[idx].suppressed = false;
                    mutations[idx].suppression_expires_at = None;
                }
                None => {
                    let mut next = finding.clone();
                    next.suppressed = false;
                    next.suppression_expires_at = None;
                    by_fingerprint.insert(next.fingerprint.clone(), mutations.len());
                    mutations.push(next);
                }
            }
        }
        store.upsert_findings(&mutations)?;
    }

    let path = resolve_output_path(output, "delta", format);
    write_delta_report(&classification, format, &path)?;
    tracing::info!("delta report written to {}", path.display());
    Ok(())
}

async fn run_analyze(
    db_path: &Path,
    log_path: &Path,
    cfg: EngineConfig,
    format: OutputFormat,
    output: &Path,
) -> Result<()> {
    let raw = fs::read_to_string(log_path)
        .with_context(|| format!("reading log file {}", log_path.display()))?;
    let outcome = parse_batch(raw.lines());
    if !outcome.failed.is_empty() {
        tracing::warn!("{} line(s) failed to parse", outcome.failed.len());
    }

    let signatures = SignatureSet::from_patterns(&cfg.detector.extra_signature_patterns)?;
    let kv = Arc::new(MemoryStore::new());
    let campaigns = CampaignDetector::new(kv.clone(), cfg.campaign.clone(), cfg.org_id.clone());
    let alerter = AlertEngine::new(kv, cfg.alert.clone(), cfg.org_id.clone());
    let client = reqwest::Client::new();

    let mut store = Store::new(db_path)?;
    let mut blocker = AutoBlocker::new(&mut store, cfg.block.clone());

    let mut analyses = Vec::with_capacity(outcome.parsed.len());
    let mut alerts: Vec<WafAlert> = Vec::new();
    let mut deliveries = Vec::new();
    let mut blocks: Vec<BlockResult> = Vec::new();

    for event in &outcome.parsed {
        let analysis = analyze(event, &signatures);
        let campaign = campaigns.detect_campaign(&analysis)?;

        {
            let mut sources: Vec<AlertSource> = Vec::new();
            if campaign.just_detected {
                sources.push(AlertSource::Campaign(&campaign));
            }
            if analysis.is_threat() && analysis.severity >= cfg.alert.min_severity_for_alert {
                sources.push(AlertSource::Threat(&analysis));
            }

            for source in &sources {
                let alert = alerter.create_alert(source);
                if alerter.should_send_alert(&alert)? {
                    deliveries.push(alerter.send_alert(&client, &alert).await);
                    alerts.push(alert);
                }
                if blocker.should_auto_block(source) {
                    let ttl = blocker.block_ttl();
                    let (ip, reason) = match source {
                        AlertSource::Campaign(c) => (
                            c.source_ip.clone(),
                            format!("campaign {} ({} events)", c.key, c.event_count),
                        ),
                        AlertSource::Threat(t) => {
                            (t.source_ip.clone(), format!("threat {:?}", t.threat_type))
                        }
                    };
                    blocks.push(blocker.block_ip(&ip, &reason, ttl)?);
                }
            }
        }

        analyses.push(analysis);
    }

    let report = AnalysisReport {
        generated_at: now_utc(),
        events_parsed: outcome.parsed.len(),
        parse_failures: outcome.failed,
        analyses,
        campaigns: campaigns.get_active_campaigns()?,
        alerts,
        deliveries,
        blocks,
    };

    tracing::info!(
        "analyzed {} event(s): threats={} campaigns={} alerts={} blocks={}",
        report.events_parsed,
        report.analyses.iter().filter(|a| a.is_threat()).count(),
        report.campaigns.len(),
        report.alerts.len(),
        report.blocks.len()
    );

    let path = resolve_output_path(output, "analysis", format);
    write_analysis_report(&report, format, &path)?;
    tracing::info!("analysis report written to {}", path.display());
    Ok(())
}

fn run_sweep(db_path: &Path, cfg: &EngineConfig) -> Result<()> {
    let mut store = Store::new(db_path)?;
    let mut blocker = AutoBlocker::new(&mut store, cfg.block.clone());
    let removed = blocker.unblock_expired_ips(now_utc())?;
    for record in &removed {
        tracing::info!("expired block on {} (was: {})", record.ip, record.reason);
    }
    println!("removed {} expired block(s)", removed.len());
    Ok(())
}

fn run_report(
    db_path: &Path,
    org: &str,
    account: &str,
    format: OutputFormat,
    output: &Path,
) -> Result<()> {
    let store = Store::new(db_path)?;
    let findings = store.load_findings(org, account)?;
    let now = now_utc();
    let active_blocks = store.active_blocks(now)?;

    let mut by_status: std::collections::BTreeMap<String, u64> = Default::default();
    for f in &findings {
        *by_status.entry(f.status.clone()).or_default() += 1;
    }
    let recent_resolved = findings
        .iter()
        .filter(|f| {
            f.resolved_at
                .map(|t| t > now - ChronoDuration::days(7))
                .unwrap_or(false)
        })
        .count();

    let summary = serde_json::json!({
        "generated_at": now.to_rfc3339(),
        "org_id": org,
        "account_id": account,
        "findings_total": findings.len(),
        "findings_by_status": by_status,
        "resolved_last_7d": recent_resolved,
        "active_blocks": active_blocks,
    });

    let path = resolve_output_path(output, "report", format);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match format {
        OutputFormat::Json | OutputFormat::Jsonl => {
            fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
        }
        OutputFormat::Markdown => {
            let mut out = String::new();
            out.push_str("# Findings Summary\n\n");
            out.push_str(&format!("Scope: {}/{}\n\n", org, account));
            out.push_str(&format!("- Total findings: {}\n", findings.len()));
            for (status, count) in &by_status {
                out.push_str(&format!("- {}: {}\n", status, count));
            }
            out.push_str(&format!("- Resolved in last 7 days: {}\n", recent_resolved));
            out.push_str(&format!("- Active IP blocks: {}\n", active_blocks.len()));
            if !active_blocks.is_empty() {
                out.push('\n');
                out.push_str("## Active blocks\n");
                for b in &active_blocks {
                    out.push_str(&format!(
                        "- {} until {} ({})\n",
                        b.ip,
                        b.expires_at.to_rfc3339(),
                        b.reason
                    ));
                }
            }
            fs::write(&path, out)?;
        }
    }
    tracing::info!("report written to {}", path.display());
    Ok(())
}
