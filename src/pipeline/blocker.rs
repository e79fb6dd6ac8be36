use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::BlockConfig;
use crate::core::store::Store;
use crate::core::time::now_utc;
use crate::core::types::{BlockRecord, BlockResult};
use crate::pipeline::alerter::AlertSource;

/// Time-bounded denial of traffic from an attacking IP. The policy
/// deliberately keys on campaign-level severity: one event, however ugly,
/// is never enough to block, because isolated false positives are routine
/// in WAF traffic.
pub struct AutoBlocker<'a> {
    store: &'a mut Store,
    cfg: BlockConfig,
}

impl<'a> AutoBlocker<'a> {
    pub fn new(store: &'a mut Store, cfg: BlockConfig) -> Self {
        Self { store, cfg }
    }

    pub fn block_ttl(&self) -> Duration {
        Duration::from_millis(self.cfg.block_ttl_ms)
    }

    /// Policy decision only; no side effects.
    pub fn should_auto_block(&self, source: &AlertSource) -> bool {
        match source {
            AlertSource::Campaign(result) => {
                result.active && result.severity >= self.cfg.min_severity_for_block
            }
            AlertSource::Threat(analysis) => {
                self.cfg.block_on_single_event
                    && analysis.severity >= self.cfg.min_severity_for_block
            }
        }
    }

    /// Creates or refreshes the block record for an IP. Refreshing keeps
    /// exactly one record and never shortens an existing expiry.
    pub fn block_ip(&mut self, ip: &str, reason: &str, ttl: Duration) -> Result<BlockResult> {
        let now = now_utc();
        let requested_expiry = now
            + chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64);

        let existing = self.store.get_block(ip)?;
        let active_existing = existing.filter(|r| r.expires_at > now);

        let record = match &active_existing {
            Some(current) => BlockRecord {
                ip: ip.to_string(),
                reason: reason.to_string(),
                blocked_at: current.blocked_at,
                expires_at: current.expires_at.max(requested_expiry),
            },
            None => BlockRecord {
                ip: ip.to_string(),
                reason: reason.to_string(),
                blocked_at: now,
                expires_at: requested_expiry,
            },
        };
        self.store.upsert_block(&record)?;

        let created = active_existing.is_none();
        if created {
            tracing::info!("blocked {} until {}: {}", ip, record.expires_at, reason);
        } else {
            tracing::debug!("extended block on {} until {}", ip, record.expires_at);
        }
        Ok(BlockResult {
            ip: ip.to_string(),
            expires_at: record.expires_at,
            created,
            extended: !created,
        })
    }

    /// Manual override; removes the record immediately.
    pub fn unblock_ip(&mut self, ip: &str) -> Result<bool> {
        let removed = self.store.delete_block(ip)?;
        if removed {
            tracing::info!("unblocked {}", ip);
        }
        Ok(removed)
    }

    /// Idempotent sweep of records past their expiry. Safe to run
    /// redundantly or concurrently with `block_ip`: the delete is guarded
    /// on `expires_at`, so a just-refreshed record survives.
    pub fn unblock_expired_ips(&mut self, now: DateTime<Utc>) -> Result<Vec<BlockRecord>> {
        let candidates = self.store.expired_blocks(now)?;
        let mut removed = Vec::new();
        for record in candidates {
            if self.store.delete_block_if_expired(&record.ip, now)? {
                removed.push(record);
            }
        }
        if !removed.is_empty() {
            tracing::info!("expired {} block(s)", removed.len());
        }
        Ok(removed)
    }
}
