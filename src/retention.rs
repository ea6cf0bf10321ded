// src/retention.rs
//! Tiered retention: HOT -> WARM -> COLD -> PURGED. The sweep runs on its own
//! cadence over already-persisted data, behind the `AggregateStore` trait, and
//! never holds anything the ingest path needs. Every transition appends the
//! coarser representation before deleting the finer one, so an interrupted
//! sweep loses nothing and a re-run is a no-op.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::flow::Flow;
use crate::hotspot::{bucket_start_for, Hotspot, ThemeSummary};
use crate::normalize::Signal;

/// Age boundaries and coalescing knobs, validated at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub hot_days: i64,
    pub warm_days: i64,
    pub cold_days: i64,
    /// Raised heat floor for flows surviving into the cold tier.
    pub cold_heat_floor: f64,
    /// Theme cap per coalesced snapshot.
    pub snapshot_top_themes: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            hot_days: 30,
            warm_days: 90,
            cold_days: 365,
            cold_heat_floor: 0.7,
            snapshot_top_themes: 10,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(0 < self.hot_days && self.hot_days < self.warm_days && self.warm_days < self.cold_days)
        {
            return Err(anyhow!(
                "retention horizons must satisfy 0 < hot < warm < cold, got {}/{}/{}",
                self.hot_days,
                self.warm_days,
                self.cold_days
            ));
        }
        if !(0.0..=1.0).contains(&self.cold_heat_floor) {
            return Err(anyhow!(
                "cold_heat_floor must be in [0, 1], got {}",
                self.cold_heat_floor
            ));
        }
        if self.snapshot_top_themes == 0 {
            return Err(anyhow!("snapshot_top_themes must be > 0"));
        }
        Ok(())
    }
}

/// Retention stage of a time-bucketed aggregate. `Purged` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
    Purged,
}

impl Tier {
    /// Which tier a record of the given age belongs to.
    pub fn for_age_days(age_days: i64, policy: &RetentionPolicy) -> Tier {
        if age_days < policy.hot_days {
            Tier::Hot
        } else if age_days < policy.warm_days {
            Tier::Warm
        } else if age_days < policy.cold_days {
            Tier::Cold
        } else {
            Tier::Purged
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    fn bucket_secs(&self) -> u64 {
        match self {
            Granularity::Hourly => 3_600,
            Granularity::Daily => 86_400,
        }
    }
}

/// A coalesced (country, bucket) rollup: summed counts, count-weighted
/// average sentiment, themes capped to a fixed top-N.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSnapshot {
    pub country_code: String,
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub signal_count: u64,
    pub total_theme_count: u64,
    pub avg_sentiment: f64,
    pub top_themes: Vec<ThemeSummary>,
    /// Rows flagged by the owning service live outside the purge horizon.
    pub keep_forever: bool,
}

/// Persistence boundary for the sweep. Implementations must honor the
/// `keep_forever` flag in `delete_snapshots_before` and key snapshot upserts
/// by (country, bucket_start, granularity) so re-running a sweep replaces
/// rather than duplicates.
pub trait AggregateStore {
    fn hotspots_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Hotspot>>;
    fn delete_hotspots_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn count_signals_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
    fn delete_signals_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn snapshots_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TopicSnapshot>>;
    fn upsert_snapshots(&mut self, snapshots: &[TopicSnapshot]) -> Result<()>;
    fn delete_snapshots_before(
        &mut self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<usize>;

    fn flows_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Flow>>;
    fn delete_flows_before_below(&mut self, cutoff: DateTime<Utc>, heat_floor: f64)
        -> Result<usize>;
    fn delete_flows_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// What one sweep did (or, in dry-run mode, would do).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub hotspots_coalesced: usize,
    pub hourly_snapshots_written: usize,
    pub signals_deleted: usize,
    pub hourly_coalesced: usize,
    pub daily_snapshots_written: usize,
    pub flows_pruned: usize,
    pub snapshots_purged: usize,
    pub flows_purged: usize,
    pub dry_run: bool,
}

pub struct RetentionManager {
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(policy: RetentionPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    /// Run one sweep at `now`. Idempotent: re-running against an already
    /// swept store changes nothing. With `dry_run` the store is only read.
    pub fn sweep(
        &self,
        store: &mut dyn AggregateStore,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<SweepReport> {
        let mut report = SweepReport {
            dry_run,
            ..Default::default()
        };
        let warm_cutoff = now - Duration::days(self.policy.hot_days);
        let cold_cutoff = now - Duration::days(self.policy.warm_days);
        let purge_cutoff = now - Duration::days(self.policy.cold_days);

        // HOT -> WARM: hotspots coalesce to hourly snapshots; raw signals are
        // hot-tier only and simply age out.
        let aged_hotspots = store.hotspots_before(warm_cutoff)?;
        let hourly = self.coalesce_hotspots(&aged_hotspots);
        report.hotspots_coalesced = aged_hotspots.len();
        report.hourly_snapshots_written = hourly.len();
        if dry_run {
            report.signals_deleted = store.count_signals_before(warm_cutoff)?;
        } else {
            store.upsert_snapshots(&hourly)?;
            store.delete_hotspots_before(warm_cutoff)?;
            report.signals_deleted = store.delete_signals_before(warm_cutoff)?;
        }

        // WARM -> COLD: hourly coalesces to daily; only hot flows survive.
        let aged_hourly = store.snapshots_before(Granularity::Hourly, cold_cutoff)?;
        let daily = self.coalesce_snapshots(&aged_hourly, Granularity::Daily);
        report.hourly_coalesced = aged_hourly.len();
        report.daily_snapshots_written = daily.len();
        if dry_run {
            report.flows_pruned = store
                .flows_before(cold_cutoff)?
                .iter()
                .filter(|f| f.heat < self.policy.cold_heat_floor)
                .count();
        } else {
            store.upsert_snapshots(&daily)?;
            store.delete_snapshots_before(Granularity::Hourly, cold_cutoff)?;
            report.flows_pruned =
                store.delete_flows_before_below(cold_cutoff, self.policy.cold_heat_floor)?;
        }

        // COLD -> PURGED, except keep-forever rollups.
        if dry_run {
            report.snapshots_purged = store
                .snapshots_before(Granularity::Daily, purge_cutoff)?
                .iter()
                .filter(|s| !s.keep_forever)
                .count();
            report.flows_purged = store.flows_before(purge_cutoff)?.len();
        } else {
            report.snapshots_purged =
                store.delete_snapshots_before(Granularity::Daily, purge_cutoff)?;
            report.flows_purged = store.delete_flows_before(purge_cutoff)?;
        }

        info!(
            dry_run,
            hotspots_coalesced = report.hotspots_coalesced,
            hourly_written = report.hourly_snapshots_written,
            daily_written = report.daily_snapshots_written,
            flows_pruned = report.flows_pruned,
            purged = report.snapshots_purged + report.flows_purged,
            "retention sweep complete"
        );
        Ok(report)
    }

    /// Coalesce aged hotspots into hourly snapshots.
    fn coalesce_hotspots(&self, hotspots: &[Hotspot]) -> Vec<TopicSnapshot> {
        let mut groups: BTreeMap<(String, DateTime<Utc>), Vec<&Hotspot>> = BTreeMap::new();
        for h in hotspots {
            let bucket = bucket_start_for(h.bucket_start, Granularity::Hourly.bucket_secs());
            groups
                .entry((h.country_code.clone(), bucket))
                .or_default()
                .push(h);
        }

        groups
            .into_iter()
            .map(|((country_code, bucket_start), group)| {
                let signal_count: u64 = group.iter().map(|h| h.signal_count as u64).sum();
                let total_theme_count: u64 = group.iter().map(|h| h.total_topic_count).sum();
                let weighted: f64 = group
                    .iter()
                    .map(|h| h.avg_sentiment * h.signal_count as f64)
                    .sum();
                let avg_sentiment = if signal_count > 0 {
                    weighted / signal_count as f64
                } else {
                    0.0
                };
                let top_themes = merge_themes(
                    group.iter().flat_map(|h| h.top_themes.iter()),
                    self.policy.snapshot_top_themes,
                );
                TopicSnapshot {
                    country_code,
                    bucket_start,
                    granularity: Granularity::Hourly,
                    signal_count,
                    total_theme_count,
                    avg_sentiment,
                    top_themes,
                    keep_forever: false,
                }
            })
            .collect()
    }

    /// Coalesce finer snapshots into the next granularity.
    fn coalesce_snapshots(
        &self,
        snapshots: &[TopicSnapshot],
        target: Granularity,
    ) -> Vec<TopicSnapshot> {
        let mut groups: BTreeMap<(String, DateTime<Utc>), Vec<&TopicSnapshot>> = BTreeMap::new();
        for s in snapshots {
            let bucket = bucket_start_for(s.bucket_start, target.bucket_secs());
            groups
                .entry((s.country_code.clone(), bucket))
                .or_default()
                .push(s);
        }

        groups
            .into_iter()
            .map(|((country_code, bucket_start), group)| {
                let signal_count: u64 = group.iter().map(|s| s.signal_count).sum();
                let total_theme_count: u64 = group.iter().map(|s| s.total_theme_count).sum();
                let weighted: f64 = group
                    .iter()
                    .map(|s| s.avg_sentiment * s.signal_count as f64)
                    .sum();
                let avg_sentiment = if signal_count > 0 {
                    weighted / signal_count as f64
                } else {
                    0.0
                };
                let top_themes = merge_themes(
                    group.iter().flat_map(|s| s.top_themes.iter()),
                    self.policy.snapshot_top_themes,
                );
                TopicSnapshot {
                    country_code,
                    bucket_start,
                    granularity: target,
                    signal_count,
                    total_theme_count,
                    avg_sentiment,
                    top_themes,
                    keep_forever: group.iter().any(|s| s.keep_forever),
                }
            })
            .collect()
    }
}

/// Union theme summaries, summing counts and count-weighting sentiment,
/// capped to the top N by count.
fn merge_themes<'a>(
    themes: impl Iterator<Item = &'a ThemeSummary>,
    cap: usize,
) -> Vec<ThemeSummary> {
    let mut counts: BTreeMap<String, (u64, f64)> = BTreeMap::new();
    for t in themes {
        let entry = counts.entry(t.label.clone()).or_insert((0, 0.0));
        entry.0 += t.count;
        entry.1 += t.sentiment * t.count as f64;
    }
    let mut merged: Vec<ThemeSummary> = counts
        .into_iter()
        .map(|(label, (count, weighted))| ThemeSummary {
            label,
            count,
            sentiment: if count > 0 { weighted / count as f64 } else { 0.0 },
        })
        .collect();
    merged.sort_by(|a, b| b.count.cmp(&a.count).then(a.label.cmp(&b.label)));
    merged.truncate(cap);
    merged
}

/// In-memory store for tests and for callers that keep aggregates resident.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub hotspots: Vec<Hotspot>,
    pub signals: Vec<Signal>,
    pub flows: Vec<Flow>,
    pub snapshots: Vec<TopicSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregateStore for MemoryStore {
    fn hotspots_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Hotspot>> {
        Ok(self
            .hotspots
            .iter()
            .filter(|h| h.bucket_start < cutoff)
            .cloned()
            .collect())
    }

    fn delete_hotspots_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.hotspots.len();
        self.hotspots.retain(|h| h.bucket_start >= cutoff);
        Ok(before - self.hotspots.len())
    }

    fn count_signals_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self.signals.iter().filter(|s| s.timestamp < cutoff).count())
    }

    fn delete_signals_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.signals.len();
        self.signals.retain(|s| s.timestamp >= cutoff);
        Ok(before - self.signals.len())
    }

    fn snapshots_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TopicSnapshot>> {
        Ok(self
            .snapshots
            .iter()
            .filter(|s| s.granularity == granularity && s.bucket_start < cutoff)
            .cloned()
            .collect())
    }

    fn upsert_snapshots(&mut self, snapshots: &[TopicSnapshot]) -> Result<()> {
        for snap in snapshots {
            match self.snapshots.iter_mut().find(|s| {
                s.country_code == snap.country_code
                    && s.bucket_start == snap.bucket_start
                    && s.granularity == snap.granularity
            }) {
                Some(existing) => *existing = snap.clone(),
                None => self.snapshots.push(snap.clone()),
            }
        }
        Ok(())
    }

    fn delete_snapshots_before(
        &mut self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let before = self.snapshots.len();
        self.snapshots.retain(|s| {
            s.granularity != granularity || s.bucket_start >= cutoff || s.keep_forever
        });
        Ok(before - self.snapshots.len())
    }

    fn flows_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Flow>> {
        Ok(self
            .flows
            .iter()
            .filter(|f| f.to_time < cutoff)
            .cloned()
            .collect())
    }

    fn delete_flows_before_below(
        &mut self,
        cutoff: DateTime<Utc>,
        heat_floor: f64,
    ) -> Result<usize> {
        let before = self.flows.len();
        self.flows
            .retain(|f| f.to_time >= cutoff || f.heat >= heat_floor);
        Ok(before - self.flows.len())
    }

    fn delete_flows_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.flows.len();
        self.flows.retain(|f| f.to_time >= cutoff);
        Ok(before - self.flows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    fn hotspot(country: &str, age_days: i64, minute: u32, total: u64, sentiment: f64) -> Hotspot {
        Hotspot {
            country_code: country.to_string(),
            bucket_start: now() - Duration::days(age_days) + Duration::minutes(minute as i64),
            intensity: 0.5,
            volume_component: 0.5,
            velocity_component: 0.0,
            confidence_component: 0.8,
            topic_count: 1,
            total_topic_count: total,
            top_themes: vec![ThemeSummary {
                label: "PROTEST".into(),
                count: total,
                sentiment,
            }],
            avg_sentiment: sentiment,
            signal_count: 2,
            source_count: 2,
            source_diversity: 1.0,
            centroid_lat: None,
            centroid_lon: None,
        }
    }

    fn flow(age_days: i64, heat: f64) -> Flow {
        let t = now() - Duration::days(age_days);
        Flow {
            from_country: "AR".into(),
            to_country: "BR".into(),
            from_time: t - Duration::hours(1),
            to_time: t,
            heat,
            similarity: heat,
            time_delta_hours: 1.0,
            shared_themes: vec![],
        }
    }

    #[test]
    fn tier_boundaries_follow_policy() {
        let p = RetentionPolicy::default();
        assert_eq!(Tier::for_age_days(0, &p), Tier::Hot);
        assert_eq!(Tier::for_age_days(29, &p), Tier::Hot);
        assert_eq!(Tier::for_age_days(30, &p), Tier::Warm);
        assert_eq!(Tier::for_age_days(90, &p), Tier::Cold);
        assert_eq!(Tier::for_age_days(365, &p), Tier::Purged);
    }

    #[test]
    fn aged_hotspots_coalesce_to_hourly_and_are_removed() {
        let mut store = MemoryStore::new();
        // two quarter-hour buckets in the same hour, 40 days old
        store.hotspots.push(hotspot("CO", 40, 0, 10, -0.2));
        store.hotspots.push(hotspot("CO", 40, 15, 30, 0.2));
        // fresh hotspot stays
        store.hotspots.push(hotspot("CO", 1, 0, 5, 0.0));

        let mgr = RetentionManager::new(RetentionPolicy::default()).unwrap();
        let report = mgr.sweep(&mut store, now(), false).unwrap();

        assert_eq!(report.hotspots_coalesced, 2);
        assert_eq!(report.hourly_snapshots_written, 1);
        assert_eq!(store.hotspots.len(), 1);
        let snap = &store.snapshots[0];
        assert_eq!(snap.granularity, Granularity::Hourly);
        assert_eq!(snap.total_theme_count, 40);
        assert_eq!(snap.signal_count, 4);
        // equal signal counts -> plain average of the two buckets
        assert!((snap.avg_sentiment - 0.0).abs() < 1e-12);
        assert_eq!(snap.top_themes[0].count, 40);
    }

    #[test]
    fn sweep_is_idempotent() {
        let mut store = MemoryStore::new();
        store.hotspots.push(hotspot("CO", 40, 0, 10, 0.0));
        store.flows.push(flow(100, 0.4));

        let mgr = RetentionManager::new(RetentionPolicy::default()).unwrap();
        mgr.sweep(&mut store, now(), false).unwrap();
        let snapshots_after_first = store.snapshots.clone();
        let flows_after_first = store.flows.len();

        let report = mgr.sweep(&mut store, now(), false).unwrap();
        assert_eq!(report.hotspots_coalesced, 0);
        assert_eq!(store.snapshots.len(), snapshots_after_first.len());
        assert_eq!(store.flows.len(), flows_after_first);
    }

    #[test]
    fn interrupted_sweep_keeps_both_representations() {
        // Simulate a crash between append and delete: the snapshot exists,
        // the hotspot is still there. A re-run must converge, not duplicate.
        let mut store = MemoryStore::new();
        store.hotspots.push(hotspot("CO", 40, 0, 10, 0.0));

        let mgr = RetentionManager::new(RetentionPolicy::default()).unwrap();
        let hourly = mgr.coalesce_hotspots(&store.hotspots);
        store.upsert_snapshots(&hourly).unwrap();
        // crash here: delete never ran

        mgr.sweep(&mut store, now(), false).unwrap();
        assert_eq!(store.snapshots.len(), 1);
        assert!(store.hotspots.is_empty());
    }

    #[test]
    fn cold_tier_keeps_only_hot_flows() {
        let mut store = MemoryStore::new();
        store.flows.push(flow(100, 0.9));
        store.flows.push(flow(100, 0.4));
        store.flows.push(flow(5, 0.4)); // young, untouched

        let mgr = RetentionManager::new(RetentionPolicy::default()).unwrap();
        let report = mgr.sweep(&mut store, now(), false).unwrap();
        assert_eq!(report.flows_pruned, 1);
        assert_eq!(store.flows.len(), 2);
    }

    #[test]
    fn purge_deletes_past_final_horizon_except_keep_forever() {
        let mut store = MemoryStore::new();
        let old = now() - Duration::days(400);
        store.snapshots.push(TopicSnapshot {
            country_code: "CO".into(),
            bucket_start: old,
            granularity: Granularity::Daily,
            signal_count: 1,
            total_theme_count: 1,
            avg_sentiment: 0.0,
            top_themes: vec![],
            keep_forever: false,
        });
        store.snapshots.push(TopicSnapshot {
            country_code: "BR".into(),
            bucket_start: old,
            granularity: Granularity::Daily,
            signal_count: 1,
            total_theme_count: 1,
            avg_sentiment: 0.0,
            top_themes: vec![],
            keep_forever: true,
        });
        store.flows.push(flow(400, 0.9));

        let mgr = RetentionManager::new(RetentionPolicy::default()).unwrap();
        let report = mgr.sweep(&mut store, now(), false).unwrap();
        assert_eq!(report.snapshots_purged, 1);
        assert_eq!(report.flows_purged, 1);
        assert_eq!(store.snapshots.len(), 1);
        assert_eq!(store.snapshots[0].country_code, "BR");
        assert!(store.flows.is_empty());
    }

    #[test]
    fn dry_run_reads_but_never_mutates() {
        let mut store = MemoryStore::new();
        store.hotspots.push(hotspot("CO", 40, 0, 10, 0.0));
        store.flows.push(flow(100, 0.4));

        let mgr = RetentionManager::new(RetentionPolicy::default()).unwrap();
        let report = mgr.sweep(&mut store, now(), true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.hotspots_coalesced, 1);
        assert_eq!(report.flows_pruned, 1);
        assert_eq!(store.hotspots.len(), 1);
        assert_eq!(store.flows.len(), 1);
        assert!(store.snapshots.is_empty());
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let p = RetentionPolicy {
            hot_days: 90,
            warm_days: 30,
            ..Default::default()
        };
        assert!(RetentionManager::new(p).is_err());
    }
}
