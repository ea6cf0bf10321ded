// src/hotspot.rs
//! Per-(country, bucket) aggregation. One accumulator owns a bucket while it
//! is open; closing it yields an immutable `Hotspot`. A recomputed bucket is
//! a new row under the same key, which persistence treats as a replace.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::countries::Country;
use crate::normalize::Signal;

// Intensity weighting, fixed by the scoring model.
pub const W_VOLUME: f64 = 0.4;
pub const W_VELOCITY: f64 = 0.3;
pub const W_CONFIDENCE: f64 = 0.3;

/// One theme's share of a bucket: summed mention count and the
/// count-weighted mean sentiment of the signals carrying it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeSummary {
    pub label: String,
    pub count: u64,
    pub sentiment: f64,
}

/// One country x time-bucket aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotspot {
    pub country_code: String,
    pub bucket_start: DateTime<Utc>,
    pub intensity: f64,
    pub volume_component: f64,
    pub velocity_component: f64,
    pub confidence_component: f64,
    /// Distinct themes observed in the bucket.
    pub topic_count: usize,
    /// Sum of all theme counts; feeds the next bucket's velocity.
    pub total_topic_count: u64,
    pub top_themes: Vec<ThemeSummary>,
    pub avg_sentiment: f64,
    pub signal_count: usize,
    /// Unique outlets and the unique/total ratio.
    pub source_count: usize,
    pub source_diversity: f64,
    /// Country centroid for imprecise geolocation, from the reference set.
    pub centroid_lat: Option<f64>,
    pub centroid_lon: Option<f64>,
}

/// Truncate a timestamp down to its bucket boundary.
pub fn bucket_start_for(ts: DateTime<Utc>, bucket_secs: u64) -> DateTime<Utc> {
    let secs = bucket_secs as i64;
    let t = ts.timestamp();
    Utc.timestamp_opt(t - t.rem_euclid(secs), 0)
        .single()
        .expect("bucket timestamp in range")
}

/// Open-bucket state for one (country, bucket) key. Never shared between
/// workers; shards aggregate after the tick's signal set is materialized.
#[derive(Debug)]
pub struct BucketAccumulator {
    country_code: String,
    bucket_start: DateTime<Utc>,
    seen_signal_ids: HashSet<String>,
    theme_counts: BTreeMap<String, u64>,
    theme_sentiment_weight: BTreeMap<String, f64>,
    confidence_sum: f64,
    sentiment_sum: f64,
    outlets: HashSet<String>,
    signal_count: usize,
}

impl BucketAccumulator {
    pub fn new(country_code: impl Into<String>, bucket_start: DateTime<Utc>) -> Self {
        Self {
            country_code: country_code.into(),
            bucket_start,
            seen_signal_ids: HashSet::new(),
            theme_counts: BTreeMap::new(),
            theme_sentiment_weight: BTreeMap::new(),
            confidence_sum: 0.0,
            sentiment_sum: 0.0,
            outlets: HashSet::new(),
            signal_count: 0,
        }
    }

    /// Fold one signal in. Re-observing a signal id is a no-op, which makes
    /// cross-cycle re-ingestion an idempotent upsert.
    pub fn observe(&mut self, signal: &Signal) {
        if !self.seen_signal_ids.insert(signal.signal_id.clone()) {
            return;
        }
        self.signal_count += 1;
        self.confidence_sum += signal.confidence;
        self.sentiment_sum += signal.sentiment_score;
        if let Some(outlet) = &signal.source_outlet {
            self.outlets.insert(outlet.clone());
        }
        for (theme, count) in &signal.theme_counts {
            *self.theme_counts.entry(theme.clone()).or_insert(0) += *count as u64;
            *self.theme_sentiment_weight.entry(theme.clone()).or_insert(0.0) +=
                *count as f64 * signal.sentiment_score;
        }
    }

    pub fn signal_count(&self) -> usize {
        self.signal_count
    }

    /// Close the bucket. `previous_total` is the immediately preceding
    /// bucket's `total_topic_count` for the same country, if any.
    pub fn close(
        self,
        previous_total: Option<u64>,
        volume_cap: u32,
        velocity_rate_cap: f64,
        max_top_themes: usize,
        country: Option<&Country>,
    ) -> Hotspot {
        let total_topic_count: u64 = self.theme_counts.values().sum();

        let volume_component = (total_topic_count as f64 / volume_cap as f64).min(1.0);

        let velocity_component = match previous_total {
            Some(prev) => {
                let delta = total_topic_count.saturating_sub(prev) as f64;
                let baseline = prev.max(1) as f64;
                (delta / baseline / velocity_rate_cap).min(1.0)
            }
            None => 0.0,
        };

        let confidence_component = if self.signal_count > 0 {
            self.confidence_sum / self.signal_count as f64
        } else {
            0.0
        };

        let intensity = (W_VOLUME * volume_component
            + W_VELOCITY * velocity_component
            + W_CONFIDENCE * confidence_component)
            .clamp(0.0, 1.0);

        let mut ranked: Vec<ThemeSummary> = self
            .theme_counts
            .iter()
            .map(|(label, count)| ThemeSummary {
                label: label.clone(),
                count: *count,
                sentiment: if *count > 0 {
                    self.theme_sentiment_weight[label] / *count as f64
                } else {
                    0.0
                },
            })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then(a.label.cmp(&b.label)));
        let topic_count = ranked.len();
        ranked.truncate(max_top_themes);

        let avg_sentiment = if self.signal_count > 0 {
            self.sentiment_sum / self.signal_count as f64
        } else {
            0.0
        };

        let source_count = self.outlets.len();
        let source_diversity = if self.signal_count > 0 {
            (source_count as f64 / self.signal_count as f64).min(1.0)
        } else {
            0.0
        };

        Hotspot {
            country_code: self.country_code,
            bucket_start: self.bucket_start,
            intensity,
            volume_component,
            velocity_component,
            confidence_component,
            topic_count,
            total_topic_count,
            top_themes: ranked,
            avg_sentiment,
            signal_count: self.signal_count,
            source_count,
            source_diversity,
            centroid_lat: country.map(|c| c.centroid_lat),
            centroid_lon: country.map(|c| c.centroid_lon),
        }
    }
}

/// Fold a closed bucket's signals into a `Hotspot` in one call.
pub fn aggregate(
    signals: &[Signal],
    country_code: &str,
    bucket_start: DateTime<Utc>,
    previous_total: Option<u64>,
    volume_cap: u32,
    velocity_rate_cap: f64,
    max_top_themes: usize,
    country: Option<&Country>,
) -> Hotspot {
    let mut acc = BucketAccumulator::new(country_code, bucket_start);
    for s in signals {
        acc.observe(s);
    }
    acc.close(
        previous_total,
        volume_cap,
        velocity_rate_cap,
        max_top_themes,
        country,
    )
}
