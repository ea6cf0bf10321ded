// src/flow.rs
//! Narrative flow detection: pairwise theme similarity between country
//! windows, decayed by temporal distance. The pair scan is pruned by an
//! inverted theme -> country index so countries with no shared theme are
//! never compared at all.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ErrorKind, TickErrorSummary};
use crate::normalize::Signal;

/// Similarity function for the pairwise scan. Jaccard over theme sets is the
/// deterministic baseline; the cosine mode weighs themes by mention counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMode {
    #[default]
    Jaccard,
    TfCosine,
}

/// A shared theme annotated with both countries' mention counts, for
/// explainability of the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedTheme {
    pub theme: String,
    pub from_count: u64,
    pub to_count: u64,
}

/// A directed narrative edge between two countries for one detection tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub from_country: String,
    pub to_country: String,
    pub from_time: DateTime<Utc>,
    pub to_time: DateTime<Utc>,
    pub heat: f64,
    pub similarity: f64,
    pub time_delta_hours: f64,
    pub shared_themes: Vec<SharedTheme>,
}

/// Per-tick detection bookkeeping for the owning service's logs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlowStats {
    /// Country pairs generated by the inverted index.
    pub pairs_candidate: usize,
    /// Pairs that went through the similarity computation.
    pub pairs_computed: usize,
    pub flows_emitted: usize,
}

/// Per-country view of one window: theme mention totals and, per theme, the
/// earliest signal timestamp carrying it.
struct CountryProfile {
    theme_totals: BTreeMap<String, u64>,
    theme_first_seen: BTreeMap<String, DateTime<Utc>>,
}

impl CountryProfile {
    fn from_signals(signals: &[Signal]) -> Self {
        let mut theme_totals: BTreeMap<String, u64> = BTreeMap::new();
        let mut theme_first_seen: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for s in signals {
            for (theme, count) in &s.theme_counts {
                *theme_totals.entry(theme.clone()).or_insert(0) += *count as u64;
                theme_first_seen
                    .entry(theme.clone())
                    .and_modify(|t| {
                        if s.timestamp < *t {
                            *t = s.timestamp;
                        }
                    })
                    .or_insert(s.timestamp);
            }
        }
        Self {
            theme_totals,
            theme_first_seen,
        }
    }

    /// Earliest timestamp among signals carrying any of the shared themes.
    fn first_seen_among(&self, shared: &[&String]) -> Option<DateTime<Utc>> {
        shared
            .iter()
            .filter_map(|t| self.theme_first_seen.get(*t))
            .min()
            .copied()
    }
}

#[derive(Debug, Clone)]
pub struct FlowDetector {
    halflife_hours: f64,
    threshold: f64,
    mode: SimilarityMode,
}

impl FlowDetector {
    pub fn new(halflife_hours: f64, threshold: f64, mode: SimilarityMode) -> Self {
        Self {
            halflife_hours,
            threshold,
            mode,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.halflife_hours, cfg.flow_threshold, cfg.similarity_mode)
    }

    /// Detect flows across the tick's finalized per-country windows.
    ///
    /// Countries with zero signals are skipped; pairs with no shared theme
    /// are never generated. Returns an error instead of emitting a flow that
    /// would violate the heat invariant.
    pub fn detect(
        &self,
        windows: &HashMap<String, Vec<Signal>>,
        summary: &mut TickErrorSummary,
    ) -> Result<(Vec<Flow>, FlowStats)> {
        let mut stats = FlowStats::default();

        if self.halflife_hours <= 0.0 {
            // Log once per tick, not per pair.
            warn!(
                halflife_hours = self.halflife_hours,
                "degenerate halflife, instantaneous-only decay"
            );
            summary.record(ErrorKind::DegenerateHalflife);
        }

        let mut profiles: BTreeMap<&str, CountryProfile> = BTreeMap::new();
        for (country, signals) in windows {
            if signals.is_empty() {
                debug!(country = country.as_str(), "empty window, skipped");
                summary.record(ErrorKind::EmptyWindow);
                continue;
            }
            profiles.insert(country.as_str(), CountryProfile::from_signals(signals));
        }

        // Inverted index: theme -> countries mentioning it. Candidate pairs
        // come only from countries that co-occur under at least one theme,
        // which keeps the scan near O(sum of theme popularity^2) in practice.
        let mut theme_countries: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (&country, profile) in &profiles {
            for theme in profile.theme_totals.keys() {
                theme_countries.entry(theme.as_str()).or_default().push(country);
            }
        }
        let mut candidates: BTreeSet<(&str, &str)> = BTreeSet::new();
        for countries in theme_countries.values() {
            for (i, &a) in countries.iter().enumerate() {
                for &b in &countries[i + 1..] {
                    // countries come out of a BTreeMap, so a < b already
                    candidates.insert((a, b));
                }
            }
        }
        stats.pairs_candidate = candidates.len();

        let mut flows = Vec::new();
        for (a, b) in candidates {
            let pa = &profiles[a];
            let pb = &profiles[b];

            let shared: Vec<&String> = pa
                .theme_totals
                .keys()
                .filter(|t| pb.theme_totals.contains_key(*t))
                .collect();
            if shared.is_empty() {
                continue;
            }
            stats.pairs_computed += 1;

            let similarity = match self.mode {
                SimilarityMode::Jaccard => jaccard(&pa.theme_totals, &pb.theme_totals),
                SimilarityMode::TfCosine => tf_cosine(&pa.theme_totals, &pb.theme_totals),
            };

            // Direction runs from the country that saw the shared themes
            // first toward the other; delta is clamped to >= 0 by that choice.
            let ta = pa.first_seen_among(&shared);
            let tb = pb.first_seen_among(&shared);
            let (Some(ta), Some(tb)) = (ta, tb) else {
                continue;
            };
            let (from, to, from_time, to_time) = if ta <= tb {
                (a, b, ta, tb)
            } else {
                (b, a, tb, ta)
            };
            let time_delta_hours =
                ((to_time - from_time).num_seconds().max(0) as f64) / 3600.0;

            let heat = similarity * self.time_decay(time_delta_hours);
            if !(0.0..=1.0).contains(&heat) {
                // Invariant breach is a defect to surface, never to clamp away.
                return Err(anyhow!(
                    "heat {heat} out of [0,1] for pair {from}->{to} (similarity {similarity})"
                ));
            }
            if heat < self.threshold {
                continue;
            }

            let mut shared_themes: Vec<SharedTheme> = shared
                .iter()
                .map(|t| {
                    let (fc, tc) = if from == a {
                        (pa.theme_totals[*t], pb.theme_totals[*t])
                    } else {
                        (pb.theme_totals[*t], pa.theme_totals[*t])
                    };
                    SharedTheme {
                        theme: (*t).clone(),
                        from_count: fc,
                        to_count: tc,
                    }
                })
                .collect();
            shared_themes.sort_by(|x, y| {
                (y.from_count + y.to_count)
                    .cmp(&(x.from_count + x.to_count))
                    .then(x.theme.cmp(&y.theme))
            });

            flows.push(Flow {
                from_country: from.to_string(),
                to_country: to.to_string(),
                from_time,
                to_time,
                heat,
                similarity,
                time_delta_hours,
                shared_themes,
            });
        }

        flows.sort_by(|x, y| y.heat.total_cmp(&x.heat));
        stats.flows_emitted = flows.len();
        Ok((flows, stats))
    }

    /// exp(-dt / halflife); with a degenerate halflife the decay collapses
    /// to an instantaneous-only indicator instead of a division by zero.
    fn time_decay(&self, delta_hours: f64) -> f64 {
        if self.halflife_hours <= 0.0 {
            return if delta_hours == 0.0 { 1.0 } else { 0.0 };
        }
        (-delta_hours / self.halflife_hours).exp()
    }
}

/// Set-overlap similarity over theme labels.
fn jaccard(a: &BTreeMap<String, u64>, b: &BTreeMap<String, u64>) -> f64 {
    let intersection = a.keys().filter(|t| b.contains_key(*t)).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Term-frequency weighted cosine over theme mention counts.
fn tf_cosine(a: &BTreeMap<String, u64>, b: &BTreeMap<String, u64>) -> f64 {
    let mut dot = 0.0;
    for (theme, ca) in a {
        if let Some(cb) = b.get(theme) {
            dot += *ca as f64 * *cb as f64;
        }
    }
    let norm_a: f64 = a.values().map(|c| (*c as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|c| (*c as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    // guard the upper bound against floating-point drift
    (dot / (norm_a * norm_b)).min(1.0)
}
