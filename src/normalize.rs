// src/normalize.rs
//! Signal normalization: one country-scoped `Signal` per distinct country in
//! a record's locations, with precision-dependent confidence, tone mapped to
//! [-1, 1], and per-cycle dedup over record ids.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, TickErrorSummary};
use crate::parser::RawEventRecord;

/// Native-scale tone magnitude beyond which a record is flagged an outlier.
/// Outliers are still emitted; silently dropping them would systematically
/// under-count crisis events.
pub const OUTLIER_TONE_BOUND: f64 = 50.0;

/// One country-scoped observation derived from a single event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// `record_id` plus country disambiguator; stable across re-ingests.
    pub signal_id: String,
    pub timestamp: DateTime<Utc>,
    pub country_code: String,
    pub themes: Vec<String>,
    pub primary_theme: Option<String>,
    pub theme_counts: BTreeMap<String, u32>,
    /// Normalized to [-1, 1].
    pub sentiment_score: f64,
    /// In [0, 1], derived from the best location precision for this country.
    pub confidence: f64,
    /// Tone magnitude exceeded the sanity bound; callers may filter.
    pub tone_outlier: bool,
    pub persons: Vec<String>,
    pub organizations: Vec<String>,
    pub source_outlet: Option<String>,
}

/// Per-ingest-cycle seen-set. Multiple parser/normalizer shards insert
/// concurrently, so the set lives behind a lock; the whole structure is
/// created at tick start and discarded at tick end.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: Mutex<HashSet<String>>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the key was not seen before in this cycle.
    pub fn insert(&self, key: &str) -> bool {
        self.seen
            .lock()
            .expect("dedup mutex poisoned")
            .insert(key.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dedup key: the record id, or a content hash of the source URL when the
/// feed omits the id. Records with neither cannot be deduplicated.
fn dedup_key(record: &RawEventRecord) -> Option<String> {
    if !record.record_id.is_empty() {
        return Some(record.record_id.clone());
    }
    record.source_url.as_ref().map(|url| {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        format!("{:x}", hasher.finalize())
    })
}

/// Location precision to confidence: country-level mentions are vaguer than
/// city-level ones.
fn location_confidence(location_type: u8) -> f64 {
    match location_type {
        1 => 0.6,
        3 | 4 => 1.0,
        _ => 0.8,
    }
}

fn country_code_ok(code: &str) -> bool {
    code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// Normalize one record into zero or more signals. Returns an empty vec (and
/// tallies `UnresolvableLocation`) when no location resolves to a country.
pub fn normalize_record(record: &RawEventRecord, summary: &mut TickErrorSummary) -> Vec<Signal> {
    // Best (most precise) confidence per country, first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut confidence: BTreeMap<String, f64> = BTreeMap::new();
    for loc in &record.locations {
        if !country_code_ok(&loc.country_code) {
            continue;
        }
        let c = location_confidence(loc.location_type);
        match confidence.get_mut(&loc.country_code) {
            Some(existing) => {
                if c > *existing {
                    *existing = c;
                }
            }
            None => {
                order.push(loc.country_code.clone());
                confidence.insert(loc.country_code.clone(), c);
            }
        }
    }

    if order.is_empty() {
        summary.record(ErrorKind::UnresolvableLocation);
        return Vec::new();
    }

    let overall = record.tone.as_ref().and_then(|t| t.overall);
    let sentiment_score = (overall.unwrap_or(0.0) / 100.0).clamp(-1.0, 1.0);
    let tone_outlier = overall.map(|t| t.abs() > OUTLIER_TONE_BOUND).unwrap_or(false);
    if tone_outlier {
        summary.record(ErrorKind::OutlierSentiment);
    }

    // Highest count wins; ties go to the earlier theme in the source list,
    // so a strictly-greater count is required to displace the leader.
    let mut leader: Option<&crate::parser::fields::ThemeCount> = None;
    for tc in &record.theme_counts {
        if leader.map_or(true, |b| tc.count > b.count) {
            leader = Some(tc);
        }
    }
    let primary_theme = leader.map(|tc| tc.theme.clone());

    let theme_counts: BTreeMap<String, u32> = record
        .theme_counts
        .iter()
        .map(|tc| (tc.theme.clone(), tc.count))
        .collect();

    order
        .into_iter()
        .map(|country_code| Signal {
            signal_id: format!("{}:{}", record.record_id, country_code),
            timestamp: record.timestamp,
            country_code: country_code.clone(),
            themes: record.themes.clone(),
            primary_theme: primary_theme.clone(),
            theme_counts: theme_counts.clone(),
            sentiment_score,
            confidence: confidence[&country_code],
            tone_outlier,
            persons: record.persons.clone(),
            organizations: record.organizations.clone(),
            source_outlet: record.source_outlet.clone(),
        })
        .collect()
}

/// Normalize a shard of records against the shared per-cycle dedup set.
/// Returns the emitted signals and this shard's error tallies.
pub fn normalize_batch(
    records: &[RawEventRecord],
    dedup: &DedupSet,
) -> (Vec<Signal>, TickErrorSummary) {
    let mut signals = Vec::with_capacity(records.len());
    let mut summary = TickErrorSummary::new();

    for record in records {
        if let Some(key) = dedup_key(record) {
            if !dedup.insert(&key) {
                summary.record(ErrorKind::DuplicateRecord);
                continue;
            }
        }
        signals.extend(normalize_record(record, &mut summary));
    }

    (signals, summary)
}
