// src/engine.rs
//! Per-tick orchestration. Parsing and normalization of independent lines are
//! sharded across tokio tasks; aggregation starts only after the tick's full
//! signal set is materialized, and flow detection runs only after every
//! per-country window is final. Ticks are processed strictly one at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::countries::CountrySet;
use crate::error::{ErrorKind, ParseError, TickErrorSummary};
use crate::flow::{Flow, FlowDetector, FlowStats};
use crate::hotspot::{self, Hotspot};
use crate::normalize::{self, DedupSet, Signal};
use crate::parser;

/// Malformed-row share above which a tick is flagged as a data-quality issue.
const MALFORMED_WARN_RATE: f64 = 0.10;

/// Previous-bucket totals kept per country for the velocity chain.
const RECENT_BUCKETS_KEPT: usize = 8;

/// One-time metrics registration (so series show up on the exporter).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("engine_lines_total", "Non-blank batch lines seen.");
        describe_counter!("engine_records_parsed_total", "Well-formed records parsed.");
        describe_counter!("engine_signals_total", "Signals emitted after normalization.");
        describe_counter!("engine_hotspots_total", "Hotspots produced per tick.");
        describe_counter!("engine_flows_total", "Flows emitted per tick.");
        describe_counter!(
            "engine_tick_errors_total",
            "Recoverable per-tick errors by kind."
        );
        describe_counter!(
            "engine_ticks_dropped_total",
            "Ticks dropped because the queue was full."
        );
        describe_gauge!("engine_tick_last_run_ts", "Unix ts when a tick last ran.");
    });
}

/// Everything one tick hands to the persistence/query layer.
#[derive(Debug)]
pub struct TickOutput {
    /// Hot-tier only; optional for the caller to persist.
    pub signals: Vec<Signal>,
    /// One per country per bucket observed this tick, sorted by intensity.
    pub hotspots: Vec<Hotspot>,
    /// Qualifying pairs only, sorted by heat.
    pub flows: Vec<Flow>,
    pub flow_stats: FlowStats,
    pub summary: TickErrorSummary,
    pub parse_errors: Vec<ParseError>,
    pub lines_total: usize,
    pub records_parsed: usize,
}

pub struct Engine {
    cfg: EngineConfig,
    countries: Arc<CountrySet>,
    /// total_topic_count per recent bucket per country, for velocity.
    recent_totals: Mutex<HashMap<String, BTreeMap<i64, u64>>>,
}

impl Engine {
    /// Configuration problems are fatal here, never per tick.
    pub fn new(cfg: EngineConfig, countries: CountrySet) -> Result<Self> {
        cfg.validate().context("engine configuration rejected")?;
        Ok(Self {
            cfg,
            countries: countries.snapshot(),
            recent_totals: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Process one raw batch: parse, normalize, aggregate, detect flows.
    /// Row-level failures are tallied and never abort the tick.
    pub async fn run_tick(&self, batch: &str) -> Result<TickOutput> {
        ensure_metrics_described();

        // The reference snapshot this tick sees, regardless of later updates.
        let countries = Arc::clone(&self.countries);
        let dedup = Arc::new(DedupSet::new());

        // ---- parse + normalize, sharded over line chunks ----
        let lines: Vec<(usize, String)> = batch
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.to_string()))
            .collect();
        let lines_total = lines.iter().filter(|(_, l)| !l.trim().is_empty()).count();

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let chunk_size = lines.len().div_ceil(workers).max(1);

        let mut handles = Vec::new();
        for chunk in lines.chunks(chunk_size) {
            let chunk: Vec<(usize, String)> = chunk.to_vec();
            let dedup = Arc::clone(&dedup);
            handles.push(tokio::spawn(async move {
                let mut records = Vec::new();
                let mut errors = Vec::new();
                for (line_no, line) in &chunk {
                    match parser::parse_line(line, *line_no) {
                        Ok(Some(record)) => records.push(record),
                        Ok(None) => {}
                        Err(e) => errors.push(e),
                    }
                }
                let (signals, mut summary) = normalize::normalize_batch(&records, &dedup);
                for e in &errors {
                    summary.record(e.kind);
                }
                (signals, errors, summary, records.len())
            }));
        }

        let mut signals: Vec<Signal> = Vec::new();
        let mut parse_errors: Vec<ParseError> = Vec::new();
        let mut summary = TickErrorSummary::new();
        let mut records_parsed = 0usize;
        for handle in handles {
            let (s, e, sum, parsed) = handle.await.context("parser shard panicked")?;
            signals.extend(s);
            parse_errors.extend(e);
            summary.merge(&sum);
            records_parsed += parsed;
        }

        let malformed_rate = summary.malformed_rate(lines_total);
        if malformed_rate > MALFORMED_WARN_RATE {
            warn!(
                malformed = summary.count(ErrorKind::MalformedRow),
                lines = lines_total,
                rate_pct = malformed_rate * 100.0,
                "high malformed-row rate; partial results for this tick"
            );
        }

        // ---- aggregate: the full signal set is materialized by now ----
        let mut groups: BTreeMap<(String, i64), Vec<Signal>> = BTreeMap::new();
        for signal in &signals {
            if !countries.is_active(&signal.country_code) {
                debug!(
                    country = signal.country_code.as_str(),
                    "not in active reference set, skipped"
                );
                continue;
            }
            let bucket =
                hotspot::bucket_start_for(signal.timestamp, self.cfg.bucket_duration_secs);
            groups
                .entry((signal.country_code.clone(), bucket.timestamp()))
                .or_default()
                .push(signal.clone());
        }

        let mut hotspots = Vec::with_capacity(groups.len());
        {
            // BTreeMap order means earlier buckets close first, so a tick
            // spanning two buckets chains velocity within itself.
            let mut recent = self
                .recent_totals
                .lock()
                .expect("recent totals mutex poisoned");
            for ((country_code, bucket_ts), group) in &groups {
                let bucket_start =
                    chrono::DateTime::from_timestamp(*bucket_ts, 0).expect("valid bucket ts");
                let prev_ts = bucket_ts - self.cfg.bucket_duration_secs as i64;
                let previous_total = recent
                    .get(country_code)
                    .and_then(|m| m.get(&prev_ts))
                    .copied();
                let h = hotspot::aggregate(
                    group,
                    country_code,
                    bucket_start,
                    previous_total,
                    self.cfg.volume_cap,
                    self.cfg.velocity_rate_cap,
                    self.cfg.max_top_themes,
                    countries.get(country_code),
                );
                let totals = recent.entry(country_code.clone()).or_default();
                totals.insert(*bucket_ts, h.total_topic_count);
                while totals.len() > RECENT_BUCKETS_KEPT {
                    let oldest = *totals.keys().next().expect("non-empty totals");
                    totals.remove(&oldest);
                }
                hotspots.push(h);
            }
        }
        hotspots.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));

        // ---- flows: windows are final ----
        let mut windows: HashMap<String, Vec<Signal>> = HashMap::new();
        for ((country_code, _), group) in groups {
            windows.entry(country_code).or_default().extend(group);
        }
        let detector = FlowDetector::from_config(&self.cfg);
        let (flows, flow_stats) = detector.detect(&windows, &mut summary)?;

        // ---- telemetry ----
        counter!("engine_lines_total").increment(lines_total as u64);
        counter!("engine_records_parsed_total").increment(records_parsed as u64);
        counter!("engine_signals_total").increment(signals.len() as u64);
        counter!("engine_hotspots_total").increment(hotspots.len() as u64);
        counter!("engine_flows_total").increment(flows.len() as u64);
        for (kind, n) in summary.iter() {
            counter!("engine_tick_errors_total", "kind" => kind.as_str()).increment(n);
        }
        gauge!("engine_tick_last_run_ts").set(chrono::Utc::now().timestamp().max(0) as f64);

        info!(
            target: "engine",
            lines = lines_total,
            records = records_parsed,
            signals = signals.len(),
            hotspots = hotspots.len(),
            flows = flows.len(),
            errors = summary.total(),
            "tick complete"
        );

        Ok(TickOutput {
            signals,
            hotspots,
            flows,
            flow_stats,
            summary,
            parse_errors,
            lines_total,
            records_parsed,
        })
    }
}

/// Bounded intake for the one-tick-at-a-time loop. A batch arriving while
/// the queue is full is dropped, not interleaved with the running tick.
#[derive(Clone)]
pub struct EngineQueue {
    tx: mpsc::Sender<String>,
}

impl EngineQueue {
    /// Returns false (after a logged warning) when the batch was dropped.
    pub fn submit(&self, batch: String) -> bool {
        match self.tx.try_send(batch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("tick queue full, dropping batch");
                counter!("engine_ticks_dropped_total").increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("engine loop stopped, dropping batch");
                false
            }
        }
    }
}

/// Spawn the single active pipeline run. Outputs arrive on the returned
/// receiver in tick order.
pub fn spawn_engine_loop(
    engine: Arc<Engine>,
) -> (EngineQueue, mpsc::Receiver<TickOutput>, JoinHandle<()>) {
    ensure_metrics_described();
    let depth = engine.cfg.queue_depth;
    let (tx, mut rx) = mpsc::channel::<String>(depth);
    let (out_tx, out_rx) = mpsc::channel::<TickOutput>(depth);

    let handle = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            match engine.run_tick(&batch).await {
                Ok(output) => {
                    if out_tx.send(output).await.is_err() {
                        break; // consumer gone
                    }
                }
                Err(e) => {
                    warn!(error = ?e, "tick failed");
                }
            }
        }
    });

    (EngineQueue { tx }, out_rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::SimilarityMode;

    /// 27-column line with themes/locations/tone in the right slots.
    fn batch_line(record_id: &str, ts: &str, themes: &str, location: &str, tone: &str) -> String {
        let mut cols = vec![String::new(); parser::EXPECTED_COLUMNS];
        cols[0] = record_id.to_string();
        cols[1] = ts.to_string();
        cols[3] = "example.com".to_string();
        cols[4] = format!("https://example.com/{record_id}");
        cols[8] = themes.to_string();
        cols[10] = location.to_string();
        cols[15] = tone.to_string();
        cols.join("\t")
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            flow_threshold: 0.3,
            similarity_mode: SimilarityMode::Jaccard,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tick_produces_signals_hotspots_and_flows() {
        let engine = Engine::new(test_config(), CountrySet::builtin()).unwrap();
        let batch = [
            batch_line(
                "r1",
                "20260115120100",
                "PROTEST,10;PROTEST,20;ECON_INFLATION,44",
                "1#Colombia#CO###4.57#-74.3#CO",
                "-8.0,2.0,10.0,12.0,20.0,1.0,500",
            ),
            batch_line(
                "r2",
                "20260115120500",
                "PROTEST,10;ECON_INFLATION,15",
                "1#Brazil#BR###-14.2#-51.9#BR",
                "-4.0,2.0,6.0,8.0,20.0,1.0,400",
            ),
        ]
        .join("\n");

        let out = engine.run_tick(&batch).await.unwrap();
        assert_eq!(out.records_parsed, 2);
        assert_eq!(out.signals.len(), 2);
        assert_eq!(out.hotspots.len(), 2);
        // identical theme sets four minutes apart clear the 0.3 threshold
        assert_eq!(out.flows.len(), 1);
        let f = &out.flows[0];
        assert_eq!(f.from_country, "CO");
        assert_eq!(f.to_country, "BR");
        assert_eq!(f.similarity, 1.0);
        assert!(out.summary.total() == 0);
        // hotspots carry the reference centroid
        assert!(out.hotspots.iter().all(|h| h.centroid_lat.is_some()));
    }

    #[tokio::test]
    async fn malformed_rows_do_not_abort_the_tick() {
        let engine = Engine::new(test_config(), CountrySet::builtin()).unwrap();
        let good = batch_line(
            "r1",
            "20260115120100",
            "PROTEST,10",
            "1#Colombia#CO###4.57#-74.3#CO",
            "",
        );
        let batch = format!("too\tfew\tcolumns\n{good}");
        let out = engine.run_tick(&batch).await.unwrap();
        assert_eq!(out.records_parsed, 1);
        assert_eq!(out.summary.count(ErrorKind::MalformedRow), 1);
        assert_eq!(out.parse_errors.len(), 1);
        assert_eq!(out.hotspots.len(), 1);
    }

    #[tokio::test]
    async fn velocity_chains_across_ticks() {
        let engine = Engine::new(test_config(), CountrySet::builtin()).unwrap();

        let first = batch_line(
            "r1",
            "20260115120000",
            "PROTEST,1;PROTEST,2", // total 2
            "1#Colombia#CO###4.57#-74.3#CO",
            "",
        );
        let out1 = engine.run_tick(&first).await.unwrap();
        assert_eq!(out1.hotspots[0].velocity_component, 0.0);

        // next bucket, total 6: delta 4 / prev 2 / cap 10 = 0.2
        let second = batch_line(
            "r2",
            "20260115121500",
            "PROTEST,1;PROTEST,2;PROTEST,3;PROTEST,4;PROTEST,5;PROTEST,6",
            "1#Colombia#CO###4.57#-74.3#CO",
            "",
        );
        let out2 = engine.run_tick(&second).await.unwrap();
        assert!((out2.hotspots[0].velocity_component - 0.2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn inactive_countries_get_signals_but_no_hotspots() {
        let engine = Engine::new(test_config(), CountrySet::builtin()).unwrap();
        // ZZ is not in the reference set
        let batch = batch_line(
            "r1",
            "20260115120100",
            "PROTEST,10",
            "1#Atlantis#ZZ###0.0#0.0#ZZ",
            "",
        );
        let out = engine.run_tick(&batch).await.unwrap();
        assert_eq!(out.signals.len(), 1);
        assert!(out.hotspots.is_empty());
        assert!(out.flows.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_batches_with_warning() {
        let (tx, _rx) = mpsc::channel::<String>(1);
        let queue = EngineQueue { tx };
        // no consumer: the first submit fills the queue, the second drops
        assert!(queue.submit("first".into()));
        assert!(!queue.submit("second".into()));
    }

    #[tokio::test]
    async fn engine_loop_processes_in_order() {
        let engine = Arc::new(Engine::new(test_config(), CountrySet::builtin()).unwrap());
        let (queue, mut out_rx, handle) = spawn_engine_loop(engine);

        let b1 = batch_line(
            "r1",
            "20260115120000",
            "PROTEST,1",
            "1#Colombia#CO###4.57#-74.3#CO",
            "",
        );
        let b2 = batch_line(
            "r2",
            "20260115121500",
            "PROTEST,1",
            "1#Colombia#CO###4.57#-74.3#CO",
            "",
        );
        assert!(queue.submit(b1));
        let out1 = out_rx.recv().await.unwrap();
        assert_eq!(out1.signals[0].signal_id, "r1:CO");
        assert!(queue.submit(b2));
        let out2 = out_rx.recv().await.unwrap();
        assert_eq!(out2.signals[0].signal_id, "r2:CO");

        drop(queue);
        handle.await.unwrap();
    }
}
