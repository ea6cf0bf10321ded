// src/config.rs
//! Engine configuration. Loaded from TOML with compiled-in defaults and an
//! env-var path override; invalid values are fatal at startup, never per tick.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::flow::SimilarityMode;
use crate::retention::RetentionPolicy;

pub const ENV_CONFIG_PATH: &str = "NEWSFLOW_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Width of one aggregation bucket in seconds (one ingest tick).
    pub bucket_duration_secs: u64,
    /// Half-life of flow heat decay, in hours. Values <= 0 select the
    /// degenerate instantaneous-only mode at detection time.
    pub halflife_hours: f64,
    /// Minimum heat for a flow to be emitted.
    pub flow_threshold: f64,
    /// Topic-count total that saturates the volume component.
    pub volume_cap: u32,
    /// Relative growth per bucket that saturates the velocity component.
    pub velocity_rate_cap: f64,
    /// Similarity function for the pairwise scan.
    pub similarity_mode: SimilarityMode,
    /// Themes reported per hotspot.
    pub max_top_themes: usize,
    /// Pending ticks tolerated before new ones are dropped with a warning.
    pub queue_depth: usize,
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_duration_secs: 900,
            halflife_hours: 6.0,
            flow_threshold: 0.5,
            volume_cap: 100,
            velocity_rate_cap: 10.0,
            similarity_mode: SimilarityMode::Jaccard,
            max_top_themes: 5,
            queue_depth: 2,
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration using env var + fallbacks:
    /// 1) $NEWSFLOW_CONFIG_PATH
    /// 2) config/engine.toml
    /// 3) compiled-in defaults
    pub fn load_default() -> Result<Self> {
        let _ = dotenvy::dotenv();

        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::from_path(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let toml_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if toml_p.exists() {
            return Self::from_path(&toml_p);
        }
        let cfg = Self::default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading engine config from {}", path.display()))?;
        let cfg: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("parsing engine config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup-fatal validation. Note: `halflife_hours <= 0` is allowed and
    /// handled at detection time; NaN is not.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_duration_secs == 0 {
            return Err(anyhow!("bucket_duration_secs must be > 0"));
        }
        if self.halflife_hours.is_nan() {
            return Err(anyhow!("halflife_hours must be a number"));
        }
        if !(0.0..=1.0).contains(&self.flow_threshold) {
            return Err(anyhow!(
                "flow_threshold must be in [0, 1], got {}",
                self.flow_threshold
            ));
        }
        if self.volume_cap == 0 {
            return Err(anyhow!("volume_cap must be > 0"));
        }
        if !(self.velocity_rate_cap > 0.0) {
            return Err(anyhow!(
                "velocity_rate_cap must be > 0, got {}",
                self.velocity_rate_cap
            ));
        }
        if self.max_top_themes == 0 {
            return Err(anyhow!("max_top_themes must be > 0"));
        }
        if self.queue_depth == 0 {
            return Err(anyhow!("queue_depth must be > 0"));
        }
        self.retention.validate()?;
        Ok(())
    }

    pub fn bucket_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bucket_duration_secs as i64)
    }
}

/// Parse a `"6h"`-style window into hours.
pub fn parse_time_window(s: &str) -> Result<f64> {
    let s = s.trim().to_ascii_lowercase();
    let digits = s
        .strip_suffix('h')
        .ok_or_else(|| anyhow!("time window must end with 'h': {s:?}"))?;
    let hours: f64 = digits
        .parse()
        .with_context(|| format!("invalid time window: {s:?}"))?;
    if hours <= 0.0 {
        return Err(anyhow!("time window must be positive: {s:?}"));
    }
    Ok(hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_threshold_is_fatal() {
        let cfg = EngineConfig {
            flow_threshold: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn degenerate_halflife_is_allowed_by_validation() {
        let cfg = EngineConfig {
            halflife_hours: 0.0,
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn time_window_parses_hours() {
        assert_eq!(parse_time_window("6h").unwrap(), 6.0);
        assert_eq!(parse_time_window(" 24H ").unwrap(), 24.0);
        assert!(parse_time_window("6m").is_err());
        assert!(parse_time_window("-1h").is_err());
    }

    #[serial_test::serial]
    #[test]
    fn toml_overrides_and_env_path_work() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("engine.toml");
        std::fs::write(
            &p,
            r#"
bucket_duration_secs = 600
flow_threshold = 0.4
similarity_mode = "tf_cosine"

[retention]
cold_heat_floor = 0.8
"#,
        )
        .unwrap();

        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        let cfg = EngineConfig::load_default().unwrap();
        env::remove_var(ENV_CONFIG_PATH);

        assert_eq!(cfg.bucket_duration_secs, 600);
        assert_eq!(cfg.flow_threshold, 0.4);
        assert_eq!(cfg.similarity_mode, SimilarityMode::TfCosine);
        assert_eq!(cfg.retention.cold_heat_floor, 0.8);
        // untouched keys keep defaults
        assert_eq!(cfg.volume_cap, 100);
        assert_eq!(cfg.retention.hot_days, 30);
    }

    #[serial_test::serial]
    #[test]
    fn invalid_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("engine.toml");
        std::fs::write(&p, "volume_cap = 0\n").unwrap();
        assert!(EngineConfig::from_path(&p).is_err());
    }
}
