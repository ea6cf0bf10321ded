// src/lib.rs
// Public library surface for integration tests (and the owning service).

pub mod config;
pub mod countries;
pub mod engine;
pub mod error;
pub mod flow;
pub mod hotspot;
pub mod normalize;
pub mod parser;
pub mod retention;
pub mod source;

// ---- Re-exports for stable public API ----
pub use crate::config::EngineConfig;
pub use crate::countries::{Country, CountrySet};
pub use crate::engine::{Engine, EngineQueue, TickOutput};
pub use crate::error::{ErrorKind, ParseError, TickErrorSummary};
pub use crate::flow::{Flow, FlowDetector, FlowStats, SimilarityMode};
pub use crate::hotspot::Hotspot;
pub use crate::normalize::Signal;
pub use crate::retention::{RetentionManager, SweepReport, TopicSnapshot};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - a debug build
///   - NEWSFLOW_DEV_LOG=1
pub fn enable_dev_tracing() {
    let dev_flag = std::env::var("NEWSFLOW_DEV_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    if !(dev_flag && cfg!(debug_assertions)) {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsflow=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}
