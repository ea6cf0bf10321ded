// src/parser/mod.rs
//! Batch parser for the tab-delimited event-record feed (27 columns per row,
//! GKG 2.1 layout). One `RawEventRecord` per well-formed line; per-line
//! failures are isolated so a bad row never aborts the batch.

pub mod fields;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ParseError};
use fields::{EventLocation, ThemeCount, ToneMetrics};

pub const EXPECTED_COLUMNS: usize = 27;

// Column indices for the 27-column schema.
const COL_RECORD_ID: usize = 0;
const COL_TIMESTAMP: usize = 1;
const COL_SOURCE_NAME: usize = 3;
const COL_SOURCE_URL: usize = 4;
const COL_THEMES: usize = 7;
const COL_ENHANCED_THEMES: usize = 8;
const COL_ENHANCED_LOCATIONS: usize = 10;
const COL_PERSONS: usize = 11;
const COL_ORGANIZATIONS: usize = 13;
const COL_TONE: usize = 15;

/// One parsed event record. Created once per line, immutable, and discarded
/// after normalization; never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub record_id: String,
    pub timestamp: DateTime<Utc>,
    pub locations: Vec<EventLocation>,
    pub persons: Vec<String>,
    pub organizations: Vec<String>,
    pub themes: Vec<String>,
    pub theme_counts: Vec<ThemeCount>,
    pub tone: Option<ToneMetrics>,
    pub source_outlet: Option<String>,
    pub source_url: Option<String>,
}

/// Parse one whole batch. Output order matches input line order; record-id
/// uniqueness is the batch's responsibility, not the parser's.
pub fn parse_batch(batch: &str) -> (Vec<RawEventRecord>, Vec<ParseError>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for (idx, line) in batch.lines().enumerate() {
        match parse_line(line, idx + 1) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {} // blank line
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}

/// Parse a single line. `Ok(None)` for blank lines; `Err` carries the
/// 1-based line number for the feed-quality log.
pub fn parse_line(line: &str, line_no: usize) -> Result<Option<RawEventRecord>, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let columns: Vec<&str> = line.split('\t').collect();
    if columns.len() != EXPECTED_COLUMNS {
        return Err(ParseError::new(
            ErrorKind::MalformedRow,
            line_no,
            format!(
                "expected {EXPECTED_COLUMNS} columns, got {}",
                columns.len()
            ),
        ));
    }

    // A record without a usable timestamp cannot be bucketed.
    let timestamp = fields::parse_timestamp(columns[COL_TIMESTAMP]).ok_or_else(|| {
        ParseError::new(
            ErrorKind::MalformedRow,
            line_no,
            format!("unparseable timestamp {:?}", columns[COL_TIMESTAMP]),
        )
    })?;

    let theme_counts = fields::parse_theme_mentions(columns[COL_ENHANCED_THEMES]);
    // The enhanced column is authoritative for ordering and counts; the plain
    // column is the fallback when a row carries no enhanced themes.
    let (themes, theme_counts) = if theme_counts.is_empty() {
        let plain = fields::parse_plain_themes(columns[COL_THEMES]);
        let counts = plain
            .iter()
            .map(|t| ThemeCount {
                theme: t.clone(),
                count: 1,
            })
            .collect();
        (plain, counts)
    } else {
        let themes = theme_counts.iter().map(|tc| tc.theme.clone()).collect();
        (themes, theme_counts)
    };

    Ok(Some(RawEventRecord {
        record_id: columns[COL_RECORD_ID].trim().to_string(),
        timestamp,
        locations: fields::parse_locations(columns[COL_ENHANCED_LOCATIONS]),
        persons: fields::parse_name_list(columns[COL_PERSONS]),
        organizations: fields::parse_name_list(columns[COL_ORGANIZATIONS]),
        themes,
        theme_counts,
        tone: fields::parse_tone(columns[COL_TONE]),
        source_outlet: non_empty(columns[COL_SOURCE_NAME]),
        source_url: non_empty(columns[COL_SOURCE_URL]),
    }))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a well-formed 27-column line with the given named columns.
    fn line(record_id: &str, ts: &str, themes: &str, locations: &str, tone: &str) -> String {
        let mut cols = vec![String::new(); EXPECTED_COLUMNS];
        cols[COL_RECORD_ID] = record_id.to_string();
        cols[COL_TIMESTAMP] = ts.to_string();
        cols[COL_SOURCE_NAME] = "example.com".to_string();
        cols[COL_SOURCE_URL] = format!("https://example.com/{record_id}");
        cols[COL_ENHANCED_THEMES] = themes.to_string();
        cols[COL_ENHANCED_LOCATIONS] = locations.to_string();
        cols[COL_TONE] = tone.to_string();
        cols.join("\t")
    }

    #[test]
    fn well_formed_line_parses() {
        let l = line(
            "20260115123000-1",
            "20260115123000",
            "PROTEST,10;PROTEST,90;ECON_INFLATION,44",
            "1#Colombia#CO###4.57#-74.3#CO",
            "-3.5,2.1,5.6,7.7,21.3,2.5,523",
        );
        let (records, errors) = parse_batch(&l);
        assert!(errors.is_empty());
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.record_id, "20260115123000-1");
        assert_eq!(r.themes, vec!["PROTEST", "ECON_INFLATION"]);
        assert_eq!(r.theme_counts[0].count, 2);
        assert_eq!(r.locations[0].country_code, "CO");
        assert_eq!(r.tone.as_ref().unwrap().overall, Some(-3.5));
        assert_eq!(r.source_outlet.as_deref(), Some("example.com"));
    }

    #[test]
    fn short_row_is_skipped_rest_of_batch_parses() {
        // 20 columns instead of 27
        let short = vec!["x"; 20].join("\t");
        let good = line(
            "r2",
            "20260115123000",
            "PROTEST,10",
            "1#Colombia#CO###4.57#-74.3#CO",
            "",
        );
        let batch = format!("{short}\n{good}\n");
        let (records, errors) = parse_batch(&batch);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, "r2");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::MalformedRow);
        assert_eq!(errors[0].line_no, 1);
    }

    #[test]
    fn bad_timestamp_is_a_malformed_row() {
        let l = line("r1", "not-a-date", "PROTEST,10", "1#Colombia#CO###4.57#-74.3#CO", "");
        let (records, errors) = parse_batch(&l);
        assert!(records.is_empty());
        assert_eq!(errors[0].kind, ErrorKind::MalformedRow);
    }

    #[test]
    fn blank_lines_are_not_errors() {
        let (records, errors) = parse_batch("\n\n");
        assert!(records.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn plain_theme_fallback_when_enhanced_column_empty() {
        let mut cols = vec![String::new(); EXPECTED_COLUMNS];
        cols[COL_RECORD_ID] = "r1".into();
        cols[COL_TIMESTAMP] = "20260115123000".into();
        cols[COL_THEMES] = "PROTEST;LEADER".into();
        cols[COL_ENHANCED_LOCATIONS] = "1#Colombia#CO###4.57#-74.3#CO".into();
        let (records, _) = parse_batch(&cols.join("\t"));
        let r = &records[0];
        assert_eq!(r.themes, vec!["PROTEST", "LEADER"]);
        assert!(r.theme_counts.iter().all(|tc| tc.count == 1));
        assert!(r.tone.is_none());
        assert!(r.source_outlet.is_none());
    }

    #[test]
    fn output_order_matches_input_order() {
        let a = line("a", "20260115120000", "PROTEST,1", "1#Colombia#CO###4.57#-74.3#CO", "");
        let b = line("b", "20260115121500", "PROTEST,1", "1#Colombia#CO###4.57#-74.3#CO", "");
        let (records, _) = parse_batch(&format!("{a}\n{b}"));
        let ids: Vec<&str> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
