// src/parser/fields.rs
//! Sub-parsers for the compound batch columns. Each compound field is a
//! `;`-separated list whose elements are `#`- or `,`-sub-delimited tuples;
//! every element is parsed independently, and a malformed element is dropped
//! from its list without invalidating the rest of the record.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One resolved place mention.
///
/// Block format (enhanced): `Type#Name#CountryCode#ADM1#ADM2#Lat#Lon#FeatureID#CharOffset`.
/// Location types: 1 = country, 2/5 = state or province, 3/4 = city.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLocation {
    pub location_type: u8,
    pub name: String,
    pub country_code: String,
    pub admin_code: Option<String>,
    /// Absent (not zero) when the source value fails to parse.
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub feature_id: Option<String>,
}

/// Sentiment tuple: 6 leading values of the 7-value tone column.
/// Components that fail to parse are absent so they never bias averages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToneMetrics {
    /// Overall tone on the source's native -100..+100 scale.
    pub overall: Option<f64>,
    pub positive_pct: Option<f64>,
    pub negative_pct: Option<f64>,
    pub polarity: Option<f64>,
    pub activity_density: Option<f64>,
    pub self_ref: Option<f64>,
}

/// A theme code with its mention count within one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeCount {
    pub theme: String,
    pub count: u32,
}

/// Timestamps arrive as `YYYYMMDDHHMMSS` (14 digits, UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Parse the enhanced-locations column. Blocks with fewer than 7 parts are
/// dropped; unparseable numerics become `None`.
pub fn parse_locations(field: &str) -> Vec<EventLocation> {
    let mut out = Vec::new();
    for block in field.split(';') {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let parts: Vec<&str> = block.split('#').collect();
        if parts.len() < 7 {
            continue;
        }
        let location_type = match parts[0].parse::<u8>() {
            Ok(t @ 1..=5) => t,
            _ => continue,
        };
        let country_code = parts[2].trim().to_ascii_uppercase();
        out.push(EventLocation {
            location_type,
            name: parts[1].trim().to_string(),
            country_code,
            admin_code: non_empty(parts[3]),
            lat: parse_f64_opt(parts[5]),
            lon: parse_f64_opt(parts[6]),
            feature_id: parts.get(7).and_then(|p| non_empty(p)),
        });
    }
    out
}

/// Parse the 7-value tone column. A column with fewer than 7 values yields
/// no tone at all rather than a half-filled tuple.
pub fn parse_tone(field: &str) -> Option<ToneMetrics> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    let values: Vec<&str> = field.split(',').collect();
    if values.len() < 7 {
        return None;
    }
    Some(ToneMetrics {
        overall: parse_f64_opt(values[0]),
        positive_pct: parse_f64_opt(values[1]),
        negative_pct: parse_f64_opt(values[2]),
        polarity: parse_f64_opt(values[3]),
        activity_density: parse_f64_opt(values[4]),
        self_ref: parse_f64_opt(values[5]),
    })
}

/// Parse the enhanced-themes column (`CODE,offset;CODE,offset;…`) into
/// per-theme mention counts, first-occurrence order preserved.
pub fn parse_theme_mentions(field: &str) -> Vec<ThemeCount> {
    let mut out: Vec<ThemeCount> = Vec::new();
    for pair in field.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        // the offset is the last comma-separated token; the code may not
        // contain commas, but rsplit keeps odd inputs from shifting the code
        let code = pair.rsplit_once(',').map(|(c, _)| c).unwrap_or(pair);
        let code = code.trim();
        if !is_theme_code(code) {
            continue;
        }
        match out.iter_mut().find(|tc| tc.theme == code) {
            Some(tc) => tc.count += 1,
            None => out.push(ThemeCount {
                theme: code.to_string(),
                count: 1,
            }),
        }
    }
    out
}

/// Parse the plain themes column (`CODE;CODE;…`), deduplicated in order.
pub fn parse_plain_themes(field: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for code in field.split(';') {
        let code = code.trim();
        if is_theme_code(code) && !out.iter().any(|c| c == code) {
            out.push(code.to_string());
        }
    }
    out
}

/// Parse a `;`-separated name list (persons, organizations).
pub fn parse_name_list(field: &str) -> Vec<String> {
    field
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Theme codes are uppercase taxonomy identifiers; anything else in the
/// column is feed noise.
fn is_theme_code(code: &str) -> bool {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Z0-9_]+$").unwrap());
    code.len() > 2 && re.is_match(code)
}

fn parse_f64_opt(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
