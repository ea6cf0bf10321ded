// src/countries.rs
//! Static country reference data. Owned externally; the engine reads an
//! immutable snapshot taken at tick start so one tick sees a consistent set.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Immutable lookup table of monitored countries.
#[derive(Debug, Clone, Default)]
pub struct CountrySet {
    by_code: HashMap<String, Country>,
}

impl CountrySet {
    pub fn new(countries: Vec<Country>) -> Self {
        let mut by_code = HashMap::with_capacity(countries.len());
        for c in countries {
            by_code.insert(c.code.to_ascii_uppercase(), c);
        }
        Self { by_code }
    }

    /// The default monitored set with approximate centroids.
    pub fn builtin() -> Self {
        let seed = [
            ("US", "United States", 39.78, -100.45),
            ("CO", "Colombia", 4.57, -74.30),
            ("BR", "Brazil", -14.24, -51.93),
            ("MX", "Mexico", 23.63, -102.55),
            ("AR", "Argentina", -38.42, -63.62),
            ("GB", "United Kingdom", 55.38, -3.44),
            ("FR", "France", 46.23, 2.21),
            ("DE", "Germany", 51.17, 10.45),
            ("ES", "Spain", 40.46, -3.75),
            ("IT", "Italy", 41.87, 12.57),
        ];
        Self::new(
            seed.iter()
                .map(|(code, name, lat, lon)| Country {
                    code: (*code).to_string(),
                    name: (*name).to_string(),
                    centroid_lat: *lat,
                    centroid_lon: *lon,
                    is_active: true,
                })
                .collect(),
        )
    }

    /// Load reference data from a file. TOML carries a `[[countries]]` array
    /// of tables; JSON is a bare array of country objects.
    pub fn load_from(path: &Path) -> Result<Self> {
        #[derive(Deserialize)]
        struct TomlFile {
            countries: Vec<Country>,
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading countries from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let countries = if ext == "json" {
            serde_json::from_str::<Vec<Country>>(&content)
                .with_context(|| format!("parsing countries {}", path.display()))?
        } else {
            toml::from_str::<TomlFile>(&content)
                .with_context(|| format!("parsing countries {}", path.display()))?
                .countries
        };
        Ok(Self::new(countries))
    }

    pub fn get(&self, code: &str) -> Option<&Country> {
        self.by_code.get(&code.to_ascii_uppercase())
    }

    pub fn is_active(&self, code: &str) -> bool {
        self.get(code).map(|c| c.is_active).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Cheap shareable snapshot for one tick.
    pub fn snapshot(self) -> Arc<CountrySet> {
        Arc::new(self)
    }
}
