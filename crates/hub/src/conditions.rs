//! Weather conditions for the daily pass.
//!
//! The controller never talks to a weather service itself. An external
//! fetcher drops a JSON report per location into a directory:
//!
//! ```json
//! { "yesterday": { "temp_f": 71.0, "precip_in": 0.0 },
//!   "forecast":  { "temp_f": 78.5, "precip_in": 0.05 } }
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    /// Mean temperature, °F.
    pub temp_f: f64,
    /// Total precipitation, inches.
    pub precip_in: f64,
}

impl Conditions {
    fn validate(&self) -> Result<()> {
        if !self.temp_f.is_finite() {
            bail!("temp_f {} is not a number", self.temp_f);
        }
        if !(self.precip_in.is_finite() && self.precip_in >= 0.0) {
            bail!("precip_in {} must be a non-negative number", self.precip_in);
        }
        Ok(())
    }
}

pub trait ConditionsSource: Send + Sync + 'static {
    /// Observed conditions for the previous calendar day.
    fn yesterday(&self, location: &str) -> Result<Conditions>;
    /// Forecast for the current day.
    fn forecast(&self, location: &str) -> Result<Conditions>;
}

#[derive(Debug, Deserialize)]
struct ConditionsReport {
    yesterday: Conditions,
    forecast: Conditions,
}

/// Reads `<dir>/<location>.json`.
#[derive(Debug, Clone)]
pub struct FileConditions {
    dir: PathBuf,
}

impl FileConditions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read(&self, location: &str) -> Result<ConditionsReport> {
        if location.is_empty() || location.contains(['/', '\\']) || location.starts_with('.') {
            bail!("invalid location '{location}'");
        }
        let path = self.dir.join(format!("{location}.json"));
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read conditions: {}", path.display()))?;
        let report: ConditionsReport = serde_json::from_str(&contents)
            .with_context(|| format!("bad conditions json: {}", path.display()))?;
        report.yesterday.validate().context("yesterday")?;
        report.forecast.validate().context("forecast")?;
        Ok(report)
    }
}

impl ConditionsSource for FileConditions {
    fn yesterday(&self, location: &str) -> Result<Conditions> {
        Ok(self.read(location)?.yesterday)
    }

    fn forecast(&self, location: &str) -> Result<Conditions> {
        Ok(self.read(location)?.forecast)
    }
}
