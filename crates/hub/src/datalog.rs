//! History sink for conditions and runtimes. One JSON file per day:
//!
//! - `<root>/conditions/2026/07/15.log`
//! - `<root>/runtimes/2026/07/15.log`
//!
//! Writes overwrite the day's file. Nothing here is read back by the daily
//! pass; it exists for the status API.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::debug;

use crate::conditions::Conditions;

const CONDITIONS_SUBDIR: &str = "conditions";
const RUNTIMES_SUBDIR: &str = "runtimes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionsEntry {
    pub date: String,
    pub temp_f: f64,
    pub precip_in: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimesEntry {
    pub date: String,
    /// Minutes per zone number; index = zone, 0 for zones that did not run.
    pub minutes: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct DataLogger {
    root: PathBuf,
}

impl DataLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn day_path(&self, subdir: &str, date: Date) -> PathBuf {
        self.root
            .join(subdir)
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", u8::from(date.month())))
            .join(format!("{:02}.log", date.day()))
    }

    pub async fn write_conditions(&self, date: Date, c: &Conditions) -> Result<()> {
        let entry = ConditionsEntry {
            date: date.to_string(),
            temp_f: c.temp_f,
            precip_in: c.precip_in,
        };
        write_json(&self.day_path(CONDITIONS_SUBDIR, date), &entry).await
    }

    pub async fn read_conditions(&self, date: Date) -> Result<Option<ConditionsEntry>> {
        read_json(&self.day_path(CONDITIONS_SUBDIR, date)).await
    }

    pub async fn write_runtimes(&self, date: Date, minutes: &[u64]) -> Result<()> {
        let entry = RuntimesEntry {
            date: date.to_string(),
            minutes: minutes.to_vec(),
        };
        write_json(&self.day_path(RUNTIMES_SUBDIR, date), &entry).await
    }

    pub async fn read_runtimes(&self, date: Date) -> Result<Option<RuntimesEntry>> {
        read_json(&self.day_path(RUNTIMES_SUBDIR, date)).await
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let json = serde_json::to_vec(value)?;
    tokio::fs::write(path, &json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), "data log written");
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("bad data log entry {}", path.display()))?;
    Ok(Some(value))
}
