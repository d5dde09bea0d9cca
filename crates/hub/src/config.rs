//! TOML system configuration: global schedule, soils, zones and the ET
//! range map. The file is re-read at the start of every daily pass and is
//! accepted all-or-nothing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use time::Time;

use crate::range::RangeMapper;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub global: GlobalEntry,
    pub algorithm: AlgorithmEntry,
    #[serde(default)]
    pub soils: Vec<SoilEntry>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
pub struct GlobalEntry {
    /// Scheduled time of day, `HH:MM` (24h, local time).
    pub run_time_am: String,
    /// Location identifier handed to the conditions source (airport code).
    pub location: String,
}

#[derive(Debug, Deserialize)]
pub struct AlgorithmEntry {
    /// Alternating `"low-high"`, `"value"` tokens: temperature °F → ET %.
    pub et_pct_map: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SoilEntry {
    pub name: String,
    pub max_vwc: f64,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub number: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub gets_rain: bool,
    pub soil: String,
    pub min_vwc: f64,
    pub max_vwc: f64,
    pub run_time_multiplier: f64,
    pub et_rate: f64,
    pub depth_in: f64,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Validated system config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub run_time_am: Time,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoilConfig {
    pub name: String,
    pub max_vwc: f64,
}

#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub number: u32,
    pub name: String,
    pub enabled: bool,
    pub gets_rain: bool,
    pub soil: SoilConfig,
    pub min_vwc: f64,
    pub max_vwc: f64,
    pub run_time_multiplier: f64,
    pub et_rate: f64,
    pub depth_in: f64,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub global: GlobalConfig,
    pub zones: BTreeMap<u32, ZoneConfig>,
    pub et_pct: RangeMapper,
}

impl SystemConfig {
    /// One past the highest configured zone number. Zone numbers may have
    /// gaps; missing numbers are skipped during iteration.
    pub fn num_zones(&self) -> u32 {
        self.zones
            .keys()
            .next_back()
            .map_or(0, |n| n.saturating_add(1))
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Highest zone number accepted. Zone numbers index per-zone vectors.
pub const MAX_ZONE_NUMBER: u32 = 255;

const ET_RATE_RANGE: (f64, f64) = (0.01, 1.0);
const MULTIPLIER_RANGE: (f64, f64) = (0.1, 10.0);
const DEPTH_RANGE: (f64, f64) = (1.0, 48.0);

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl ConfigFile {
    /// Validate the whole file and build a [`SystemConfig`]. Returns an error
    /// describing every violation found (not just the first one).
    pub fn into_system(self) -> Result<SystemConfig> {
        let mut errors: Vec<String> = Vec::new();

        let run_time_am = match parse_time_of_day(&self.global.run_time_am) {
            Some(t) => Some(t),
            None => {
                errors.push(format!(
                    "global: run_time_am '{}' is not HH:MM",
                    self.global.run_time_am
                ));
                None
            }
        };
        if self.global.location.trim().is_empty() {
            errors.push("global: location is empty".to_string());
        }

        let et_pct = match RangeMapper::parse(&self.algorithm.et_pct_map) {
            Ok(rm) => Some(rm),
            Err(e) => {
                errors.push(format!("algorithm: et_pct_map: {e:#}"));
                None
            }
        };

        let soils = self.validate_soils(&mut errors);
        self.validate_zones(&soils, &mut errors);

        if !errors.is_empty() {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }

        // Validation passed, so every conversion below is infallible.
        let (Some(run_time_am), Some(et_pct)) = (run_time_am, et_pct) else {
            bail!("config validation failed");
        };
        let zones = self
            .zones
            .into_iter()
            .filter_map(|z| {
                let soil = soils.get(&z.soil)?.clone();
                Some((
                    z.number as u32,
                    ZoneConfig {
                        number: z.number as u32,
                        name: z.name,
                        enabled: z.enabled,
                        gets_rain: z.gets_rain,
                        soil,
                        min_vwc: z.min_vwc,
                        max_vwc: z.max_vwc,
                        run_time_multiplier: z.run_time_multiplier,
                        et_rate: z.et_rate,
                        depth_in: z.depth_in,
                    },
                ))
            })
            .collect();

        Ok(SystemConfig {
            global: GlobalConfig {
                run_time_am,
                location: self.global.location,
            },
            zones,
            et_pct,
        })
    }

    fn validate_soils(&self, errors: &mut Vec<String>) -> BTreeMap<String, SoilConfig> {
        let mut soils = BTreeMap::new();

        for (i, s) in self.soils.iter().enumerate() {
            if s.name.trim().is_empty() {
                errors.push(format!("soils[{i}]: name is empty"));
                continue;
            }
            if !pct_in_range(s.max_vwc) {
                errors.push(format!(
                    "soil '{}': max_vwc {} out of range [0, 100]",
                    s.name, s.max_vwc
                ));
            }
            let prev = soils.insert(
                s.name.clone(),
                SoilConfig {
                    name: s.name.clone(),
                    max_vwc: s.max_vwc,
                },
            );
            if prev.is_some() {
                errors.push(format!("soil '{}': duplicate name", s.name));
            }
        }

        soils
    }

    fn validate_zones(&self, soils: &BTreeMap<String, SoilConfig>, errors: &mut Vec<String>) {
        if self.zones.is_empty() {
            errors.push("at least one zone must be configured".to_string());
        }

        let mut seen_numbers: HashSet<i64> = HashSet::new();

        for z in &self.zones {
            let ctx = format!("zone {}:{}", z.number, z.name);

            // ── Identity ────────────────────────────────────────
            if z.number < 0 || z.number > i64::from(MAX_ZONE_NUMBER) {
                errors.push(format!(
                    "{ctx}: zone number {} out of range [0, {MAX_ZONE_NUMBER}]",
                    z.number
                ));
            } else if !seen_numbers.insert(z.number) {
                errors.push(format!("{ctx}: duplicate zone number"));
            }
            if z.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            // ── Moisture bounds ─────────────────────────────────
            if !pct_in_range(z.min_vwc) {
                errors.push(format!(
                    "{ctx}: min_vwc {:.3} out of range [0, 100]",
                    z.min_vwc
                ));
            }
            if !pct_in_range(z.max_vwc) {
                errors.push(format!(
                    "{ctx}: max_vwc {:.3} out of range [0, 100]",
                    z.max_vwc
                ));
            }
            if z.min_vwc > z.max_vwc {
                errors.push(format!(
                    "{ctx}: min_vwc ({}) must not exceed max_vwc ({})",
                    z.min_vwc, z.max_vwc
                ));
            }

            // ── Soil reference ──────────────────────────────────
            match soils.get(&z.soil) {
                None => errors.push(format!(
                    "{ctx}: soil '{}' does not match any defined soil",
                    z.soil
                )),
                Some(soil) if z.max_vwc > soil.max_vwc => errors.push(format!(
                    "{ctx}: max_vwc ({}) exceeds soil '{}' max_vwc ({})",
                    z.max_vwc, soil.name, soil.max_vwc
                )),
                Some(_) => {}
            }

            // ── Rates ───────────────────────────────────────────
            if !in_range(z.et_rate, ET_RATE_RANGE) {
                errors.push(format!(
                    "{ctx}: et_rate must be in the range {} - {}, have {:.3}",
                    ET_RATE_RANGE.0, ET_RATE_RANGE.1, z.et_rate
                ));
            }
            if !in_range(z.run_time_multiplier, MULTIPLIER_RANGE) {
                errors.push(format!(
                    "{ctx}: run_time_multiplier must be in the range {} - {}, have {:.3}",
                    MULTIPLIER_RANGE.0, MULTIPLIER_RANGE.1, z.run_time_multiplier
                ));
            }
            if !in_range(z.depth_in, DEPTH_RANGE) {
                errors.push(format!(
                    "{ctx}: depth_in must be in the range {} - {}, have {:.3}",
                    DEPTH_RANGE.0, DEPTH_RANGE.1, z.depth_in
                ));
            }
        }
    }
}

fn pct_in_range(v: f64) -> bool {
    (0.0..=100.0).contains(&v)
}

fn in_range(v: f64, (lo, hi): (f64, f64)) -> bool {
    (lo..=hi).contains(&v)
}

/// Parse `HH:MM` (24h) into a time of day.
pub fn parse_time_of_day(s: &str) -> Option<Time> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u8 = h.parse().ok()?;
    let m: u8 = m.parse().ok()?;
    Time::from_hms(h, m, 0).ok()
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<SystemConfig> {
    let file: ConfigFile = toml::from_str(contents).context("failed to parse config")?;
    file.into_system()
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &Path) -> Result<SystemConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    parse(&contents).with_context(|| format!("invalid config: {}", path.display()))
}

/// Where the daily pass gets its configuration from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Inline(String),
}

impl ConfigSource {
    pub fn load(&self) -> Result<SystemConfig> {
        match self {
            ConfigSource::File(path) => load(path),
            ConfigSource::Inline(contents) => parse(contents),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
