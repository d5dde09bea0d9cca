//! Zone state machine. The only writer of per-zone state and VWC keys, and
//! the only path from the daily pass to the actuator.
//!
//! ```text
//! Idle ──turn_on──▶ Running ──turn_off──▶ Complete ──reset_zones──▶ Idle
//!                      │
//!                      └──open failed──▶ Unknown
//! ```
//!
//! A zone found `Running` or `Unknown` at the start of a pass was interrupted
//! (crash, restart, actuator fault). The pass force-closes it and does not run
//! it again that day.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::kv::{Key, KvStore};
use crate::valve::Actuator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ZoneState {
    Unknown,
    Idle,
    Running,
    Complete,
}

impl ZoneState {
    pub fn as_str(self) -> &'static str {
        match self {
            ZoneState::Unknown => "Unknown",
            ZoneState::Idle => "Idle",
            ZoneState::Running => "Running",
            ZoneState::Complete => "Complete",
        }
    }
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZoneState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(ZoneState::Unknown),
            "Idle" => Ok(ZoneState::Idle),
            "Running" => Ok(ZoneState::Running),
            "Complete" => Ok(ZoneState::Complete),
            other => Err(format!("unknown zone state '{other}'")),
        }
    }
}

#[derive(Clone)]
pub struct ZoneController<S> {
    kv: S,
    actuator: Arc<dyn Actuator>,
}

impl<S: KvStore> ZoneController<S> {
    pub fn new(kv: S, actuator: Arc<dyn Actuator>) -> Self {
        Self { kv, actuator }
    }

    pub fn kv(&self) -> &S {
        &self.kv
    }

    /// Persisted state of zone `n`. No record reads as `Idle`; a record that
    /// isn't a known state reads as `Unknown`.
    pub async fn state(&self, n: u32) -> Result<ZoneState> {
        let raw = self
            .kv
            .get(&Key::ZoneState(n))
            .await
            .with_context(|| format!("reading state of zone {n}"))?;
        Ok(match raw {
            None => ZoneState::Idle,
            Some(s) => s.parse().unwrap_or_else(|e| {
                warn!(zone = n, "{e}, treating as Unknown");
                ZoneState::Unknown
            }),
        })
    }

    /// Persist a state without touching the valve.
    pub async fn set_state(&self, n: u32, state: ZoneState) -> Result<()> {
        self.kv
            .set(&Key::ZoneState(n), state.as_str())
            .await
            .with_context(|| format!("setting zone {n} to {state}"))
    }

    /// Persisted VWC of zone `n`, 0 when never written.
    pub async fn vwc(&self, n: u32) -> Result<f64> {
        let raw = self
            .kv
            .get(&Key::ZoneVwc(n))
            .await
            .with_context(|| format!("reading vwc of zone {n}"))?;
        match raw {
            None => Ok(0.0),
            Some(s) => s
                .parse()
                .with_context(|| format!("zone {n}: stored vwc '{s}' is not a number")),
        }
    }

    /// Move every `Complete` zone in `0..num_zones` back to `Idle`.
    pub async fn reset_zones(&self, num_zones: u32) -> Result<()> {
        for n in 0..num_zones {
            if self.state(n).await? == ZoneState::Complete {
                self.set_state(n, ZoneState::Idle).await?;
                info!(zone = n, "reset Complete -> Idle");
            }
        }
        Ok(())
    }

    /// Persist `Running`, then open the valve. If the valve fails to open the
    /// zone is left `Unknown`.
    pub async fn turn_on(&self, n: u32) -> Result<()> {
        self.set_state(n, ZoneState::Running).await?;
        if let Err(e) = self.actuator.open(n) {
            if let Err(se) = self.set_state(n, ZoneState::Unknown).await {
                warn!(zone = n, "could not mark zone Unknown: {se:#}");
            }
            return Err(e.context(format!("opening valve {n}")));
        }
        info!(zone = n, "zone on");
        Ok(())
    }

    /// Close the valve, then persist `Complete`. State is left alone when the
    /// close fails since the valve may still be open.
    pub async fn turn_off(&self, n: u32) -> Result<()> {
        self.actuator
            .close(n)
            .with_context(|| format!("closing valve {n}"))?;
        self.set_state(n, ZoneState::Complete).await?;
        info!(zone = n, "zone off");
        Ok(())
    }

    /// On, wait `duration`, off. `skip_wait` drops the wait (dry runs, tests).
    pub async fn run(&self, n: u32, duration: Duration, skip_wait: bool) -> Result<()> {
        info!(zone = n, minutes = duration.as_secs() / 60, "running zone");
        self.turn_on(n).await?;
        if !skip_wait {
            tokio::time::sleep(duration).await;
        }
        self.turn_off(n).await
    }

    /// Close every valve the actuator knows about. Zone state is untouched.
    pub fn turn_all_off(&self) -> Result<()> {
        self.actuator.close_all().context("closing all valves")
    }

    /// Mark zone `n` `Complete` with the given VWC in one store transaction.
    pub async fn update_state_and_vwc(&self, n: u32, vwc: f64) -> Result<()> {
        self.kv
            .set_all(&[
                (Key::ZoneState(n), ZoneState::Complete.as_str().to_string()),
                (Key::ZoneVwc(n), vwc.to_string()),
            ])
            .await
            .with_context(|| format!("updating zone {n} to Complete with vwc {vwc:.2}"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
