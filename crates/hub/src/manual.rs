//! Manual zone runs. A manual run takes the command gate, opens the valve
//! directly (zone state is not touched) and holds the gate until a background
//! task closes the valve or the run is stopped.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::gate::{CommandGate, GateError};
use crate::state::SharedState;
use crate::valve::Actuator;

/// Longest manual run accepted.
pub const MAX_MANUAL_MINUTES: u64 = 90;

/// Name a manual run holds the command gate under.
pub const GATE_HOLDER: &str = "manual";

/// Wait between close attempts once a timed run's close has failed.
const CLOSE_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ManualError {
    #[error(transparent)]
    Busy(#[from] GateError),

    #[error("zone {zone} out of range [0, {num_valves})")]
    BadZone { zone: u32, num_valves: u32 },

    #[error("{0} minutes out of range [0, {MAX_MANUAL_MINUTES}]")]
    BadDuration(u64),

    #[error("actuator: {0:#}")]
    Actuator(anyhow::Error),
}

struct ActiveRun {
    zone: u32,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ManualRunner {
    gate: CommandGate,
    actuator: Arc<dyn Actuator>,
    shared: SharedState,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl ManualRunner {
    pub fn new(gate: CommandGate, actuator: Arc<dyn Actuator>, shared: SharedState) -> Self {
        Self {
            gate,
            actuator,
            shared,
            active: Arc::new(Mutex::new(None)),
        }
    }

    fn check_zone(&self, zone: u32) -> Result<(), ManualError> {
        let num_valves = self.actuator.num_valves();
        if zone >= num_valves {
            return Err(ManualError::BadZone { zone, num_valves });
        }
        Ok(())
    }

    /// Open `zone` for `minutes`. Fails fast with [`ManualError::Busy`] when
    /// the daily pass or another manual run holds the gate.
    pub async fn start(&self, zone: u32, minutes: u64) -> Result<(), ManualError> {
        self.check_zone(zone)?;
        if minutes > MAX_MANUAL_MINUTES {
            return Err(ManualError::BadDuration(minutes));
        }

        let guard = self.gate.try_acquire(GATE_HOLDER)?;
        self.actuator.open(zone).map_err(ManualError::Actuator)?;
        info!(zone, minutes, "manual run started");
        self.shared.write().await.record_valve(zone, true);

        let actuator = Arc::clone(&self.actuator);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
            // The gate stays held until the valve is confirmed closed.
            while let Err(e) = actuator.close(zone) {
                error!(zone, "manual run: close failed: {e:#}");
                shared
                    .write()
                    .await
                    .record_error(format!("manual run: close zone {zone}: {e:#}"));
                tokio::time::sleep(CLOSE_RETRY).await;
            }
            info!(zone, "manual run finished");
            shared.write().await.record_valve(zone, false);
            drop(guard);
        });

        *self.active.lock().await = Some(ActiveRun { zone, handle });
        Ok(())
    }

    /// Close `zone`. If a manual run is active on it, cancel it and release
    /// the gate. Returns whether a run was cancelled.
    ///
    /// Any other zone is closed only while the gate is free or held by a
    /// manual run; during the daily pass the zone is owned by the scheduler
    /// and the stop fails with [`ManualError::Busy`].
    pub async fn stop(&self, zone: u32) -> Result<bool, ManualError> {
        self.check_zone(zone)?;

        let mut active = self.active.lock().await;
        let own = active
            .as_ref()
            .is_some_and(|r| r.zone == zone && !r.handle.is_finished());
        let _guard = if own {
            None
        } else {
            match self.gate.try_acquire(GATE_HOLDER) {
                Ok(guard) => Some(guard),
                Err(GateError::Busy { holder: GATE_HOLDER }) => None,
                Err(e) => return Err(e.into()),
            }
        };

        self.actuator.close(zone).map_err(ManualError::Actuator)?;
        self.shared.write().await.record_valve(zone, false);
        if !own {
            return Ok(false);
        }

        let Some(run) = active.take() else {
            return Ok(false);
        };
        run.handle.abort();
        // Wait for the task to drop its gate guard.
        let _ = run.handle.await;
        info!(zone, "manual run stopped");
        Ok(true)
    }

    /// Zone of the manual run in progress, if any.
    pub async fn active_zone(&self) -> Option<u32> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|r| !r.handle.is_finished())
            .map(|r| r.zone)
    }
}
