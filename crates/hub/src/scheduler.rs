//! Daily irrigation pass.
//!
//! The loop wakes on a fixed interval and calls [`Controller::run_once`].
//! Each wake-up either finds the day's pass already committed, finds it too
//! early, or performs the pass: reset yesterday's zones, update every zone's
//! water balance from yesterday's weather, run the zones that fell below
//! their minimum, then commit the last-run date. The date is the commit
//! point; a crash before it redoes the pass (zones already `Complete` are
//! skipped), a crash after it waits for tomorrow.
//!
//! ```text
//! wake ─▶ gate ─▶ sweep ─▶ ran today? ─yes─▶ predict tomorrow ─▶ done
//!                              │no
//!                              ▼
//!                   config ─▶ reset (once/day) ─▶ too early? ─yes─▶ done
//!                                                     │no
//!                                                     ▼
//!                          conditions ─▶ zones (ascending) ─▶ commit date
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::alg::WaterBalance;
use crate::clock::{LocalZone, SystemZone};
use crate::conditions::{Conditions, ConditionsSource};
use crate::config::{ConfigSource, SystemConfig, ZoneConfig};
use crate::datalog::DataLogger;
use crate::gate::{CommandGate, GateError};
use crate::kv::{Key, KvStore};
use crate::report::ErrorReporter;
use crate::state::SharedState;
use crate::zone::{ZoneController, ZoneState};

/// Name the daily pass holds the command gate under.
pub const GATE_HOLDER: &str = "scheduler";

/// Default wake-up interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct RunParams {
    /// Time between wake-ups.
    pub interval: Duration,
    /// Skip the on/off wait (dry runs).
    pub skip_wait: bool,
    /// Log tomorrow's predicted runtimes on wake-ups after the pass.
    pub predict: bool,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            skip_wait: false,
            predict: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A manual command held the gate; nothing was done.
    Busy,
    /// Today's pass was already committed.
    AlreadyRan,
    /// Before the configured run time.
    TooEarly,
    /// The pass ran and the date was committed.
    Completed {
        ran: Vec<(u32, Duration)>,
        zone_errors: usize,
    },
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Busy => write!(f, "skipped, command gate busy"),
            CycleOutcome::AlreadyRan => write!(f, "already ran today"),
            CycleOutcome::TooEarly => write!(f, "before scheduled run time"),
            CycleOutcome::Completed { ran, zone_errors } => {
                write!(f, "completed, {} zone(s) watered", ran.len())?;
                if *zone_errors > 0 {
                    write!(f, ", {zone_errors} zone error(s)")?;
                }
                Ok(())
            }
        }
    }
}

/// What the water balance says one zone needs today.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Plan {
    new_vwc: f64,
    /// `None` when the zone is at or above its minimum.
    runtime: Option<Duration>,
}

fn plan_zone(
    wb: &WaterBalance,
    zone: &ZoneConfig,
    current_vwc: f64,
    observed: Conditions,
    forecast_precip_in: f64,
    date: Date,
) -> Plan {
    let rain = |p: f64| if zone.gets_rain { p } else { 0.0 };
    let new_vwc = wb.calculate_vwc(
        current_vwc,
        observed.temp_f,
        rain(observed.precip_in),
        date,
        zone,
    );
    if new_vwc >= zone.min_vwc {
        return Plan {
            new_vwc,
            runtime: None,
        };
    }
    let base = wb.calculate_runtime(new_vwc, zone.max_vwc, rain(forecast_precip_in), zone);
    Plan {
        new_vwc,
        runtime: Some(scale(base, zone.run_time_multiplier)),
    }
}

/// `d * factor`, saturating where `Duration::mul_f64` would panic.
fn scale(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(if factor > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn whole_minutes(d: Duration) -> u64 {
    (d.as_secs_f64() / 60.0).round() as u64
}

/// Data-log runtimes: index = zone number, 0 for gaps and zones that did not
/// run. Bounded by the zone number cap enforced at config validation.
fn runtimes_by_zone(config: &SystemConfig, minutes: &BTreeMap<u32, u64>) -> Vec<u64> {
    (0..config.num_zones())
        .map(|n| minutes.get(&n).copied().unwrap_or(0))
        .collect()
}

pub fn parse_date(s: &str) -> Result<Date> {
    Date::parse(s.trim(), time::macros::format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("bad date '{s}'"))
}

pub struct Controller<S, R> {
    config: ConfigSource,
    zones: ZoneController<S>,
    conditions: Arc<dyn ConditionsSource>,
    datalog: DataLogger,
    reporter: R,
    gate: CommandGate,
    shared: SharedState,
    params: RunParams,
    zone: Arc<dyn LocalZone>,
}

impl<S: KvStore, R: ErrorReporter> Controller<S, R> {
    pub fn new(
        config: ConfigSource,
        zones: ZoneController<S>,
        conditions: Arc<dyn ConditionsSource>,
        datalog: DataLogger,
        reporter: R,
        gate: CommandGate,
        shared: SharedState,
    ) -> Self {
        Self {
            config,
            zones,
            conditions,
            datalog,
            reporter,
            gate,
            shared,
            params: RunParams::default(),
            zone: Arc::new(SystemZone),
        }
    }

    pub fn with_params(mut self, params: RunParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_zone(mut self, zone: Arc<dyn LocalZone>) -> Self {
        self.zone = zone;
        self
    }

    /// Wake up forever, one [`run_once`](Self::run_once) per interval.
    pub async fn run(&self) {
        info!(
            interval_min = self.params.interval.as_secs() / 60,
            skip_wait = self.params.skip_wait,
            "controller loop started"
        );
        {
            let mut st = self.shared.write().await;
            st.record_system("controller loop started".to_string());
        }
        loop {
            match self.wake(OffsetDateTime::now_utc()).await {
                Ok(outcome) => info!(%outcome, "wake-up done"),
                // Already reported.
                Err(e) => debug!("wake-up failed: {e:#}"),
            }
            tokio::time::sleep(self.params.interval).await;
        }
    }

    /// One wake-up at `utc`, converted with the offset in force at that
    /// instant.
    pub async fn wake(&self, utc: OffsetDateTime) -> Result<CycleOutcome> {
        self.run_once(self.zone.to_local(utc)).await
    }

    /// One wake-up. `now` is local wall-clock time. Every error returned has
    /// already been passed through the reporter.
    pub async fn run_once(&self, now: OffsetDateTime) -> Result<CycleOutcome> {
        info!(now = %now, "run_once");
        let _guard = match self.gate.try_acquire(GATE_HOLDER) {
            Ok(g) => g,
            Err(GateError::Busy { holder }) => {
                info!(holder, "command in progress, will retry next wake-up");
                return Ok(CycleOutcome::Busy);
            }
        };

        match self.cycle(now).await {
            Ok(outcome) => {
                self.shared.write().await.record_cycle(outcome.to_string());
                Ok(outcome)
            }
            Err(e) => {
                let e = self.reporter.report(e).await;
                self.shared
                    .write()
                    .await
                    .record_cycle(format!("failed: {e:#}"));
                Err(e)
            }
        }
    }

    async fn cycle(&self, now: OffsetDateTime) -> Result<CycleOutcome> {
        // Nothing should be open at this point.
        if let Err(e) = self.zones.turn_all_off() {
            self.reporter.report(e.context("safety sweep")).await;
        }

        let today = now.date();
        if self.read_date(Key::LastRunDate).await? == Some(today) {
            if self.params.predict {
                self.predict_tomorrow(today).await;
            }
            return Ok(CycleOutcome::AlreadyRan);
        }

        let config = self.config.load().context("loading config")?;
        info!(zones = config.zones.len(), et_pct = %config.et_pct, "config loaded");

        self.reset_once(today, &config)
            .await
            .context("daily zone reset")?;

        let run_time = config.global.run_time_am;
        if now.time() < run_time {
            debug!(now = %now.time(), scheduled = %run_time, "too early");
            return Ok(CycleOutcome::TooEarly);
        }

        let location = &config.global.location;
        let observed = self
            .conditions
            .yesterday(location)
            .with_context(|| format!("yesterday's conditions for {location}"))?;
        let forecast = self
            .conditions
            .forecast(location)
            .with_context(|| format!("forecast for {location}"))?;
        info!(
            yesterday_temp_f = observed.temp_f,
            yesterday_precip_in = observed.precip_in,
            forecast_temp_f = forecast.temp_f,
            forecast_precip_in = forecast.precip_in,
            "conditions"
        );
        self.log_conditions(today, observed, forecast).await;

        let wb = WaterBalance::new(config.et_pct.clone());
        let mut minutes = BTreeMap::new();
        let mut ran = Vec::new();
        let mut zone_errors = 0;

        for zone in config.zones.values() {
            match self
                .process_zone(&wb, zone, observed, forecast.precip_in, today)
                .await
            {
                Ok(Some(d)) => {
                    minutes.insert(zone.number, whole_minutes(d));
                    ran.push((zone.number, d));
                }
                Ok(None) => {}
                Err(e) => {
                    zone_errors += 1;
                    self.reporter.report(e).await;
                }
            }
        }

        let runtimes = runtimes_by_zone(&config, &minutes);
        if let Err(e) = self.datalog.write_runtimes(today, &runtimes).await {
            self.reporter.report(e.context("writing runtimes")).await;
        }

        self.zones
            .kv()
            .set(&Key::LastRunDate, &today.to_string())
            .await
            .context("committing last run date")?;

        Ok(CycleOutcome::Completed { ran, zone_errors })
    }

    /// Evaluate and, if needed, water one zone. Returns the run time when the
    /// valve was actually opened.
    async fn process_zone(
        &self,
        wb: &WaterBalance,
        zone: &ZoneConfig,
        observed: Conditions,
        forecast_precip_in: f64,
        today: Date,
    ) -> Result<Option<Duration>> {
        let n = zone.number;
        let mut excluded = false;
        match self.zones.state(n).await? {
            ZoneState::Complete => {
                debug!(zone = n, "already served today");
                return Ok(None);
            }
            state @ (ZoneState::Running | ZoneState::Unknown) => {
                // Unknown run length: close it and leave it for today.
                warn!(zone = n, %state, "zone interrupted, forcing off");
                self.zones.turn_off(n).await?;
                self.shared
                    .write()
                    .await
                    .record_scheduler(format!("zone {n} found {state}, forced off"));
                excluded = true;
            }
            ZoneState::Idle => {}
        }

        let current = self.zones.vwc(n).await?;
        let plan = plan_zone(wb, zone, current, observed, forecast_precip_in, today);
        info!(zone = n, from = current, to = plan.new_vwc, "vwc");

        let Some(runtime) = plan.runtime else {
            self.zones.update_state_and_vwc(n, plan.new_vwc).await?;
            return Ok(None);
        };

        if !zone.enabled {
            info!(zone = n, "below minimum but disabled, not running");
            self.zones.update_state_and_vwc(n, plan.new_vwc).await?;
            return Ok(None);
        }
        if excluded || runtime.is_zero() {
            info!(zone = n, excluded, "not running, vwc set to max");
            self.zones.update_state_and_vwc(n, zone.max_vwc).await?;
            return Ok(None);
        }

        info!(
            zone = n,
            min_vwc = zone.min_vwc,
            multiplier = zone.run_time_multiplier,
            minutes = whole_minutes(runtime),
            "below minimum, running"
        );
        self.shared.write().await.record_valve(n, true);
        let result = self.zones.run(n, runtime, self.params.skip_wait).await;
        self.shared.write().await.record_valve(n, false);
        result?;

        self.zones.update_state_and_vwc(n, zone.max_vwc).await?;
        Ok(Some(runtime))
    }

    /// Complete → Idle, at most once per calendar date.
    async fn reset_once(&self, today: Date, config: &SystemConfig) -> Result<()> {
        if self.read_date(Key::LastZoneResetDate).await? == Some(today) {
            return Ok(());
        }
        self.zones.reset_zones(config.num_zones()).await?;
        self.zones
            .kv()
            .set(&Key::LastZoneResetDate, &today.to_string())
            .await?;
        info!(date = %today, "zones reset");
        Ok(())
    }

    /// A sentinel that doesn't parse counts as absent.
    async fn read_date(&self, key: Key) -> Result<Option<Date>> {
        let Some(raw) = self
            .zones
            .kv()
            .get(&key)
            .await
            .with_context(|| format!("reading {key}"))?
        else {
            return Ok(None);
        };
        match parse_date(&raw) {
            Ok(d) => Ok(Some(d)),
            Err(e) => {
                warn!(%key, "{e:#}, ignoring");
                Ok(None)
            }
        }
    }

    async fn log_conditions(&self, today: Date, observed: Conditions, forecast: Conditions) {
        if let Some(yesterday) = today.previous_day() {
            if let Err(e) = self.datalog.write_conditions(yesterday, &observed).await {
                self.reporter.report(e.context("logging conditions")).await;
            }
        }
        if let Err(e) = self.datalog.write_conditions(today, &forecast).await {
            self.reporter.report(e.context("logging forecast")).await;
        }
    }

    /// Informational only. Nothing is written to the store.
    async fn predict_tomorrow(&self, today: Date) {
        let Some(tomorrow) = today.next_day() else {
            return;
        };
        let config = match self.config.load() {
            Ok(c) => c,
            Err(e) => {
                warn!("prediction skipped: {e:#}");
                return;
            }
        };
        let forecast = match self.conditions.forecast(&config.global.location) {
            Ok(c) => c,
            Err(e) => {
                warn!("prediction skipped: {e:#}");
                return;
            }
        };

        let wb = WaterBalance::new(config.et_pct.clone());
        let mut minutes = BTreeMap::new();
        for zone in config.zones.values() {
            let current = match self.zones.vwc(zone.number).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(zone = zone.number, "prediction: {e:#}");
                    continue;
                }
            };
            let plan = plan_zone(&wb, zone, current, forecast, 0.0, tomorrow);
            if let (Some(d), true) = (plan.runtime, zone.enabled) {
                minutes.insert(zone.number, whole_minutes(d));
            }
        }
        let runtimes = runtimes_by_zone(&config, &minutes);
        info!(date = %tomorrow, ?runtimes, "predicted runtimes");
        if let Err(e) = self.datalog.write_runtimes(tomorrow, &runtimes).await {
            warn!("prediction not logged: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
