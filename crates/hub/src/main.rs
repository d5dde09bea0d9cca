mod alg;
mod clock;
mod conditions;
mod config;
mod datalog;
mod gate;
mod kv;
mod manual;
mod mqtt;
mod range;
mod report;
mod scheduler;
mod state;
#[cfg(test)]
mod testutil;
mod valve;
mod web;
mod zone;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemZone;
use conditions::FileConditions;
use config::ConfigSource;
use datalog::DataLogger;
use gate::CommandGate;
use kv::{RetryPolicy, SqliteKv};
use manual::ManualRunner;
use mqtt::MqttValves;
use report::StatusReporter;
use scheduler::{Controller, RunParams};
use state::SystemState;
use valve::{parse_pin_list, Actuator, ValveBoard};
use web::AppState;
use zone::ZoneController;

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = PathBuf::from(env_or("CONFIG_PATH", "irctl.toml"));
    let db_url = env_or("DB_URL", "sqlite:irctl.db?mode=rwc");
    let data_log_path = env_or("DATA_LOG_PATH", "data");
    let conditions_path = env_or("CONDITIONS_PATH", "conditions");
    let error_log_path = env::var("ERROR_LOG_PATH").ok().map(PathBuf::from);
    let interval_min: u64 = env_parse("RUN_INTERVAL_MIN", 30);
    let web_port: u16 = env_parse("WEB_PORT", 8080);
    let dry_run = env_flag("DRY_RUN", false);

    // Fail fast on a broken config; the controller re-reads it every pass.
    let config_source = ConfigSource::File(config_path.clone());
    let cfg = config_source
        .load()
        .with_context(|| format!("startup config check: {}", config_path.display()))?;
    info!(
        zones = cfg.zones.len(),
        location = %cfg.global.location,
        run_time_am = %cfg.global.run_time_am,
        "config ok"
    );

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── KV store ────────────────────────────────────────────────────
    let kv = SqliteKv::connect(&db_url, RetryPolicy::default()).await?;

    // ── Valves ──────────────────────────────────────────────────────
    let actuator: Arc<dyn Actuator> = match env_or("ACTUATOR", "gpio").as_str() {
        "gpio" => {
            let pins = parse_pin_list(&env_or("VALVE_GPIO_PINS", ""))?;
            if pins.is_empty() {
                warn!("VALVE_GPIO_PINS is empty, no valves can be opened");
            }
            // Many common relay boards are active-low. If yours is active-high, set false.
            let active_low = env_flag("RELAY_ACTIVE_LOW", true);
            Arc::new(ValveBoard::new(&pins, active_low)?)
        }
        "mqtt" => {
            let host = env_or("MQTT_HOST", "127.0.0.1");
            let port: u16 = env_parse("MQTT_PORT", 1883);
            let num_valves: u32 = env_parse("NUM_VALVES", 8);
            let (valves, eventloop) = MqttValves::new(&host, port, num_valves);
            info!(%host, port, num_valves, "mqtt valves");
            tokio::spawn(mqtt::drive(eventloop, Arc::clone(&shared)));
            Arc::new(valves)
        }
        other => bail!("unknown ACTUATOR '{other}' (use gpio or mqtt)"),
    };

    let highest = cfg.num_zones();
    if highest > actuator.num_valves() {
        warn!(
            zones = highest,
            valves = actuator.num_valves(),
            "config names more zones than the actuator has valves"
        );
    }

    // Fail-safe: nothing open at startup.
    if let Err(e) = actuator.close_all() {
        error!("startup close_all: {e:#}");
        shared
            .write()
            .await
            .record_error(format!("startup close_all: {e:#}"));
    }

    // ── Wiring ──────────────────────────────────────────────────────
    let gate = CommandGate::new();
    let zones = ZoneController::new(kv, Arc::clone(&actuator));
    let datalog = DataLogger::new(data_log_path);
    let manual = ManualRunner::new(gate.clone(), Arc::clone(&actuator), Arc::clone(&shared));
    let reporter = StatusReporter::new(Arc::clone(&shared), error_log_path);

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        shared: Arc::clone(&shared),
        gate: gate.clone(),
        zones: zones.clone(),
        manual,
        datalog: datalog.clone(),
        config: config_source.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("{e:#}");
        }
    });

    // ── Controller loop ─────────────────────────────────────────────
    let params = RunParams {
        interval: Duration::from_secs(interval_min.max(1) * 60),
        skip_wait: dry_run,
        ..RunParams::default()
    };
    if dry_run {
        warn!("DRY_RUN set, zone waits are skipped");
    }

    let controller = Controller::new(
        config_source,
        zones,
        Arc::new(FileConditions::new(conditions_path)),
        datalog,
        reporter,
        gate,
        shared,
    )
    .with_params(params)
    .with_zone(Arc::new(SystemZone));

    controller.run().await;
    Ok(())
}
