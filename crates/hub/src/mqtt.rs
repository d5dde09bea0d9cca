//! Valves driven over MQTT. Each valve listens on `valve/<n>/set` for an
//! `ON`/`OFF` payload; the relay node behind the broker does the switching.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{info, warn};

use crate::state::SharedState;
use crate::valve::Actuator;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "valve/<n>/set"
pub fn valve_topic(n: u32) -> String {
    format!("valve/{n}/set")
}

pub fn valve_payload(on: bool) -> &'static [u8] {
    if on {
        b"ON"
    } else {
        b"OFF"
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

pub struct MqttValves {
    client: AsyncClient,
    num_valves: u32,
}

impl MqttValves {
    /// Build the client and its event loop. The event loop must be driven
    /// (see [`drive`]) for commands to reach the broker.
    pub fn new(host: &str, port: u16, num_valves: u32) -> (Self, EventLoop) {
        let mut opts = MqttOptions::new("irctl-hub", host, port);
        opts.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(opts, 20);
        (Self { client, num_valves }, eventloop)
    }

    fn publish(&self, n: u32, on: bool) -> Result<()> {
        if n >= self.num_valves {
            anyhow::bail!("valve {n} out of range [0, {})", self.num_valves);
        }
        self.client
            .try_publish(valve_topic(n), QoS::AtLeastOnce, false, valve_payload(on))
            .with_context(|| format!("publishing valve {n} {}", if on { "ON" } else { "OFF" }))?;
        info!(valve = n, "mqtt valve set {}", if on { "ON" } else { "OFF" });
        Ok(())
    }
}

impl Actuator for MqttValves {
    fn open(&self, n: u32) -> Result<()> {
        self.publish(n, true)
    }

    fn close(&self, n: u32) -> Result<()> {
        self.publish(n, false)
    }

    fn close_all(&self) -> Result<()> {
        for n in 0..self.num_valves {
            self.publish(n, false)?;
        }
        Ok(())
    }

    fn num_valves(&self) -> u32 {
        self.num_valves
    }
}

/// Poll the MQTT event loop forever, tracking connection state.
pub async fn drive(mut eventloop: EventLoop, shared: SharedState) {
    shared.write().await.mqtt_connected = Some(false);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = Some(true);
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = Some(false);
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = Some(false);
                    st.record_error(format!("mqtt error: {e}"));
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
