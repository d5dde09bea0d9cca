//! Valve actuation. The `gpio` feature gates the real rppal relay driver;
//! without it, a mock board tracks valve state in memory and logs changes.

use anyhow::{bail, Result};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Anything that can open and close numbered valves. Closing is idempotent.
pub trait Actuator: Send + Sync + 'static {
    fn open(&self, n: u32) -> Result<()>;
    fn close(&self, n: u32) -> Result<()>;
    /// Close every valve the hardware can address, regardless of zone state.
    fn close_all(&self) -> Result<()>;
    fn num_valves(&self) -> u32;
}

fn check_range(n: u32, num_valves: u32) -> Result<()> {
    if n >= num_valves {
        bail!("valve {n} out of range [0, {num_valves})");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Real GPIO valve board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ValveBoard {
    pins: Mutex<Vec<OutputPin>>, // index = valve number
    active_low: bool,            // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub fn new(gpio_pins: &[u8], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = Vec::with_capacity(gpio_pins.len());

        for pin_num in gpio_pins {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.push(pin);
        }

        info!(valves = pins.len(), active_low, "valve board initialised");
        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }

    fn set(&self, n: u32, on: bool) -> Result<()> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        check_range(n, pins.len() as u32)?;
        let pin = &mut pins[n as usize];
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(valve = n, "valve set {}", if on { "ON" } else { "OFF" });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ValveBoard {
    valves: Mutex<Vec<bool>>, // index = valve number, true = open
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub fn new(gpio_pins: &[u8], _active_low: bool) -> Result<Self> {
        for (n, pin_num) in gpio_pins.iter().enumerate() {
            info!(valve = n, gpio = pin_num, "[mock-gpio] registered valve (not wired)");
        }
        info!(valves = gpio_pins.len(), "[mock-gpio] valve board initialised (no hardware)");
        Ok(Self {
            valves: Mutex::new(vec![false; gpio_pins.len()]),
        })
    }

    fn set(&self, n: u32, on: bool) -> Result<()> {
        let mut valves = self.valves.lock().unwrap_or_else(PoisonError::into_inner);
        check_range(n, valves.len() as u32)?;
        valves[n as usize] = on;
        info!(valve = n, "[mock-gpio] valve set {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    #[cfg(test)]
    pub fn is_open(&self, n: u32) -> bool {
        self.valves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(n as usize)
            .copied()
            .unwrap_or(false)
    }
}

impl Actuator for ValveBoard {
    fn open(&self, n: u32) -> Result<()> {
        self.set(n, true)
    }

    fn close(&self, n: u32) -> Result<()> {
        self.set(n, false)
    }

    fn close_all(&self) -> Result<()> {
        let mut failed = Vec::new();
        for n in 0..self.num_valves() {
            if let Err(e) = self.set(n, false) {
                warn!(valve = n, "close_all: {e:#}");
                failed.push(n);
            }
        }
        if !failed.is_empty() {
            bail!("failed to close valves {failed:?}");
        }
        Ok(())
    }

    fn num_valves(&self) -> u32 {
        #[cfg(feature = "gpio")]
        let n = self.pins.lock().unwrap_or_else(PoisonError::into_inner).len();
        #[cfg(not(feature = "gpio"))]
        let n = self.valves.lock().unwrap_or_else(PoisonError::into_inner).len();
        n as u32
    }
}

/// Parse a comma-separated GPIO pin list (`"17,27,22"`); index is the valve
/// number.
pub fn parse_pin_list(s: &str) -> Result<Vec<u8>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u8>()
                .map_err(|e| anyhow::anyhow!("bad gpio pin '{p}': {e}"))
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    // -- ValveBoard (mock) --------------------------------------------------

    #[test]
    fn valve_board_registers_valves_closed() {
        let board = ValveBoard::new(&[17, 27], true).unwrap();
        assert_eq!(board.num_valves(), 2);
        assert!(!board.is_open(0));
        assert!(!board.is_open(1));
    }

    #[test]
    fn valve_board_open_then_close() {
        let board = ValveBoard::new(&[17], true).unwrap();
        board.open(0).unwrap();
        assert!(board.is_open(0));
        board.close(0).unwrap();
        assert!(!board.is_open(0));
    }

    #[test]
    fn valve_board_close_is_idempotent() {
        let board = ValveBoard::new(&[17], true).unwrap();
        board.close(0).unwrap();
        board.close(0).unwrap();
        assert!(!board.is_open(0));
    }

    #[test]
    fn valve_board_close_all_resets_everything() {
        let board = ValveBoard::new(&[17, 27, 22], true).unwrap();
        board.open(0).unwrap();
        board.open(2).unwrap();
        board.close_all().unwrap();
        assert!((0..3).all(|n| !board.is_open(n)));
    }

    #[test]
    fn valve_board_out_of_range_is_error() {
        let board = ValveBoard::new(&[17], true).unwrap();
        let err = board.open(5).unwrap_err();
        assert!(err.to_string().contains("valve 5 out of range"));
    }

    // -- pin list -----------------------------------------------------------

    #[test]
    fn pin_list_parses_with_spaces() {
        assert_eq!(parse_pin_list("17, 27,22").unwrap(), vec![17, 27, 22]);
        assert!(parse_pin_list("").unwrap().is_empty());
    }

    #[test]
    fn pin_list_rejects_garbage() {
        assert!(parse_pin_list("17,x").is_err());
        assert!(parse_pin_list("300").is_err());
    }
}
