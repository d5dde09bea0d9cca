//! Water-balance model. Tracks a per-zone volumetric water content (VWC)
//! estimate: yesterday's rain adds moisture, a temperature-indexed ET loss
//! scaled by zone rate and a monthly growth factor removes it.
//!
//! This is a deliberately simple linear model, not Penman-Monteith.

use std::time::Duration;

use time::{Date, Month};

use crate::config::ZoneConfig;
use crate::range::RangeMapper;

/// VWC percentage points added per inch of precipitation.
const PCT_PER_PRECIP_IN: f64 = 100.0;

// Reference zone: a 10 minute run raises VWC by 20 points at 8" root depth.
const NOMINAL_DEPTH_IN: f64 = 8.0;
const NOMINAL_RUN_TIME_MIN: f64 = 10.0;
const NOMINAL_VWC_INCREASE: f64 = 20.0;

/// Relative plant water use by month. Lower in winter.
pub fn growth_factor(month: Month) -> f64 {
    match month {
        Month::January | Month::December => 0.5,
        Month::February | Month::October | Month::November => 0.7,
        Month::March
        | Month::April
        | Month::May
        | Month::June
        | Month::July
        | Month::August
        | Month::September => 1.0,
    }
}

#[derive(Debug, Clone)]
pub struct WaterBalance {
    et_pct: RangeMapper,
}

impl WaterBalance {
    pub fn new(et_pct: RangeMapper) -> Self {
        Self { et_pct }
    }

    /// ET percentage for the given temperature (°F).
    pub fn et_pct(&self, temp_f: f64) -> f64 {
        self.et_pct.get_y(temp_f)
    }

    /// New VWC after one day at `temp_f` with `precip_in` of rain, clamped to
    /// `[0, zone.max_vwc]`.
    pub fn calculate_vwc(
        &self,
        current_vwc: f64,
        temp_f: f64,
        precip_in: f64,
        date: Date,
        zone: &ZoneConfig,
    ) -> f64 {
        let remove = self.et_pct(temp_f) * zone.et_rate * growth_factor(date.month());
        let add = precip_in * PCT_PER_PRECIP_IN;
        let vwc = (current_vwc + add - remove).max(0.0).min(zone.max_vwc);
        tracing::debug!(
            zone = zone.number,
            et_pct = self.et_pct(temp_f),
            et_rate = zone.et_rate,
            growth = growth_factor(date.month()),
            remove,
            add,
            "vwc update"
        );
        vwc
    }

    /// Run time needed to raise VWC from `current_vwc` to `target_vwc`, less
    /// the credit for forecast rain. Truncated to whole minutes and never
    /// negative. The caller applies the zone's run time multiplier.
    pub fn calculate_runtime(
        &self,
        current_vwc: f64,
        target_vwc: f64,
        forecast_precip_in: f64,
        zone: &ZoneConfig,
    ) -> Duration {
        let precip_vwc = forecast_precip_in * PCT_PER_PRECIP_IN;
        let add_vwc = (target_vwc - current_vwc - precip_vwc).max(0.0);
        let minutes = (add_vwc / NOMINAL_VWC_INCREASE)
            * (zone.depth_in / NOMINAL_DEPTH_IN)
            * NOMINAL_RUN_TIME_MIN;
        if !minutes.is_finite() {
            return Duration::ZERO;
        }
        Duration::from_secs((minutes.trunc() as u64).saturating_mul(60))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoilConfig;
    use time::macros::date;

    const JULY: Date = date!(2026 - 07 - 15);
    const JANUARY: Date = date!(2026 - 01 - 15);

    fn four_bucket() -> WaterBalance {
        WaterBalance::new(
            RangeMapper::parse(&["-50", "2.5", "50-65", "5.0", "65-75", "7.5", "75-", "10.0"])
                .unwrap(),
        )
    }

    fn zone(et_rate: f64, depth_in: f64) -> ZoneConfig {
        ZoneConfig {
            number: 0,
            name: "zone 0".into(),
            enabled: true,
            gets_rain: true,
            soil: SoilConfig {
                name: "Loam".into(),
                max_vwc: 40.0,
            },
            min_vwc: 10.0,
            max_vwc: 20.0,
            run_time_multiplier: 1.0,
            et_rate,
            depth_in,
        }
    }

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    // -- growth factor ------------------------------------------------------

    #[test]
    fn growth_factor_lower_in_winter() {
        assert_eq!(growth_factor(Month::January), 0.5);
        assert_eq!(growth_factor(Month::February), 0.7);
        assert_eq!(growth_factor(Month::July), 1.0);
        assert_eq!(growth_factor(Month::November), 0.7);
        assert_eq!(growth_factor(Month::December), 0.5);
    }

    // -- calculate_vwc ------------------------------------------------------

    #[test]
    fn vwc_loses_et_in_growing_season() {
        // 60°F → 5.0% ET, rate 0.1, growth 1.0 → remove 0.5
        let v = four_bucket().calculate_vwc(15.0, 60.0, 0.0, JULY, &zone(0.1, 8.0));
        assert!((v - 14.5).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn vwc_loss_scaled_by_growth_factor() {
        // 80°F → 10% ET, rate 1.0, January growth 0.5 → remove 5
        let v = four_bucket().calculate_vwc(15.0, 80.0, 0.0, JANUARY, &zone(1.0, 8.0));
        assert!((v - 10.0).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn vwc_rain_adds_moisture() {
        // remove 10, add 10 → unchanged
        let v = four_bucket().calculate_vwc(15.0, 80.0, 0.1, JULY, &zone(1.0, 8.0));
        assert!((v - 15.0).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn vwc_clamped_to_max() {
        let v = four_bucket().calculate_vwc(15.0, 80.0, 10.0, JULY, &zone(1.0, 8.0));
        assert_eq!(v, 20.0);
    }

    #[test]
    fn vwc_clamped_to_zero() {
        let v = four_bucket().calculate_vwc(5.0, 80.0, 0.0, JULY, &zone(1.0, 8.0));
        assert_eq!(v, 0.0);
    }

    #[test]
    fn vwc_stays_in_bounds_across_inputs() {
        let wb = four_bucket();
        let z = zone(1.0, 8.0);
        for cur in [0.0, 5.0, 19.9, 20.0, 35.0] {
            for temp in [-200.0, 0.0, 55.0, 70.0, 120.0] {
                for precip in [0.0, 0.01, 0.3, 5.0] {
                    let v = wb.calculate_vwc(cur, temp, precip, JULY, &z);
                    assert!((0.0..=z.max_vwc).contains(&v), "{cur} {temp} {precip} → {v}");
                }
            }
        }
    }

    // -- calculate_runtime --------------------------------------------------

    #[test]
    fn runtime_scales_with_deficit() {
        let wb = four_bucket();
        let z = zone(1.0, 8.0);
        assert_eq!(wb.calculate_runtime(15.0, 20.0, 0.0, &z), mins(2));
        assert_eq!(wb.calculate_runtime(10.0, 20.0, 0.0, &z), mins(5));
        assert_eq!(wb.calculate_runtime(0.0, 20.0, 0.0, &z), mins(10));
    }

    #[test]
    fn runtime_scales_with_depth() {
        let wb = four_bucket();
        assert_eq!(wb.calculate_runtime(0.0, 20.0, 0.0, &zone(1.0, 16.0)), mins(20));
    }

    #[test]
    fn runtime_forecast_rain_credit() {
        let wb = four_bucket();
        let z = zone(1.0, 8.0);
        assert_eq!(wb.calculate_runtime(10.0, 20.0, 0.01, &z), mins(4));
    }

    #[test]
    fn runtime_zero_when_forecast_covers_deficit() {
        let wb = four_bucket();
        let z = zone(1.0, 8.0);
        assert_eq!(wb.calculate_runtime(10.0, 20.0, 0.1, &z), Duration::ZERO);
        assert_eq!(wb.calculate_runtime(10.0, 20.0, 10.0, &z), Duration::ZERO);
    }

    #[test]
    fn runtime_zero_when_already_above_target() {
        let wb = four_bucket();
        assert_eq!(
            wb.calculate_runtime(25.0, 20.0, 0.0, &zone(1.0, 8.0)),
            Duration::ZERO
        );
    }

    #[test]
    fn runtime_saturates_instead_of_overflowing() {
        let wb = four_bucket();
        assert_eq!(
            wb.calculate_runtime(0.0, 20.0, 0.0, &zone(1.0, 1e300)),
            Duration::from_secs(u64::MAX)
        );
    }
}
