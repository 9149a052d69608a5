//! Charge-Curve Learner: per-vehicle/location seconds-to-gain-1% table.
//!
//! Fed by every telemetry sample observed while a Charge is active; consulted
//! by the planner through [`charge_duration`] whenever it needs a time
//! estimate for a level change.

use chrono::{DateTime, Utc};

use crate::errors::IngestError;
use crate::gateway::Gateway;
use crate::models::*;

/// Fallback seconds-per-percent used when no curve row exists for a level.
const DEFAULT_DURATION_S: f64 = 100.0;

/// Called on every sample while a Charge is open. `level` is the freshly
/// observed battery percent, `added_now` the cumulative energy added so far
/// this charge (Wm). Returns `true` if a new curve point was persisted.
pub fn observe_sample(
    gw: &dyn Gateway,
    vehicle_id: VehicleId,
    location_id: LocationId,
    charge_id: ChargeId,
    now: DateTime<Utc>,
    level: Percent,
    power_w: f64,
    outside_deci_temp: i32,
    added_now: WattMinutes,
) -> Result<bool, IngestError> {
    let mut current = match gw.get_charge_current(charge_id)? {
        Some(c) => c,
        None => {
            gw.put_charge_current(&ChargeCurrent {
                charge_id,
                start_ts: now,
                start_level: level,
                start_added: added_now,
                powers: vec![power_w],
                outside_deci_temps: vec![outside_deci_temp],
                discarded_first_gain: false,
            })?;
            return Ok(false);
        }
    };

    let gain = level - current.start_level;

    if gain <= 0 {
        current.powers.push(power_w);
        current.outside_deci_temps.push(outside_deci_temp);
        gw.put_charge_current(&current)?;
        return Ok(false);
    }

    if gain > 1 {
        // Offline gap: the observed jump skipped levels, unreliable for curve fitting.
        gw.put_charge_current(&ChargeCurrent {
            charge_id,
            start_ts: now,
            start_level: level,
            start_added: added_now,
            powers: vec![power_w],
            outside_deci_temps: vec![outside_deci_temp],
            discarded_first_gain: current.discarded_first_gain,
        })?;
        return Ok(false);
    }

    // gain == 1
    if !current.discarded_first_gain {
        gw.put_charge_current(&ChargeCurrent {
            charge_id,
            start_ts: now,
            start_level: level,
            start_added: added_now,
            powers: vec![power_w],
            outside_deci_temps: vec![outside_deci_temp],
            discarded_first_gain: true,
        })?;
        return Ok(false);
    }

    let duration = (now - current.start_ts).num_milliseconds() as f64 / 1000.0;
    let avg_power = mean(&current.powers);
    let energy_used = avg_power * duration / 60.0;
    let energy_added = added_now - current.start_added;
    let avg_temp = mean(&current.outside_deci_temps.iter().map(|t| *t as f64).collect::<Vec<_>>());

    gw.put_charge_curve_point(&ChargeCurve {
        vehicle_id,
        location_id,
        level: current.start_level,
        duration_s: duration,
        avg_deci_temp: avg_temp,
        energy_used,
        energy_added,
    })?;

    gw.put_charge_current(&ChargeCurrent {
        charge_id,
        start_ts: now,
        start_level: level,
        start_added: added_now,
        powers: vec![],
        outside_deci_temps: vec![],
        discarded_first_gain: true,
    })?;

    Ok(true)
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f64>() / v.len() as f64
    }
}

/// Sum of stored per-level durations between `from` (exclusive) and `to` (inclusive)
/// battery percent, in milliseconds, shaving 25% off the final percent to avoid
/// overshoot. Missing rows fall back to [`DEFAULT_DURATION_S`].
pub fn charge_duration(gw: &dyn Gateway, vehicle_id: VehicleId, location_id: LocationId, from: Percent, to: Percent) -> Result<f64, IngestError> {
    if to <= from {
        return Ok(0.0);
    }
    let curve = gw.get_charge_curve(vehicle_id, location_id)?;
    let mut total_ms = 0.0;
    for level in from..to {
        let duration = curve
            .iter()
            .find(|c| c.level == level)
            .map(|c| c.duration_s)
            .unwrap_or(DEFAULT_DURATION_S);
        let factor = if level < to - 1 { 1.0 } else { 0.75 };
        total_ms += duration * factor * 1000.0;
    }
    Ok(total_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;
    use chrono::TimeZone;

    #[test]
    fn charge_duration_with_no_curve_uses_default() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        let ms = charge_duration(&gw, vehicle_id, location_id, 50, 52).unwrap();
        // two percent: first full 100s, second shaved to 75s
        assert_eq!(ms, (100.0 + 75.0) * 1000.0);
    }

    #[test]
    fn observe_sample_first_gain_is_discarded() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        let charge_id = ChargeId::new_v4();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        observe_sample(&gw, vehicle_id, location_id, charge_id, t0, 50, 7000.0, 150, 0.0).unwrap();
        let persisted = observe_sample(&gw, vehicle_id, location_id, charge_id, t0 + chrono::Duration::seconds(90), 51, 7000.0, 150, 175.0).unwrap();
        assert!(!persisted, "first 1% gain after charge start must be discarded");
    }

    #[test]
    fn observe_sample_persists_curve_point_on_second_gain() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        let charge_id = ChargeId::new_v4();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        observe_sample(&gw, vehicle_id, location_id, charge_id, t0, 50, 7000.0, 150, 0.0).unwrap();
        observe_sample(&gw, vehicle_id, location_id, charge_id, t0 + chrono::Duration::seconds(90), 51, 7000.0, 150, 175.0).unwrap();
        let persisted = observe_sample(&gw, vehicle_id, location_id, charge_id, t0 + chrono::Duration::seconds(180), 52, 7000.0, 150, 350.0).unwrap();
        assert!(persisted);

        let curve = gw.get_charge_curve(vehicle_id, location_id).unwrap();
        assert_eq!(curve.len(), 1);
        assert_eq!(curve[0].level, 51);
    }

    #[test]
    fn observe_sample_discards_multi_percent_jump() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        let charge_id = ChargeId::new_v4();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        observe_sample(&gw, vehicle_id, location_id, charge_id, t0, 50, 7000.0, 150, 0.0).unwrap();
        let persisted = observe_sample(&gw, vehicle_id, location_id, charge_id, t0 + chrono::Duration::seconds(300), 53, 7000.0, 150, 600.0).unwrap();
        assert!(!persisted);
        assert!(gw.get_charge_curve(vehicle_id, location_id).unwrap().is_empty());
    }
}
