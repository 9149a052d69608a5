//! Planner: `refresh_vehicle_charge_plan`, the segment generator, and
//! (in [`reconcile`]) the plan reconciler.

pub mod reconcile;

use chrono::{DateTime, Duration, Utc};

use crate::curve;
use crate::errors::PlanError;
use crate::gateway::Gateway;
use crate::models::*;
use crate::stats;

/// Rebuilds and persists one vehicle's `charge_plan`. Never clears an
/// existing plan on failure — callers propagate the error and leave the
/// previous plan in the gateway untouched.
pub fn refresh_vehicle_charge_plan(gw: &dyn Gateway, vehicle_id: VehicleId, now: DateTime<Utc>) -> Result<(), PlanError> {
    let mut vehicle = gw.get_vehicle(vehicle_id)?;

    let location_id = match vehicle.location_id {
        Some(id) => id,
        None => {
            vehicle.smart_status = String::new();
            gw.put_vehicle(&vehicle)?;
            return Ok(());
        }
    };

    let mut plan: Vec<ChargePlanSegment> = vehicle
        .charge_plan
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s.charge_start.is_none() && vehicle.level < vehicle.minimum_charge + 1)
        .collect();

    let curve_rows = gw.get_charge_curve(vehicle_id, location_id)?;
    let max_curve_level = curve_rows.iter().map(|c| c.level).max().unwrap_or(0);

    if vehicle.level < vehicle.maximum_charge && max_curve_level < 100 {
        plan = vec![ChargePlanSegment {
            charge_start: None,
            charge_stop: None,
            level: 100,
            charge_type: ChargeType::Calibrate,
            comment: "Charge calibration".into(),
        }];
        vehicle.smart_status = "Calibrating battery curve".into();
        return finish(gw, &mut vehicle, plan, now);
    }

    if vehicle.level < vehicle.minimum_charge {
        let duration = curve::charge_duration(gw, vehicle_id, location_id, vehicle.level, vehicle.minimum_charge)?;
        plan.push(ChargePlanSegment {
            charge_start: None,
            charge_stop: Some(now + Duration::milliseconds(duration.round() as i64)),
            level: vehicle.minimum_charge,
            charge_type: ChargeType::Minimum,
            comment: "emergency charge".into(),
        });
    }

    let stats = stats::current_stats(gw, vehicle_id, location_id, now)?;

    let mut minimum_level = vehicle.minimum_charge;
    let mut before: Option<DateTime<Utc>> = None;
    let mut disconnect_time: Option<DateTime<Utc>> = None;
    let mut learning = false;

    if let Some(level_charge_time_s) = stats.level_charge_time_s {
        match routine_prediction(gw, &vehicle, location_id, now)? {
            Some((charge, pred_before)) => {
                minimum_level = (vehicle.minimum_charge as f64 + charge + 5.0).round() as i32;
                minimum_level = minimum_level.min(vehicle.maximum_charge);
                before = Some(pred_before);
                disconnect_time = Some(pred_before);
                plan.extend(generate_charge_plan(gw, &vehicle, minimum_level, ChargeType::Routine, "routine charge", before, None, now)?);
            }
            None => {
                learning = true;
                plan.push(ChargePlanSegment {
                    charge_start: None,
                    charge_stop: None,
                    level: vehicle.maximum_charge,
                    charge_type: ChargeType::Fill,
                    comment: "learning".into(),
                });
                vehicle.smart_status = "Smart charging disabled (still learning)".into();
            }
        }
        let _ = level_charge_time_s;
    } else {
        learning = true;
        plan.push(ChargePlanSegment {
            charge_start: None,
            charge_stop: None,
            level: vehicle.maximum_charge,
            charge_type: ChargeType::Fill,
            comment: "learning".into(),
        });
        vehicle.smart_status = "Smart charging disabled (still learning)".into();
    }

    if !learning {
        if vehicle.anxiety_level as i32 >= 1 {
            let target = if vehicle.anxiety_level as i32 > 1 {
                vehicle.maximum_charge
            } else {
                (minimum_level + vehicle.maximum_charge) / 2
            };
            plan.extend(generate_charge_plan(gw, &vehicle, target, ChargeType::Prefered, "charge setting", before, None, now)?);
        }

        if let Some(trip) = vehicle.scheduled_trip.clone() {
            if now <= trip.time + Duration::hours(1) && now >= trip.time - Duration::hours(36) {
                let depart_level = trip.level;
                let prepare_level = vehicle.level.max(depart_level.min(vehicle.maximum_charge));
                let topup_time_ms = curve::charge_duration(gw, vehicle_id, location_id, prepare_level, depart_level)?;
                let topup_time = if topup_time_ms > 0.0 { Duration::milliseconds(topup_time_ms.round() as i64) } else { Duration::zero() };
                let topup_start = trip.time - Duration::minutes(15) - topup_time;

                plan.extend(generate_charge_plan(gw, &vehicle, prepare_level, ChargeType::Trip, "upcoming trip", Some(topup_start), None, now)?);

                if topup_time > Duration::zero() {
                    plan.push(ChargePlanSegment {
                        charge_start: Some(topup_start),
                        charge_stop: None,
                        level: depart_level,
                        charge_type: ChargeType::Trip,
                        comment: "topping up before trip".into(),
                    });
                }

                disconnect_time = Some(disconnect_time.map(|d| d.max(topup_start)).unwrap_or(topup_start));
            }
            if now > trip.time + Duration::hours(1) {
                vehicle.scheduled_trip = None;
            }
        }

        let average = stats.weekly_avg7_price + (stats.weekly_avg7_price - stats.weekly_avg21_price) / 2.0;
        let threshold_price = average * stats.threshold as f64 / 100.0;
        plan.extend(generate_charge_plan(
            gw,
            &vehicle,
            vehicle.maximum_charge,
            ChargeType::Fill,
            "low price",
            disconnect_time,
            Some(threshold_price),
            now,
        )?);
    }

    finish(gw, &mut vehicle, plan, now)
}

fn finish(gw: &dyn Gateway, vehicle: &mut Vehicle, plan: Vec<ChargePlanSegment>, _now: DateTime<Utc>) -> Result<(), PlanError> {
    let reconciled = reconcile::cleanup_plan(plan);
    vehicle.charge_plan = if reconciled.is_empty() { None } else { Some(reconciled) };
    gw.put_vehicle(vehicle)?;
    Ok(())
}

/// Simplified routine-charge prediction: looks at closed connections at this
/// location over the last 6 weeks, and derives a `(charge_needed_pct, before_ts)`
/// pair from the most recent week's usage and the historical end-of-charge time.
/// Returns `None` when there isn't enough history yet ("learning" path).
fn routine_prediction(gw: &dyn Gateway, vehicle: &Vehicle, location_id: LocationId, now: DateTime<Utc>) -> Result<Option<(f64, DateTime<Utc>)>, PlanError> {
    let window = gw.list_closed_connections_for_vehicle(vehicle.id, now - Duration::weeks(6), now)?;
    let at_location: Vec<_> = window.into_iter().filter(|c| c.location_id == location_id).collect();

    if at_location.is_empty() {
        return Ok(None);
    }

    let recent: Vec<&Connection> = at_location.iter().filter(|c| c.start_ts >= now - Duration::days(7)).collect();
    let mean_recent = mean_used(&recent);

    let mut used: Vec<f64> = at_location.iter().map(|c| (c.start_level - c.end_level).unsigned_abs() as f64).collect();
    used.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p60 = percentile(&used, 0.6);

    let charge = mean_recent.max(p60);
    if charge <= 0.0 {
        return Ok(None);
    }

    let mut end_times: Vec<DateTime<Utc>> = at_location.iter().map(|c| c.end_ts).collect();
    end_times.sort();
    let idx = ((end_times.len() as f64 - 1.0) * 0.2).round().max(0.0) as usize;
    let sample_time = end_times.get(idx.min(end_times.len().saturating_sub(1))).copied().unwrap_or(now);

    let mut before = project_to_today_or_tomorrow(sample_time, now);
    if before < now + Duration::hours(12) {
        before += Duration::days(1);
    }

    Ok(Some((charge, before)))
}

fn mean_used(conns: &[&Connection]) -> f64 {
    if conns.is_empty() {
        return 0.0;
    }
    conns.iter().map(|c| (c.start_level - c.end_level).unsigned_abs() as f64).sum::<f64>() / conns.len() as f64
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn project_to_today_or_tomorrow(sample: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Timelike;
    let mut candidate = now
        .date_naive()
        .and_hms_opt(sample.hour(), sample.minute(), 0)
        .unwrap()
        .and_utc();
    if candidate < now {
        candidate += Duration::days(1);
    }
    candidate
}

/// Builds charge segments to reach `target_level` by `before` (or with no
/// deadline), walking available price points cheapest-first and stopping
/// early if `max_price` is exceeded. Falls back to a single unconditional
/// segment when the location has no price feed.
pub fn generate_charge_plan(
    gw: &dyn Gateway,
    vehicle: &Vehicle,
    target_level: Percent,
    charge_type: ChargeType,
    comment: &str,
    before: Option<DateTime<Utc>>,
    max_price: Option<f64>,
    now: DateTime<Utc>,
) -> Result<Vec<ChargePlanSegment>, PlanError> {
    let location_id = vehicle.location_id.ok_or(PlanError("no location".into()))?;
    let location = gw.get_location(location_id)?;

    let time_needed_ms = curve::charge_duration(gw, vehicle.id, location_id, vehicle.level, target_level)?;
    if time_needed_ms <= 0.0 {
        return Ok(vec![]);
    }
    let mut time_left = Duration::milliseconds(time_needed_ms.round() as i64);

    let before_bound = before.unwrap_or(DateTime::<Utc>::MAX_UTC);
    let mut prices = gw.get_prices(&location.price_code, now - Duration::hours(1), before_bound)?;
    prices.retain(|p| p.ts < before_bound);
    prices.sort_by_key(|p| p.price_scaled);

    if prices.is_empty() {
        return Ok(vec![ChargePlanSegment {
            charge_start: None,
            charge_stop: Some(now + time_left),
            level: target_level,
            charge_type: ChargeType::Routine,
            comment: comment.to_string(),
        }]);
    }

    let mut segments = Vec::new();
    for p in prices {
        if let Some(mp) = max_price {
            if p.price_per_kwh() > mp {
                break;
            }
        }
        let ts_start = p.ts.max(now);
        let end = [ts_start + time_left, before_bound, p.ts + Duration::hours(1)].into_iter().min().unwrap();
        if end <= ts_start {
            continue;
        }
        let charge_start = if p.ts < now { None } else { Some(ts_start) };
        let charge_stop = if end == DateTime::<Utc>::MAX_UTC { None } else { Some(end) };
        segments.push(ChargePlanSegment {
            charge_start,
            charge_stop,
            level: target_level,
            charge_type,
            comment: comment.to_string(),
        });
        time_left -= end - ts_start;
        if time_left <= Duration::zero() {
            break;
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    fn vehicle_at(id: VehicleId, account_id: AccountId, location_id: LocationId, level: Percent, minimum: Percent, maximum: Percent) -> Vehicle {
        Vehicle {
            id,
            account_id,
            name: "car".into(),
            minimum_charge: minimum,
            maximum_charge: maximum,
            anxiety_level: AnxietyLevel::Relaxed,
            scheduled_trip: None,
            paused_until: None,
            location_id: Some(location_id),
            level,
            odometer: 0.0,
            outside_deci_temp: 150,
            inside_deci_temp: 200,
            climate_on: false,
            driving: false,
            connected: true,
            connected_id: None,
            charge_id: None,
            trip_id: None,
            charge_plan: None,
            smart_status: String::new(),
            status: "ok".into(),
            updated: Utc::now(),
            provider_data: None,
        }
    }

    fn setup_location(gw: &SqliteGateway, account_id: AccountId) -> LocationId {
        let location_id = LocationId::new_v4();
        gw.put_location(&Location {
            id: location_id,
            account_id,
            name: "home".into(),
            geo: GeoPoint::from_degrees(59.0, 18.0),
            geo_fence_radius_m: 50.0,
            price_code: "SE3".into(),
        })
        .unwrap();
        location_id
    }

    #[test]
    fn cold_start_no_prices_produces_learning_fill_segment() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let location_id = setup_location(&gw, account_id);
        let vehicle_id = VehicleId::new_v4();
        let now = Utc::now();
        let mut v = vehicle_at(vehicle_id, account_id, location_id, 50, 50, 90);
        v.updated = now;
        gw.put_vehicle(&v).unwrap();

        refresh_vehicle_charge_plan(&gw, vehicle_id, now).unwrap();

        let updated = gw.get_vehicle(vehicle_id).unwrap();
        assert_eq!(updated.smart_status, "Smart charging disabled (still learning)");
        let plan = updated.charge_plan.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].charge_type, ChargeType::Fill);
        assert_eq!(plan[0].level, 90);
        assert!(plan[0].charge_start.is_none());
    }

    #[test]
    fn calibration_needed_when_no_100_percent_curve_row() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let location_id = setup_location(&gw, account_id);
        let vehicle_id = VehicleId::new_v4();
        let now = Utc::now();
        let v = vehicle_at(vehicle_id, account_id, location_id, 80, 50, 90);
        gw.put_vehicle(&v).unwrap();
        gw.put_charge_curve_point(&ChargeCurve {
            vehicle_id,
            location_id,
            level: 85,
            duration_s: 90.0,
            avg_deci_temp: 150.0,
            energy_used: 100.0,
            energy_added: 90.0,
        })
        .unwrap();

        refresh_vehicle_charge_plan(&gw, vehicle_id, now).unwrap();

        let updated = gw.get_vehicle(vehicle_id).unwrap();
        let plan = updated.charge_plan.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].charge_type, ChargeType::Calibrate);
        assert_eq!(plan[0].level, 100);
    }

    #[test]
    fn emergency_segment_is_appended_when_below_minimum() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let location_id = setup_location(&gw, account_id);
        let vehicle_id = VehicleId::new_v4();
        let now = Utc::now();
        let v = vehicle_at(vehicle_id, account_id, location_id, 20, 50, 90);
        gw.put_vehicle(&v).unwrap();
        for level in 0..100 {
            gw.put_charge_curve_point(&ChargeCurve {
                vehicle_id,
                location_id,
                level,
                duration_s: 60.0,
                avg_deci_temp: 150.0,
                energy_used: 100.0,
                energy_added: 90.0,
            })
            .unwrap();
        }

        refresh_vehicle_charge_plan(&gw, vehicle_id, now).unwrap();

        let updated = gw.get_vehicle(vehicle_id).unwrap();
        let plan = updated.charge_plan.unwrap();
        assert!(plan.iter().any(|s| s.charge_type == ChargeType::Minimum && s.level == 50));
    }
}
