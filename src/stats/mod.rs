//! Statistics Engine: `current_stats` and `create_new_stats`.
//!
//! Builds a history map from closed connections and sweeps candidate price
//! thresholds to pick the one that minimizes cost-per-energy while keeping
//! the vehicle above `minimum_charge / 2` throughout the simulated window.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::gateway::Gateway;
use crate::models::*;

const HISTORY_WINDOW_DAYS: i64 = 21;
const DEFAULT_THRESHOLD: i32 = 100;

/// Returns the freshest `CurrentStats` for `(vehicle, location)`, re-running
/// `create_new_stats` whenever the cached row's `price_list_ts` has fallen
/// behind the location's latest price point.
pub fn current_stats(gw: &dyn Gateway, vehicle_id: VehicleId, location_id: LocationId, now: DateTime<Utc>) -> Result<CurrentStats, GatewayError> {
    let location = gw.get_location(location_id)?;
    let latest_ts = latest_price_ts(gw, &location.price_code, now)?;

    if let Some(cached) = gw.get_current_stats(vehicle_id)? {
        if cached.location_id == location_id && Some(cached.price_list_ts) == latest_ts {
            return Ok(cached);
        }
    }

    create_new_stats(gw, vehicle_id, location_id, now)
}

fn latest_price_ts(gw: &dyn Gateway, price_code: &PriceCode, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, GatewayError> {
    let points = gw.get_prices(price_code, now - Duration::days(HISTORY_WINDOW_DAYS), now + Duration::hours(1))?;
    Ok(points.into_iter().map(|p| p.ts).max())
}

struct HourlyRow {
    hour: DateTime<Utc>,
    fraction: f64,
    price: f64,
    threshold: f64,
}

struct HistoryConnection {
    start_level: Percent,
    minimum_charge: Percent,
    maximum_charge: Percent,
    needed: Percent,
    offsite: bool,
    rows: Vec<HourlyRow>,
}

pub fn create_new_stats(gw: &dyn Gateway, vehicle_id: VehicleId, location_id: LocationId, now: DateTime<Utc>) -> Result<CurrentStats, GatewayError> {
    let vehicle = gw.get_vehicle(vehicle_id)?;
    let location = gw.get_location(location_id)?;

    let level_charge_time_s = median_duration(gw, vehicle_id, location_id)?;

    let price_points = gw.get_prices(&location.price_code, now - Duration::days(HISTORY_WINDOW_DAYS), now + Duration::hours(1))?;
    let avg7 = mean_price_since(&price_points, now - Duration::days(7));
    let avg21 = mean_price_since(&price_points, now - Duration::days(HISTORY_WINDOW_DAYS));
    let price_list_ts = price_points.iter().map(|p| p.ts).max().unwrap_or(now);

    let earliest_price = price_points.iter().map(|p| p.ts).min();
    let window_from = earliest_price.unwrap_or(now - Duration::weeks(3)).max(now - Duration::weeks(3));

    let connections = gw.list_closed_connections_for_vehicle(vehicle_id, window_from, now)?;

    let history = build_history_map(&connections, &vehicle, location_id, &price_points, avg7, avg21);

    let mut thresholds: Vec<i64> = history
        .iter()
        .flat_map(|h| h.rows.iter().map(|r| (r.threshold * 1_000_000.0).round() as i64))
        .collect();
    thresholds.sort_unstable();
    thresholds.dedup();

    let mut best: Option<(f64, f64)> = None; // (t, f)
    for t_scaled in &thresholds {
        let t = *t_scaled as f64 / 1_000_000.0;
        if let Some(f) = simulate(&history, t, level_charge_time_s.unwrap_or(100.0)) {
            if best.map(|(_, bf)| f < bf).unwrap_or(true) {
                best = Some((t, f));
            }
        }
    }

    let threshold = best.map(|(t, _)| (t * 100.0).round() as i32).unwrap_or(DEFAULT_THRESHOLD);

    let stats = CurrentStats {
        stats_id: Uuid::new_v4(),
        vehicle_id,
        location_id,
        price_list_ts,
        level_charge_time_s,
        weekly_avg7_price: avg7,
        weekly_avg21_price: avg21,
        threshold,
    };
    gw.put_current_stats(&stats)?;
    Ok(stats)
}

fn median_duration(gw: &dyn Gateway, vehicle_id: VehicleId, location_id: LocationId) -> Result<Option<f64>, GatewayError> {
    let curve = gw.get_charge_curve(vehicle_id, location_id)?;
    if curve.is_empty() {
        return Ok(None);
    }
    let mut durations: Vec<f64> = curve.iter().map(|c| c.duration_s).collect();
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = durations.len() / 2;
    let median = if durations.len() % 2 == 0 {
        (durations[mid - 1] + durations[mid]) / 2.0
    } else {
        durations[mid]
    };
    Ok(Some(median))
}

fn mean_price_since(points: &[PricePoint], since: DateTime<Utc>) -> f64 {
    let matching: Vec<f64> = points.iter().filter(|p| p.ts >= since).map(|p| p.price_per_kwh()).collect();
    if matching.is_empty() {
        0.0
    } else {
        matching.iter().sum::<f64>() / matching.len() as f64
    }
}

fn build_history_map(
    connections: &[Connection],
    vehicle: &Vehicle,
    target_location: LocationId,
    price_points: &[PricePoint],
    avg7: f64,
    avg21: f64,
) -> Vec<HistoryConnection> {
    let mut out = Vec::with_capacity(connections.len());
    let denom_base = avg7 + (avg7 - avg21) / 2.0;

    for (i, c) in connections.iter().enumerate() {
        let offsite = c.location_id != target_location;
        let needed = connections.get(i + 1).map(|next| (c.end_level - next.start_level).max(0)).unwrap_or(0);

        let rows = if offsite {
            Vec::new()
        } else {
            hourly_rows(c, price_points, denom_base)
        };

        out.push(HistoryConnection {
            start_level: c.start_level,
            minimum_charge: vehicle.minimum_charge,
            maximum_charge: vehicle.maximum_charge,
            needed,
            offsite,
            rows,
        });
    }
    out
}

fn hourly_rows(c: &Connection, price_points: &[PricePoint], denom_base: f64) -> Vec<HourlyRow> {
    let mut rows = Vec::new();
    let mut hour = truncate_hour(c.start_ts);
    let end_hour = truncate_hour(c.end_ts);

    while hour <= end_hour {
        let hour_end = hour + Duration::hours(1);
        let overlap_start = c.start_ts.max(hour);
        let overlap_end = c.end_ts.min(hour_end);
        let overlap_s = (overlap_end - overlap_start).num_milliseconds().max(0) as f64 / 1000.0;
        let fraction = (overlap_s / 3600.0).clamp(0.0, 1.0);

        if fraction > 0.0 {
            let price = price_points
                .iter()
                .filter(|p| p.ts <= hour)
                .max_by_key(|p| p.ts)
                .map(|p| p.price_per_kwh())
                .unwrap_or(0.0);
            let threshold = if denom_base != 0.0 { price / denom_base } else { 0.0 };
            rows.push(HourlyRow { hour, fraction, price, threshold });
        }
        hour = hour_end;
    }
    rows
}

fn truncate_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{Datelike, Timelike};
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
        .single()
        .unwrap_or(ts)
}

/// Simulates charging this vehicle's history against candidate threshold `t`.
/// Returns `Some(cost_per_energy)` if the vehicle never dropped below
/// `minimum_charge / 2`, `None` if this threshold fails.
fn simulate(history: &[HistoryConnection], t: f64, level_charge_time_s: f64) -> Option<f64> {
    let mut lvl: Option<Percent> = None;
    let mut total_charged = 0.0_f64;
    let mut total_cost = 0.0_f64;
    let mut last_offsite = true;
    let mut final_lvl = 0;
    let mut final_min = 0;

    for conn in history {
        let mut current = if last_offsite || lvl.is_none() {
            conn.start_level
        } else {
            lvl.unwrap() - conn.needed
        };

        if current < conn.minimum_charge / 2 {
            return None;
        }

        let needed_level = ((conn.minimum_charge as f64 + conn.needed as f64 * 1.1) as i32).clamp(conn.minimum_charge, conn.maximum_charge);

        if !conn.offsite {
            let mut rows: Vec<&HourlyRow> = conn.rows.iter().collect();

            // Emergency phase: time order, until lvl >= minimum_charge.
            rows.sort_by_key(|r| r.hour);
            let mut remaining: Vec<&HourlyRow> = Vec::new();
            for r in rows {
                if current < conn.minimum_charge {
                    let cap_pct = if level_charge_time_s > 0.0 { (r.fraction * 3600.0) / level_charge_time_s } else { 0.0 };
                    let gain = cap_pct.min((conn.maximum_charge - current) as f64).max(0.0);
                    if gain > 0.0 {
                        let charge_time_s = gain * level_charge_time_s;
                        total_charged += gain;
                        total_cost += (charge_time_s / 3600.0) * r.price;
                        current = (current as f64 + gain).round() as i32;
                    }
                } else {
                    remaining.push(r);
                }
            }

            // Smart phase: ascending threshold order.
            remaining.sort_by(|a, b| a.threshold.partial_cmp(&b.threshold).unwrap());
            for r in remaining {
                let target = if r.threshold <= t {
                    conn.maximum_charge
                } else if current < needed_level {
                    needed_level
                } else {
                    continue;
                };
                if current >= target {
                    continue;
                }
                let time_cap_s = r.fraction * 3600.0;
                let level_cap_pct = if level_charge_time_s > 0.0 { time_cap_s / level_charge_time_s } else { 0.0 };
                let gain = level_cap_pct.min((target - current) as f64).max(0.0);
                if gain <= 0.0 {
                    continue;
                }
                let charge_time_s = gain * level_charge_time_s;
                total_charged += gain;
                total_cost += (charge_time_s / 3600.0) * r.price;
                current = (current as f64 + gain).round() as i32;
            }
        }

        lvl = Some(current);
        last_offsite = conn.offsite;
        final_lvl = current;
        final_min = conn.minimum_charge;
    }

    if final_lvl > final_min && total_charged > 0.0 {
        Some(total_cost / total_charged)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    fn vehicle(id: VehicleId, account_id: AccountId) -> Vehicle {
        Vehicle {
            id,
            account_id,
            name: "car".into(),
            minimum_charge: 50,
            maximum_charge: 90,
            anxiety_level: AnxietyLevel::Relaxed,
            scheduled_trip: None,
            paused_until: None,
            location_id: None,
            level: 60,
            odometer: 0.0,
            outside_deci_temp: 150,
            inside_deci_temp: 200,
            climate_on: false,
            driving: false,
            connected: false,
            connected_id: None,
            charge_id: None,
            trip_id: None,
            charge_plan: None,
            smart_status: "idle".into(),
            status: "ok".into(),
            updated: Utc::now(),
            provider_data: None,
        }
    }

    #[test]
    fn create_new_stats_defaults_to_threshold_100_with_no_history() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        gw.put_vehicle(&vehicle(vehicle_id, account_id)).unwrap();
        gw.put_location(&Location {
            id: location_id,
            account_id,
            name: "home".into(),
            geo: GeoPoint::from_degrees(59.0, 18.0),
            geo_fence_radius_m: 50.0,
            price_code: "SE3".into(),
        })
        .unwrap();

        let stats = create_new_stats(&gw, vehicle_id, location_id, Utc::now()).unwrap();
        assert_eq!(stats.threshold, DEFAULT_THRESHOLD);
        assert!(stats.level_charge_time_s.is_none());
    }

    #[test]
    fn current_stats_reuses_cache_when_price_list_unchanged() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        gw.put_vehicle(&vehicle(vehicle_id, account_id)).unwrap();
        gw.put_location(&Location {
            id: location_id,
            account_id,
            name: "home".into(),
            geo: GeoPoint::from_degrees(59.0, 18.0),
            geo_fence_radius_m: 50.0,
            price_code: "SE3".into(),
        })
        .unwrap();

        let now = Utc::now();
        let first = current_stats(&gw, vehicle_id, location_id, now).unwrap();
        let second = current_stats(&gw, vehicle_id, location_id, now).unwrap();
        assert_eq!(first.stats_id, second.stats_id);
    }
}
