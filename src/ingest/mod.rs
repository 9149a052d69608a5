//! Telemetry Ingestor: `update_vehicle_data`, the single entry point that
//! drives the Connection / Charge / Trip state machines and the hourly
//! event map from a raw vehicle sample.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use uuid::Uuid;

use crate::curve;
use crate::errors::IngestError;
use crate::gateway::Gateway;
use crate::models::*;
use crate::orchestrator;

/// Runs one telemetry sample through the state machines. Best-effort: any
/// failure here is logged by the caller and the sample dropped — it never
/// corrupts committed state because each write is its own gateway call and
/// this function aborts at the first error without partial side effects
/// beyond what has already committed.
pub fn update_vehicle_data(gw: &dyn Gateway, input: &UpdateVehicleDataInput, now: DateTime<Utc>) -> Result<(), IngestError> {
    let mut vehicle = gw.get_vehicle(input.id).map_err(|e| {
        log::warn!("update_vehicle_data: missing vehicle row for {}: {e}", input.id);
        IngestError::from(e)
    })?;

    let last_location_id = vehicle.location_id;
    let point = GeoPoint::from_degrees(input.lat_deg, input.lon_deg);
    let current_location = gw.find_location_at(vehicle.account_id, point)?;
    let current_location_id = current_location.as_ref().map(|l| l.id);

    vehicle.location_id = current_location_id;
    vehicle.level = input.battery_level;
    vehicle.odometer = input.odometer_m;
    vehicle.outside_deci_temp = (input.outside_temp_c * 10.0).round() as i32;
    vehicle.inside_deci_temp = (input.inside_temp_c * 10.0).round() as i32;
    vehicle.climate_on = input.climate_control;
    vehicle.driving = input.is_driving;
    vehicle.connected = input.connected_charger.is_some();
    vehicle.updated = now;

    let last_updated = vehicle.updated;
    let last_odometer = vehicle.odometer;

    let mut do_replan = false;
    let mut charge_energy: WattMinutes = 0.0;
    let charging_this_sample = input.charging_to.is_some();

    // --- Connection state machine ---
    if vehicle.connected || vehicle.connected_id.is_some() {
        let (replan, energy) = run_connection_sm(gw, &mut vehicle, input, current_location.as_ref(), now)?;
        do_replan |= replan;
        charge_energy += energy;
    }

    // --- Trip state machine ---
    let trip_active = last_location_id != current_location_id || vehicle.driving || vehicle.trip_id.is_some();
    if trip_active {
        do_replan |= run_trip_sm(gw, &mut vehicle, current_location_id, now)?;
    }

    let delta_time_s = (now - last_updated).num_milliseconds() as f64 / 1000.0;
    let driven_meters = (vehicle.odometer - last_odometer).max(0.0);
    let charged_seconds = if charging_this_sample { delta_time_s.max(0.0) as i64 } else { 0 };
    record_event_map(gw, &vehicle, delta_time_s, driven_meters, charged_seconds, charge_energy, now)?;

    gw.put_vehicle(&vehicle)?;

    if do_replan {
        if let Err(e) = orchestrator::refresh(gw, vehicle.id, now) {
            log::warn!("replan after telemetry for {} failed, previous plan retained: {e}", vehicle.id);
        }
    }

    Ok(())
}

fn run_connection_sm(
    gw: &dyn Gateway,
    vehicle: &mut Vehicle,
    input: &UpdateVehicleDataInput,
    current_location: Option<&Location>,
    now: DateTime<Utc>,
) -> Result<(bool, WattMinutes), IngestError> {
    let mut do_replan = false;

    let location = match current_location {
        Some(l) => l.clone(),
        None => {
            // No known location to attach the connection to; nothing more we can do this sample.
            return Ok((false, 0.0));
        }
    };

    let mut connection = match vehicle.connected_id {
        Some(id) => gw.get_connection(id)?,
        None => {
            let new_conn = Connection {
                connected_id: Uuid::new_v4(),
                vehicle_id: vehicle.id,
                location_id: location.id,
                charger_type: input.connected_charger.unwrap_or(ChargerType::Ac),
                start_ts: now,
                end_ts: now,
                start_level: vehicle.level,
                end_level: vehicle.level,
                energy_used: 0.0,
                cost: 0.0,
                saved: 0.0,
                connected: true,
                charged_seconds_accum: 0,
            };
            gw.open_connection(&new_conn)?;
            vehicle.connected_id = Some(new_conn.connected_id);
            do_replan = true;
            new_conn
        }
    };

    let mut charge_energy: WattMinutes = 0.0;
    if input.charging_to.is_some() {
        let (replan, energy) = run_charge_sm(gw, vehicle, &mut connection, input, &location, now)?;
        do_replan |= replan;
        charge_energy += energy;
    } else if vehicle.charge_id.is_some() {
        let charge_id = vehicle.charge_id.take().unwrap();
        gw.clear_charge_current(charge_id)?;
        let mut charge = gw.get_charge(charge_id)?;
        charge.end_ts = now;
        charge.end_level = vehicle.level;
        gw.update_charge(&charge)?;
    }

    connection.end_ts = now;
    connection.end_level = vehicle.level;
    connection.connected = vehicle.connected;
    gw.update_connection(&connection)?;

    if !vehicle.connected {
        vehicle.connected_id = None;
        vehicle.charge_plan = None;
        if let Err(e) = orchestrator::create_new_stats(gw, vehicle.id, connection.location_id, now) {
            log::warn!("createNewStats after disconnect for {} failed: {e}", vehicle.id);
        }
    }

    Ok((do_replan, charge_energy))
}

fn run_charge_sm(
    gw: &dyn Gateway,
    vehicle: &mut Vehicle,
    connection: &mut Connection,
    input: &UpdateVehicleDataInput,
    location: &Location,
    now: DateTime<Utc>,
) -> Result<(bool, WattMinutes), IngestError> {
    let mut do_replan = false;

    let charge_id = match vehicle.charge_id {
        Some(id) => id,
        None => {
            let new_charge = Charge {
                charge_id: Uuid::new_v4(),
                connected_id: connection.connected_id,
                vehicle_id: vehicle.id,
                location_id: location.id,
                charger_type: connection.charger_type,
                start_ts: now,
                end_ts: now,
                start_level: vehicle.level,
                end_level: vehicle.level,
                start_added: 0.0,
                end_added: 0.0,
                target_level: input.charging_to.unwrap_or(vehicle.maximum_charge),
                estimate_min: input.estimated_time_left_min,
                energy_used: 0.0,
            };
            gw.open_charge(&new_charge)?;
            vehicle.charge_id = Some(new_charge.charge_id);
            do_replan = true;
            new_charge.charge_id
        }
    };

    let mut charge = gw.get_charge(charge_id)?;
    let power_w = input.power_use_kw.unwrap_or(0.0) * 1000.0;
    let delta_time_s = (now - charge.end_ts).num_milliseconds() as f64 / 1000.0;
    let delta_used = (power_w * delta_time_s).max(0.0) / 60.0;
    connection.energy_used += delta_used;

    let price_now = price_now(gw, location, now)?;
    let price_then = price_then(gw, connection, location, now)?;
    if let Some(p) = price_now {
        charge.energy_used += delta_used;
        connection.cost += delta_used / 60_000.0 * p.price_per_kwh();
    }
    if let Some(p) = price_then {
        connection.saved += delta_used / 60_000.0 * p.price_per_kwh();
    }
    connection.charged_seconds_accum += delta_time_s.max(0.0) as i64;

    charge.end_ts = now;
    charge.end_level = vehicle.level;
    charge.end_added = input.energy_added_kwh.map(|kwh| kwh * 60_000.0).unwrap_or(charge.end_added);
    charge.target_level = input.charging_to.unwrap_or(charge.target_level);
    charge.estimate_min = input.estimated_time_left_min;

    if curve::observe_sample(
        gw,
        vehicle.id,
        location.id,
        charge_id,
        now,
        vehicle.level,
        power_w,
        vehicle.outside_deci_temp,
        charge.end_added,
    )? {
        do_replan = true;
    }

    gw.update_charge(&charge)?;

    Ok((do_replan, delta_used))
}

/// Latest price at or before `now` for the location's price feed.
fn price_now(gw: &dyn Gateway, location: &Location, now: DateTime<Utc>) -> Result<Option<PricePoint>, IngestError> {
    let from = now - Duration::days(2);
    let points = gw.get_prices(&location.price_code, from, now + Duration::hours(1))?;
    Ok(points.into_iter().filter(|p| p.ts <= now).max_by_key(|p| p.ts))
}

/// Price covering the time-shifted "as if charging had started at the
/// beginning of this connection" window, walking forward by the connection's
/// accumulated charged-seconds. Does not reset at connection boundaries (see
/// the design ledger): the accumulator lives on the `Connection` row itself.
fn price_then(gw: &dyn Gateway, connection: &Connection, location: &Location, now: DateTime<Utc>) -> Result<Option<PricePoint>, IngestError> {
    let shifted = connection.start_ts + Duration::seconds(connection.charged_seconds_accum);
    let from = shifted - Duration::days(2);
    let points = gw.get_prices(&location.price_code, from, now + Duration::hours(1))?;
    Ok(points.into_iter().filter(|p| p.ts <= shifted).max_by_key(|p| p.ts))
}

fn run_trip_sm(gw: &dyn Gateway, vehicle: &mut Vehicle, current_location_id: Option<LocationId>, now: DateTime<Utc>) -> Result<bool, IngestError> {
    let mut do_replan = false;

    let mut trip = match vehicle.trip_id {
        Some(id) => gw.get_open_trip(vehicle.id)?.filter(|t| t.trip_id == id),
        None => None,
    };

    if trip.is_none() {
        let new_trip = Trip {
            trip_id: Uuid::new_v4(),
            vehicle_id: vehicle.id,
            start_ts: now,
            end_ts: None,
            start_level: vehicle.level,
            end_level: None,
            start_location_id: current_location_id,
            end_location_id: None,
            start_odometer: vehicle.odometer,
            start_outside_deci_temp: vehicle.outside_deci_temp,
            distance_m: 0.0,
        };
        gw.open_trip(&new_trip)?;
        vehicle.trip_id = Some(new_trip.trip_id);
        trip = Some(new_trip);
    }

    let mut trip = trip.unwrap();
    trip.distance_m = (vehicle.odometer - trip.start_odometer).max(0.0);

    if !vehicle.driving {
        if current_location_id.is_some() {
            trip.end_ts = Some(now);
            trip.end_level = Some(vehicle.level);
            trip.end_location_id = current_location_id;
            if trip.distance_m < 1000.0 {
                // Trips under 1 km never appear in the trip store after termination.
                gw.delete_trip(trip.trip_id)?;
            } else {
                gw.update_trip(&trip)?;
            }
            vehicle.trip_id = None;
            do_replan = true;
        } else if vehicle.connected {
            trip.end_ts = Some(now);
            trip.end_level = Some(vehicle.level);
            gw.update_trip(&trip)?;
            vehicle.trip_id = None;
            do_replan = true;
        } else {
            gw.update_trip(&trip)?;
        }
    } else {
        gw.update_trip(&trip)?;
    }

    Ok(do_replan)
}

/// Upserts the hourly bucket for a sample spanning `delta_time_s` seconds
/// ending at `now`, provided `0 < delta_time_s < 3h` (sanity bound).
pub fn record_event_map(gw: &dyn Gateway, vehicle: &Vehicle, delta_time_s: f64, driven_meters: f64, charged_seconds: i64, charge_energy: WattMinutes, now: DateTime<Utc>) -> Result<(), IngestError> {
    if !(delta_time_s > 0.0 && delta_time_s < 3.0 * 3600.0) {
        return Ok(());
    }
    let hour = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
        .single()
        .unwrap_or(now);
    gw.upsert_event_map_row(&EventMapRow {
        vehicle_id: vehicle.id,
        hour,
        minimum_level: vehicle.level,
        maximum_level: vehicle.level,
        driven_seconds: if vehicle.driving { delta_time_s as i64 } else { 0 },
        driven_meters,
        charged_seconds,
        charge_energy,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;
    use chrono::TimeZone;

    fn base_vehicle(id: VehicleId, account_id: AccountId) -> Vehicle {
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
            updated: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            provider_data: None,
        }
    }

    #[test]
    fn connecting_opens_a_connection_and_requests_replan() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let vehicle_id = VehicleId::new_v4();
        gw.put_vehicle(&base_vehicle(vehicle_id, account_id)).unwrap();
        gw.put_location(&Location {
            id: LocationId::new_v4(),
            account_id,
            name: "home".into(),
            geo: GeoPoint::from_degrees(0.0, 0.0),
            geo_fence_radius_m: 50.0,
            price_code: "SE3".into(),
        })
        .unwrap();

        let now = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let input = UpdateVehicleDataInput {
            id: vehicle_id,
            lat_deg: 0.0,
            lon_deg: 0.0,
            battery_level: 60,
            odometer_m: 0.0,
            outside_temp_c: 15.0,
            inside_temp_c: 20.0,
            climate_control: false,
            is_driving: false,
            connected_charger: Some(ChargerType::Ac),
            charging_to: None,
            estimated_time_left_min: None,
            power_use_kw: None,
            energy_added_kwh: None,
        };

        update_vehicle_data(&gw, &input, now).unwrap();
        let vehicle = gw.get_vehicle(vehicle_id).unwrap();
        assert!(vehicle.connected);
        assert!(vehicle.connected_id.is_some());
    }

    #[test]
    fn missing_vehicle_row_is_fatal() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let input = UpdateVehicleDataInput {
            id: VehicleId::new_v4(),
            lat_deg: 0.0,
            lon_deg: 0.0,
            battery_level: 50,
            odometer_m: 0.0,
            outside_temp_c: 10.0,
            inside_temp_c: 20.0,
            climate_control: false,
            is_driving: false,
            connected_charger: None,
            charging_to: None,
            estimated_time_left_min: None,
            power_use_kw: None,
            energy_added_kwh: None,
        };
        let err = update_vehicle_data(&gw, &input, Utc::now()).is_err();
        assert!(err);
    }

    #[test]
    fn charging_sample_upserts_the_hourly_event_map() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        gw.put_location(&Location {
            id: location_id,
            account_id,
            name: "home".into(),
            geo: GeoPoint::from_degrees(0.0, 0.0),
            geo_fence_radius_m: 50.0,
            price_code: "SE3".into(),
        })
        .unwrap();
        gw.put_vehicle(&base_vehicle(vehicle_id, account_id)).unwrap();

        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let input = UpdateVehicleDataInput {
            id: vehicle_id,
            lat_deg: 0.0,
            lon_deg: 0.0,
            battery_level: 61,
            odometer_m: 0.0,
            outside_temp_c: 15.0,
            inside_temp_c: 20.0,
            climate_control: false,
            is_driving: false,
            connected_charger: Some(ChargerType::Ac),
            charging_to: Some(80),
            estimated_time_left_min: Some(120),
            power_use_kw: Some(7.0),
            energy_added_kwh: Some(0.1),
        };
        update_vehicle_data(&gw, &input, t0).unwrap();

        let t1 = t0 + Duration::minutes(10);
        let input2 = UpdateVehicleDataInput { battery_level: 65, energy_added_kwh: Some(0.3), ..input };
        update_vehicle_data(&gw, &input2, t1).unwrap();

        let hour = Utc.with_ymd_and_hms(t1.year(), t1.month(), t1.day(), t1.hour(), 0, 0).unwrap();
        let rows = gw.get_event_map(vehicle_id, hour, hour + Duration::hours(1)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].charged_seconds, 600);
        assert!(rows[0].charge_energy > 0.0);
    }

    #[test]
    fn short_trip_is_deleted_on_arrival() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let vehicle_id = VehicleId::new_v4();
        let location_id = LocationId::new_v4();
        gw.put_location(&Location {
            id: location_id,
            account_id,
            name: "home".into(),
            geo: GeoPoint::from_degrees(0.0, 0.0),
            geo_fence_radius_m: 50.0,
            price_code: "SE3".into(),
        })
        .unwrap();
        let mut vehicle = base_vehicle(vehicle_id, account_id);
        vehicle.location_id = Some(location_id);
        gw.put_vehicle(&vehicle).unwrap();

        // Drives away from the home geo-fence.
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let driving_away = UpdateVehicleDataInput {
            id: vehicle_id,
            lat_deg: 5.0,
            lon_deg: 5.0,
            battery_level: 60,
            odometer_m: 500.0,
            outside_temp_c: 15.0,
            inside_temp_c: 20.0,
            climate_control: false,
            is_driving: true,
            connected_charger: None,
            charging_to: None,
            estimated_time_left_min: None,
            power_use_kw: None,
            energy_added_kwh: None,
        };
        update_vehicle_data(&gw, &driving_away, t0).unwrap();
        let trip_id = gw.get_vehicle(vehicle_id).unwrap().trip_id.unwrap();

        // Returns home having covered under 1 km.
        let t1 = t0 + Duration::minutes(2);
        let arrived = UpdateVehicleDataInput { lat_deg: 0.0, lon_deg: 0.0, odometer_m: 900.0, is_driving: false, ..driving_away };
        update_vehicle_data(&gw, &arrived, t1).unwrap();

        assert!(gw.get_open_trip(vehicle_id).unwrap().is_none());

        let stale = Trip {
            trip_id,
            vehicle_id,
            start_ts: t0,
            end_ts: Some(t1),
            start_level: 60,
            end_level: Some(60),
            start_location_id: None,
            end_location_id: Some(location_id),
            start_odometer: 500.0,
            start_outside_deci_temp: 150,
            distance_m: 400.0,
        };
        let err = gw.update_trip(&stale).unwrap_err();
        assert!(matches!(err, crate::errors::GatewayError::NotFound(_)));
    }
}
