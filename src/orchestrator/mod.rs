//! Replan Orchestrator: `refresh`, `refresh_account`, `on_price_feed_updated`.
//!
//! Bridges telemetry ingestion and price updates to the Planner while
//! enforcing a single-writer-per-vehicle rule: each vehicle's
//! `load -> compute -> write` critical section is bracketed by a
//! per-vehicle mutex so concurrent replans for the same vehicle serialize,
//! while replans for different vehicles run in parallel on the rayon pool
//! the binary configures at startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::errors::OrchestratorError;
use crate::gateway::Gateway;
use crate::models::{AccountId, CurrentStats, LocationId, PriceCode, VehicleId};
use crate::{planner, stats};

type LockMap = Mutex<HashMap<VehicleId, Arc<Mutex<()>>>>;

fn locks() -> &'static LockMap {
    static LOCKS: OnceLock<LockMap> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the mutex guarding `vehicle_id`'s critical section, creating one
/// on first use. The map itself is locked only long enough to fetch or
/// insert the per-vehicle `Arc`, never held across a replan.
fn vehicle_lock(vehicle_id: VehicleId) -> Arc<Mutex<()>> {
    let mut map = locks().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(vehicle_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

/// Rebuilds one vehicle's charge plan. Acquires the vehicle-scoped lock so
/// this replan and any telemetry-triggered replan for the same vehicle
/// never interleave their gateway reads and writes.
pub fn refresh(gw: &dyn Gateway, vehicle_id: VehicleId, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
    let lock = vehicle_lock(vehicle_id);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
    planner::refresh_vehicle_charge_plan(gw, vehicle_id, now).map_err(|e| {
        log::warn!("replan failed for vehicle {vehicle_id}, previous plan retained: {e}");
        OrchestratorError::new(e.to_string(), &vehicle_id.to_string())
    })
}

/// Refreshes every vehicle belonging to `account_id`. One vehicle's
/// failure never stops the others — each is attempted independently and
/// failures are collected rather than propagated, matching the "replan
/// failures never clear an existing plan" policy: the sweep's job is
/// to make as much forward progress as it safely can.
pub fn refresh_account(gw: &dyn Gateway, account_id: AccountId, now: DateTime<Utc>) -> Result<Vec<(VehicleId, Option<String>)>, OrchestratorError> {
    let vehicles = gw.list_vehicles_for_account(account_id)?;
    let outcomes: Vec<(VehicleId, Option<String>)> = vehicles
        .par_iter()
        .map(|v| (v.id, refresh(gw, v.id, now).err().map(|e| e.to_string())))
        .collect();
    Ok(outcomes)
}

/// Called after a price feed load completes: refreshes every vehicle
/// currently parked at a location billed under `price_code`, since their
/// cached `CurrentStats` are now stale relative to the new price list.
pub fn on_price_feed_updated(gw: &dyn Gateway, price_code: &PriceCode, now: DateTime<Utc>) -> Result<Vec<(VehicleId, Option<String>)>, OrchestratorError> {
    let vehicle_ids = gw.list_vehicle_ids_at_price_code(price_code)?;
    let outcomes: Vec<(VehicleId, Option<String>)> = vehicle_ids
        .par_iter()
        .map(|&id| (id, refresh(gw, id, now).err().map(|e| e.to_string())))
        .collect();
    Ok(outcomes)
}

/// Thin wrapper around the Statistics Engine's `create_new_stats`, called by
/// the Telemetry Ingestor when a connection closes. Kept here
/// rather than called directly from `ingest` so the orchestrator remains the
/// single place that bridges ingestion to the stats/planner subsystems.
pub fn create_new_stats(gw: &dyn Gateway, vehicle_id: VehicleId, location_id: LocationId, now: DateTime<Utc>) -> Result<CurrentStats, OrchestratorError> {
    Ok(stats::create_new_stats(gw, vehicle_id, location_id, now)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;
    use crate::models::*;

    fn vehicle_at(id: VehicleId, account_id: AccountId, location_id: LocationId) -> Vehicle {
        Vehicle {
            id,
            account_id,
            name: "car".into(),
            minimum_charge: 50,
            maximum_charge: 90,
            anxiety_level: AnxietyLevel::Relaxed,
            scheduled_trip: None,
            paused_until: None,
            location_id: Some(location_id),
            level: 70,
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
            smart_status: String::new(),
            status: "ok".into(),
            updated: Utc::now(),
            provider_data: None,
        }
    }

    #[test]
    fn refresh_account_refreshes_every_vehicle_even_when_one_has_no_location() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
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

        let v1 = VehicleId::new_v4();
        let v2 = VehicleId::new_v4();
        gw.put_vehicle(&vehicle_at(v1, account_id, location_id)).unwrap();
        let mut stranded = vehicle_at(v2, account_id, location_id);
        stranded.location_id = None;
        gw.put_vehicle(&stranded).unwrap();

        let outcomes = refresh_account(&gw, account_id, Utc::now()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, err)| err.is_none()));
    }

    #[test]
    fn concurrent_refresh_of_the_same_vehicle_serializes() {
        let gw = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let account_id = AccountId::new_v4();
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
        let vehicle_id = VehicleId::new_v4();
        gw.put_vehicle(&vehicle_at(vehicle_id, account_id, location_id)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gw = gw.clone();
                std::thread::spawn(move || refresh(gw.as_ref(), vehicle_id, Utc::now()).is_ok())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
