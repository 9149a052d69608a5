//! Persistence Gateway: the only part of the engine that talks to the store.
//!
//! Every other component calls through the [`Gateway`] trait; the sqlite
//! implementation lives in [`sqlite`]. Kept as a trait so the statistics and
//! planner tests can run against an in-memory connection without touching disk.

pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::errors::GatewayError;
use crate::models::*;

pub type Result<T> = std::result::Result<T, GatewayError>;

pub trait Gateway: Send + Sync {
    fn get_vehicle(&self, id: VehicleId) -> Result<Vehicle>;
    fn put_vehicle(&self, vehicle: &Vehicle) -> Result<()>;
    fn list_vehicles_for_account(&self, account_id: AccountId) -> Result<Vec<Vehicle>>;
    /// Distinct account ids known to the core's own tables, for the housekeeping
    /// sweep (`crate::orchestrator`) to enumerate — not a domain entity of its own.
    fn list_account_ids(&self) -> Result<Vec<AccountId>>;
    /// Vehicles currently parked (`location_id` set) at a location billed under
    /// `price_code`, used by `on_price_feed_updated` to find who needs a replan.
    fn list_vehicle_ids_at_price_code(&self, price_code: &PriceCode) -> Result<Vec<VehicleId>>;

    fn get_location(&self, id: LocationId) -> Result<Location>;
    fn put_location(&self, location: &Location) -> Result<()>;
    fn find_location_at(&self, account_id: AccountId, point: GeoPoint) -> Result<Option<Location>>;

    /// Requires the internal service identity; callers without it get `AuthDenied`.
    fn update_price(&self, price_code: &PriceCode, points: &[PricePoint], is_internal: bool) -> Result<()>;
    fn get_prices(&self, price_code: &PriceCode, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PricePoint>>;

    fn open_connection(&self, conn: &Connection) -> Result<()>;
    fn update_connection(&self, conn: &Connection) -> Result<()>;
    fn get_connection(&self, id: ConnectionId) -> Result<Connection>;
    /// Closed connections (`connected = false`) for a vehicle starting in `[from, to)`,
    /// ordered by `start_ts` ascending — the window the Statistics Engine simulates over.
    fn list_closed_connections_for_vehicle(&self, vehicle_id: VehicleId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Connection>>;

    fn open_charge(&self, charge: &Charge) -> Result<()>;
    fn update_charge(&self, charge: &Charge) -> Result<()>;
    fn get_charge(&self, id: ChargeId) -> Result<Charge>;
    fn list_charges_for_connection(&self, connected_id: ConnectionId) -> Result<Vec<Charge>>;

    fn put_charge_current(&self, current: &ChargeCurrent) -> Result<()>;
    fn get_charge_current(&self, charge_id: ChargeId) -> Result<Option<ChargeCurrent>>;
    fn clear_charge_current(&self, charge_id: ChargeId) -> Result<()>;

    fn get_charge_curve(&self, vehicle_id: VehicleId, location_id: LocationId) -> Result<Vec<ChargeCurve>>;
    fn put_charge_curve_point(&self, point: &ChargeCurve) -> Result<()>;

    fn open_trip(&self, trip: &Trip) -> Result<()>;
    fn update_trip(&self, trip: &Trip) -> Result<()>;
    fn get_open_trip(&self, vehicle_id: VehicleId) -> Result<Option<Trip>>;
    /// Removes a trip from the store outright. Used for trips that never reached
    /// the 1km distance floor: they never appear in the trip store after termination.
    fn delete_trip(&self, trip_id: TripId) -> Result<()>;

    fn upsert_event_map_row(&self, row: &EventMapRow) -> Result<()>;
    fn get_event_map(&self, vehicle_id: VehicleId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<EventMapRow>>;

    fn get_current_stats(&self, vehicle_id: VehicleId) -> Result<Option<CurrentStats>>;
    fn put_current_stats(&self, stats: &CurrentStats) -> Result<()>;
}
