//! Domain entities shared by every part of the planning engine.
//!
//! These mirror the relational schema directly (`vehicle`, `location`, `price_list`,
//! `connected`, `charge`, `charge_current`, `charge_curve`, `trip`, `event_map`,
//! `current_stats`) so that the gateway layer can map rows to structs without any
//! translation step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type VehicleId = Uuid;
pub type AccountId = Uuid;
pub type LocationId = Uuid;
pub type ConnectionId = Uuid;
pub type ChargeId = Uuid;
pub type TripId = Uuid;

/// Battery level in whole percent, 0-100.
pub type Percent = i32;

/// Energy in Watt-minutes (W * seconds / 60).
pub type WattMinutes = f64;

/// Price code identifying a tariff area / feed (e.g. "SE4").
pub type PriceCode = String;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ChargerType {
    Ac,
    Dc,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[repr(i32)]
pub enum AnxietyLevel {
    Relaxed = 0,
    Cautious = 1,
    Nervous = 2,
}

impl AnxietyLevel {
    pub fn from_i32(v: i32) -> Option<AnxietyLevel> {
        match v {
            0 => Some(AnxietyLevel::Relaxed),
            1 => Some(AnxietyLevel::Cautious),
            2 => Some(AnxietyLevel::Nervous),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledTrip {
    pub level: Percent,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Vehicle {
    pub id: VehicleId,
    pub account_id: AccountId,
    pub name: String,
    pub minimum_charge: Percent,
    pub maximum_charge: Percent,
    pub anxiety_level: AnxietyLevel,
    pub scheduled_trip: Option<ScheduledTrip>,
    pub paused_until: Option<DateTime<Utc>>,
    pub location_id: Option<LocationId>,
    pub level: Percent,
    pub odometer: f64,
    pub outside_deci_temp: i32,
    pub inside_deci_temp: i32,
    pub climate_on: bool,
    pub driving: bool,
    pub connected: bool,
    pub connected_id: Option<ConnectionId>,
    pub charge_id: Option<ChargeId>,
    pub trip_id: Option<TripId>,
    pub charge_plan: Option<Vec<ChargePlanSegment>>,
    pub smart_status: String,
    pub status: String,
    pub updated: DateTime<Utc>,
    pub provider_data: Option<serde_json::Value>,
}

impl Vehicle {
    pub fn validate(&self) -> Result<(), String> {
        if self.minimum_charge > self.maximum_charge {
            return Err(format!(
                "minimum_charge {} must be <= maximum_charge {}",
                self.minimum_charge, self.maximum_charge
            ));
        }
        if !(0..=100).contains(&self.minimum_charge) || !(0..=100).contains(&self.maximum_charge) {
            return Err("charge bounds must lie within 0..=100".into());
        }
        if self.charge_id.is_some() && self.connected_id.is_none() {
            return Err("charge_id requires connected_id".into());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GeoPoint {
    pub lat_micro: i64,
    pub lon_micro: i64,
}

impl GeoPoint {
    pub fn from_degrees(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint {
            lat_micro: (lat * 1_000_000.0).round() as i64,
            lon_micro: (lon * 1_000_000.0).round() as i64,
        }
    }

    /// Great-circle distance in meters using the equirectangular approximation,
    /// adequate at the scale of a single property's geofence.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let lat1 = (self.lat_micro as f64 / 1_000_000.0).to_radians();
        let lat2 = (other.lat_micro as f64 / 1_000_000.0).to_radians();
        let dlat = lat2 - lat1;
        let dlon = ((other.lon_micro - self.lon_micro) as f64 / 1_000_000.0).to_radians();
        let x = dlon * ((lat1 + lat2) / 2.0).cos();
        let y = dlat;
        EARTH_RADIUS_M * (x * x + y * y).sqrt()
    }
}

#[derive(Clone, Debug)]
pub struct Location {
    pub id: LocationId,
    pub account_id: AccountId,
    pub name: String,
    pub geo: GeoPoint,
    pub geo_fence_radius_m: f64,
    pub price_code: PriceCode,
}

#[derive(Clone, Copy, Debug)]
pub struct PricePoint {
    pub ts: DateTime<Utc>,
    /// Currency per kWh, integer scaled x100000.
    pub price_scaled: i64,
}

impl PricePoint {
    pub fn price_per_kwh(&self) -> f64 {
        self.price_scaled as f64 / 100_000.0
    }
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub connected_id: ConnectionId,
    pub vehicle_id: VehicleId,
    pub location_id: LocationId,
    pub charger_type: ChargerType,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub start_level: Percent,
    pub end_level: Percent,
    pub energy_used: WattMinutes,
    pub cost: f64,
    pub saved: f64,
    pub connected: bool,
    /// Accumulated charging seconds within this connection, used as the time-shift
    /// anchor for the price-then computation (see `crate::ingest::price_then`).
    pub charged_seconds_accum: i64,
}

#[derive(Clone, Debug)]
pub struct Charge {
    pub charge_id: ChargeId,
    pub connected_id: ConnectionId,
    pub vehicle_id: VehicleId,
    pub location_id: LocationId,
    pub charger_type: ChargerType,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub start_level: Percent,
    pub end_level: Percent,
    pub start_added: WattMinutes,
    pub end_added: WattMinutes,
    pub target_level: Percent,
    pub estimate_min: Option<i32>,
    pub energy_used: WattMinutes,
}

#[derive(Clone, Debug)]
pub struct ChargeCurrent {
    pub charge_id: ChargeId,
    pub start_ts: DateTime<Utc>,
    pub start_level: Percent,
    pub start_added: WattMinutes,
    pub powers: Vec<f64>,
    pub outside_deci_temps: Vec<i32>,
    /// True once the first 1% gain of this Charge has been seen and discarded
    /// as integer-truncation noise; every gain after that is eligible for a
    /// curve point.
    pub discarded_first_gain: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct ChargeCurve {
    pub vehicle_id: VehicleId,
    pub location_id: LocationId,
    pub level: Percent,
    pub duration_s: f64,
    pub avg_deci_temp: f64,
    pub energy_used: WattMinutes,
    pub energy_added: WattMinutes,
}

#[derive(Clone, Debug)]
pub struct Trip {
    pub trip_id: TripId,
    pub vehicle_id: VehicleId,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub start_level: Percent,
    pub end_level: Option<Percent>,
    pub start_location_id: Option<LocationId>,
    pub end_location_id: Option<LocationId>,
    pub start_odometer: f64,
    pub start_outside_deci_temp: i32,
    pub distance_m: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct EventMapRow {
    pub vehicle_id: VehicleId,
    pub hour: DateTime<Utc>,
    pub minimum_level: Percent,
    pub maximum_level: Percent,
    pub driven_seconds: i64,
    pub driven_meters: f64,
    pub charged_seconds: i64,
    pub charge_energy: WattMinutes,
}

impl EventMapRow {
    /// Combines two rows covering the same hour: min-of, max-of, sum-of.
    pub fn combine(&self, other: &EventMapRow) -> EventMapRow {
        EventMapRow {
            vehicle_id: self.vehicle_id,
            hour: self.hour,
            minimum_level: self.minimum_level.min(other.minimum_level),
            maximum_level: self.maximum_level.max(other.maximum_level),
            driven_seconds: self.driven_seconds + other.driven_seconds,
            driven_meters: self.driven_meters + other.driven_meters,
            charged_seconds: self.charged_seconds + other.charged_seconds,
            charge_energy: self.charge_energy + other.charge_energy,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CurrentStats {
    pub stats_id: Uuid,
    pub vehicle_id: VehicleId,
    pub location_id: LocationId,
    pub price_list_ts: DateTime<Utc>,
    pub level_charge_time_s: Option<f64>,
    pub weekly_avg7_price: f64,
    pub weekly_avg21_price: f64,
    pub threshold: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ChargeType {
    Calibrate,
    Minimum,
    Trip,
    Routine,
    Prefered,
    Fill,
}

impl ChargeType {
    /// Lower is higher priority when reconciling overlapping segments.
    pub fn priority(&self) -> u8 {
        match self {
            ChargeType::Calibrate => 0,
            ChargeType::Minimum => 1,
            ChargeType::Trip => 2,
            ChargeType::Routine => 3,
            ChargeType::Prefered => 4,
            ChargeType::Fill => 5,
        }
    }
}

/// One element of a charge plan. `charge_start: None` means "start now",
/// `charge_stop: None` means "charge until done".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChargePlanSegment {
    pub charge_start: Option<DateTime<Utc>>,
    pub charge_stop: Option<DateTime<Utc>>,
    pub level: Percent,
    pub charge_type: ChargeType,
    pub comment: String,
}

/// Telemetry ingress sample, one per vehicle report.
#[derive(Clone, Debug)]
pub struct UpdateVehicleDataInput {
    pub id: VehicleId,
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub battery_level: Percent,
    pub odometer_m: f64,
    pub outside_temp_c: f64,
    pub inside_temp_c: f64,
    pub climate_control: bool,
    pub is_driving: bool,
    pub connected_charger: Option<ChargerType>,
    pub charging_to: Option<Percent>,
    pub estimated_time_left_min: Option<i32>,
    pub power_use_kw: Option<f64>,
    pub energy_added_kwh: Option<f64>,
}

/// Message handed to a provider adapter; the core never executes it.
#[derive(Clone, Debug, Serialize)]
pub struct Action {
    pub action_id: Uuid,
    pub target_id: VehicleId,
    pub provider_name: String,
    pub action: String,
    pub data: serde_json::Value,
}
