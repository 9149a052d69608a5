//! rusqlite-backed implementation of [`super::Gateway`].
//!
//! Schema mirrors the data model directly: one table per entity, no
//! ORM layer. Connection pooling is a single `Mutex<Connection>` — sqlite
//! serializes writers internally anyway and the engine's own per-vehicle
//! locking (see `crate::orchestrator`) keeps contention low.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use crate::errors::GatewayError;
use crate::models::*;

use super::{Gateway, Result};

pub struct SqliteGateway {
    conn: Mutex<rusqlite::Connection>,
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn from_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

impl SqliteGateway {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GatewayError::Transient(e.to_string()))?;
            }
        }
        let conn = rusqlite::Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vehicle (
                id              TEXT PRIMARY KEY,
                account_id      TEXT NOT NULL,
                name            TEXT NOT NULL,
                minimum_charge  INTEGER NOT NULL,
                maximum_charge  INTEGER NOT NULL,
                anxiety_level   INTEGER NOT NULL,
                scheduled_trip_level INTEGER,
                scheduled_trip_time  TEXT,
                paused_until    TEXT,
                location_id     TEXT,
                level           INTEGER NOT NULL,
                odometer        REAL NOT NULL,
                outside_deci_temp INTEGER NOT NULL,
                inside_deci_temp  INTEGER NOT NULL,
                climate_on      INTEGER NOT NULL,
                driving         INTEGER NOT NULL,
                connected       INTEGER NOT NULL,
                connected_id    TEXT,
                charge_id       TEXT,
                trip_id         TEXT,
                charge_plan     TEXT,
                smart_status    TEXT NOT NULL,
                status          TEXT NOT NULL,
                updated         TEXT NOT NULL,
                provider_data   TEXT
            );

            CREATE TABLE IF NOT EXISTS location (
                id              TEXT PRIMARY KEY,
                account_id      TEXT NOT NULL,
                name            TEXT NOT NULL,
                lat_micro       INTEGER NOT NULL,
                lon_micro       INTEGER NOT NULL,
                geo_fence_radius_m REAL NOT NULL,
                price_code      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS price_list (
                price_code      TEXT NOT NULL,
                ts              TEXT NOT NULL,
                price_scaled    INTEGER NOT NULL,
                PRIMARY KEY (price_code, ts)
            );

            CREATE TABLE IF NOT EXISTS connected (
                connected_id    TEXT PRIMARY KEY,
                vehicle_id      TEXT NOT NULL,
                location_id     TEXT NOT NULL,
                charger_type    TEXT NOT NULL,
                start_ts        TEXT NOT NULL,
                end_ts          TEXT NOT NULL,
                start_level     INTEGER NOT NULL,
                end_level       INTEGER NOT NULL,
                energy_used     REAL NOT NULL,
                cost            REAL NOT NULL,
                saved           REAL NOT NULL,
                connected       INTEGER NOT NULL,
                charged_seconds_accum INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_connected_vehicle ON connected(vehicle_id, start_ts);

            CREATE TABLE IF NOT EXISTS charge (
                charge_id       TEXT PRIMARY KEY,
                connected_id    TEXT NOT NULL,
                vehicle_id      TEXT NOT NULL,
                location_id     TEXT NOT NULL,
                charger_type    TEXT NOT NULL,
                start_ts        TEXT NOT NULL,
                end_ts          TEXT NOT NULL,
                start_level     INTEGER NOT NULL,
                end_level       INTEGER NOT NULL,
                start_added     REAL NOT NULL,
                end_added       REAL NOT NULL,
                target_level    INTEGER NOT NULL,
                estimate_min    INTEGER,
                energy_used     REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_charge_connected ON charge(connected_id);

            CREATE TABLE IF NOT EXISTS charge_current (
                charge_id       TEXT PRIMARY KEY,
                start_ts        TEXT NOT NULL,
                start_level     INTEGER NOT NULL,
                start_added     REAL NOT NULL,
                powers          TEXT NOT NULL,
                outside_deci_temps TEXT NOT NULL,
                discarded_first_gain INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS charge_curve (
                vehicle_id      TEXT NOT NULL,
                location_id     TEXT NOT NULL,
                level           INTEGER NOT NULL,
                duration_s      REAL NOT NULL,
                avg_deci_temp   REAL NOT NULL,
                energy_used     REAL NOT NULL,
                energy_added    REAL NOT NULL,
                PRIMARY KEY (vehicle_id, location_id, level)
            );

            CREATE TABLE IF NOT EXISTS trip (
                trip_id         TEXT PRIMARY KEY,
                vehicle_id      TEXT NOT NULL,
                start_ts        TEXT NOT NULL,
                end_ts          TEXT,
                start_level     INTEGER NOT NULL,
                end_level       INTEGER,
                start_location_id TEXT,
                end_location_id   TEXT,
                start_odometer  REAL NOT NULL,
                start_outside_deci_temp INTEGER NOT NULL,
                distance_m      REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trip_vehicle_open ON trip(vehicle_id, end_ts);

            CREATE TABLE IF NOT EXISTS event_map (
                vehicle_id      TEXT NOT NULL,
                hour            TEXT NOT NULL,
                minimum_level   INTEGER NOT NULL,
                maximum_level   INTEGER NOT NULL,
                driven_seconds  INTEGER NOT NULL,
                driven_meters   REAL NOT NULL,
                charged_seconds INTEGER NOT NULL,
                charge_energy   REAL NOT NULL,
                PRIMARY KEY (vehicle_id, hour)
            );

            CREATE TABLE IF NOT EXISTS current_stats (
                stats_id        TEXT PRIMARY KEY,
                vehicle_id      TEXT NOT NULL,
                location_id     TEXT NOT NULL,
                price_list_ts   TEXT NOT NULL,
                level_charge_time_s REAL,
                weekly_avg7_price REAL NOT NULL,
                weekly_avg21_price REAL NOT NULL,
                threshold       INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_current_stats_vehicle ON current_stats(vehicle_id, location_id);",
        )?;
        Ok(())
    }

    fn charger_type_str(t: ChargerType) -> &'static str {
        match t {
            ChargerType::Ac => "ac",
            ChargerType::Dc => "dc",
        }
    }

    fn charger_type_from_str(s: &str) -> ChargerType {
        match s {
            "dc" => ChargerType::Dc,
            _ => ChargerType::Ac,
        }
    }

    fn put_vehicle_once(&self, v: &Vehicle) -> Result<()> {
        let conn = self.conn.lock()?;
        let (trip_level, trip_time) = match &v.scheduled_trip {
            Some(t) => (Some(t.level), Some(to_rfc3339(t.time))),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO vehicle (id, account_id, name, minimum_charge, maximum_charge, anxiety_level,
                scheduled_trip_level, scheduled_trip_time, paused_until, location_id, level, odometer,
                outside_deci_temp, inside_deci_temp, climate_on, driving, connected, connected_id,
                charge_id, trip_id, charge_plan, smart_status, status, updated, provider_data)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)
             ON CONFLICT(id) DO UPDATE SET
                account_id=?2, name=?3, minimum_charge=?4, maximum_charge=?5, anxiety_level=?6,
                scheduled_trip_level=?7, scheduled_trip_time=?8, paused_until=?9, location_id=?10,
                level=?11, odometer=?12, outside_deci_temp=?13, inside_deci_temp=?14, climate_on=?15,
                driving=?16, connected=?17, connected_id=?18, charge_id=?19, trip_id=?20,
                charge_plan=?21, smart_status=?22, status=?23, updated=?24, provider_data=?25",
            params![
                v.id.to_string(),
                v.account_id.to_string(),
                v.name,
                v.minimum_charge,
                v.maximum_charge,
                v.anxiety_level as i32,
                trip_level,
                trip_time,
                v.paused_until.map(to_rfc3339),
                v.location_id.map(|x| x.to_string()),
                v.level,
                v.odometer,
                v.outside_deci_temp,
                v.inside_deci_temp,
                v.climate_on,
                v.driving,
                v.connected,
                v.connected_id.map(|x| x.to_string()),
                v.charge_id.map(|x| x.to_string()),
                v.trip_id.map(|x| x.to_string()),
                v.charge_plan.as_ref().map(|p| serde_json::to_string(p).unwrap_or_default()),
                v.smart_status,
                v.status,
                to_rfc3339(v.updated),
                v.provider_data.as_ref().map(|p| p.to_string()),
            ],
        )?;
        Ok(())
    }
}

impl Gateway for SqliteGateway {
    fn get_vehicle(&self, id: VehicleId) -> Result<Vehicle> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT id, account_id, name, minimum_charge, maximum_charge, anxiety_level,
                    scheduled_trip_level, scheduled_trip_time, paused_until, location_id, level,
                    odometer, outside_deci_temp, inside_deci_temp, climate_on, driving, connected,
                    connected_id, charge_id, trip_id, charge_plan, smart_status, status, updated, provider_data
             FROM vehicle WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let scheduled_trip = match (row.get::<_, Option<i32>>(6)?, row.get::<_, Option<String>>(7)?) {
                    (Some(level), Some(time)) => Some(ScheduledTrip { level, time: from_rfc3339(&time) }),
                    _ => None,
                };
                let charge_plan: Option<String> = row.get(20)?;
                let provider_data: Option<String> = row.get(24)?;
                Ok(Vehicle {
                    id,
                    account_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                    name: row.get(2)?,
                    minimum_charge: row.get(3)?,
                    maximum_charge: row.get(4)?,
                    anxiety_level: AnxietyLevel::from_i32(row.get(5)?).unwrap_or(AnxietyLevel::Relaxed),
                    scheduled_trip,
                    paused_until: row.get::<_, Option<String>>(8)?.map(|s| from_rfc3339(&s)),
                    location_id: row.get::<_, Option<String>>(9)?.and_then(|s| s.parse().ok()),
                    level: row.get(10)?,
                    odometer: row.get(11)?,
                    outside_deci_temp: row.get(12)?,
                    inside_deci_temp: row.get(13)?,
                    climate_on: row.get(14)?,
                    driving: row.get(15)?,
                    connected: row.get(16)?,
                    connected_id: row.get::<_, Option<String>>(17)?.and_then(|s| s.parse().ok()),
                    charge_id: row.get::<_, Option<String>>(18)?.and_then(|s| s.parse().ok()),
                    trip_id: row.get::<_, Option<String>>(19)?.and_then(|s| s.parse().ok()),
                    charge_plan: charge_plan.and_then(|s| serde_json::from_str(&s).ok()),
                    smart_status: row.get(21)?,
                    status: row.get(22)?,
                    updated: from_rfc3339(&row.get::<_, String>(23)?),
                    provider_data: provider_data.and_then(|s| serde_json::from_str(&s).ok()),
                })
            },
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("vehicle {id}")))
    }

    fn put_vehicle(&self, v: &Vehicle) -> Result<()> {
        crate::retry_transient!(50, || -> Result<()> { self.put_vehicle_once(v) })
    }

    fn list_vehicles_for_account(&self, account_id: AccountId) -> Result<Vec<Vehicle>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM vehicle WHERE account_id = ?1")?;
        let ids: Vec<String> = stmt
            .query_map(params![account_id.to_string()], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        drop(conn);
        ids.into_iter()
            .filter_map(|s| s.parse::<VehicleId>().ok())
            .map(|id| self.get_vehicle(id))
            .collect()
    }

    fn list_account_ids(&self) -> Result<Vec<AccountId>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT account_id FROM vehicle")?;
        let ids: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    fn list_vehicle_ids_at_price_code(&self, price_code: &PriceCode) -> Result<Vec<VehicleId>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT v.id FROM vehicle v JOIN location l ON v.location_id = l.id WHERE l.price_code = ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![price_code], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    fn get_location(&self, id: LocationId) -> Result<Location> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT id, account_id, name, lat_micro, lon_micro, geo_fence_radius_m, price_code FROM location WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(Location {
                    id,
                    account_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                    name: row.get(2)?,
                    geo: GeoPoint { lat_micro: row.get(3)?, lon_micro: row.get(4)? },
                    geo_fence_radius_m: row.get(5)?,
                    price_code: row.get(6)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("location {id}")))
    }

    fn put_location(&self, l: &Location) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO location (id, account_id, name, lat_micro, lon_micro, geo_fence_radius_m, price_code)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(id) DO UPDATE SET account_id=?2, name=?3, lat_micro=?4, lon_micro=?5, geo_fence_radius_m=?6, price_code=?7",
            params![
                l.id.to_string(),
                l.account_id.to_string(),
                l.name,
                l.geo.lat_micro,
                l.geo.lon_micro,
                l.geo_fence_radius_m,
                l.price_code,
            ],
        )?;
        Ok(())
    }

    fn find_location_at(&self, account_id: AccountId, point: GeoPoint) -> Result<Option<Location>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, lat_micro, lon_micro, geo_fence_radius_m, price_code
             FROM location WHERE account_id = ?1",
        )?;
        let locations: Vec<Location> = stmt
            .query_map(params![account_id.to_string()], |row| {
                Ok(Location {
                    id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                    account_id,
                    name: row.get(2)?,
                    geo: GeoPoint { lat_micro: row.get(3)?, lon_micro: row.get(4)? },
                    geo_fence_radius_m: row.get(5)?,
                    price_code: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        Ok(locations
            .into_iter()
            .filter(|l| l.geo.distance_m(&point) <= l.geo_fence_radius_m)
            .min_by(|a, b| a.geo_fence_radius_m.partial_cmp(&b.geo_fence_radius_m).unwrap()))
    }

    fn update_price(&self, price_code: &PriceCode, points: &[PricePoint], is_internal: bool) -> Result<()> {
        if !is_internal {
            return Err(GatewayError::AuthDenied("updatePrice requires the internal service identity".into()));
        }
        crate::retry_transient!(100, || -> Result<()> {
            let conn = self.conn.lock()?;
            let mut stmt = conn.prepare(
                "INSERT INTO price_list (price_code, ts, price_scaled) VALUES (?1,?2,?3)
                 ON CONFLICT(price_code, ts) DO UPDATE SET price_scaled=?3",
            )?;
            for p in points {
                stmt.execute(params![price_code, to_rfc3339(p.ts), p.price_scaled])?;
            }
            Ok(())
        })
    }

    fn get_prices(&self, price_code: &PriceCode, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PricePoint>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT ts, price_scaled FROM price_list WHERE price_code = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(params![price_code, to_rfc3339(from), to_rfc3339(to)], |row| {
                Ok(PricePoint { ts: from_rfc3339(&row.get::<_, String>(0)?), price_scaled: row.get(1)? })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    fn open_connection(&self, c: &Connection) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO connected (connected_id, vehicle_id, location_id, charger_type, start_ts, end_ts,
                start_level, end_level, energy_used, cost, saved, connected, charged_seconds_accum)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                c.connected_id.to_string(),
                c.vehicle_id.to_string(),
                c.location_id.to_string(),
                Self::charger_type_str(c.charger_type),
                to_rfc3339(c.start_ts),
                to_rfc3339(c.end_ts),
                c.start_level,
                c.end_level,
                c.energy_used,
                c.cost,
                c.saved,
                c.connected,
                c.charged_seconds_accum,
            ],
        )?;
        Ok(())
    }

    fn update_connection(&self, c: &Connection) -> Result<()> {
        let conn = self.conn.lock()?;
        let n = conn.execute(
            "UPDATE connected SET location_id=?2, charger_type=?3, end_ts=?4, end_level=?5,
                energy_used=?6, cost=?7, saved=?8, connected=?9, charged_seconds_accum=?10
             WHERE connected_id = ?1",
            params![
                c.connected_id.to_string(),
                c.location_id.to_string(),
                Self::charger_type_str(c.charger_type),
                to_rfc3339(c.end_ts),
                c.end_level,
                c.energy_used,
                c.cost,
                c.saved,
                c.connected,
                c.charged_seconds_accum,
            ],
        )?;
        if n == 0 {
            return Err(GatewayError::NotFound(format!("connection {}", c.connected_id)));
        }
        Ok(())
    }

    fn get_connection(&self, id: ConnectionId) -> Result<Connection> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT connected_id, vehicle_id, location_id, charger_type, start_ts, end_ts, start_level,
                    end_level, energy_used, cost, saved, connected, charged_seconds_accum
             FROM connected WHERE connected_id = ?1",
            params![id.to_string()],
            |row| {
                Ok(Connection {
                    connected_id: id,
                    vehicle_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                    location_id: row.get::<_, String>(2)?.parse().unwrap_or_default(),
                    charger_type: Self::charger_type_from_str(&row.get::<_, String>(3)?),
                    start_ts: from_rfc3339(&row.get::<_, String>(4)?),
                    end_ts: from_rfc3339(&row.get::<_, String>(5)?),
                    start_level: row.get(6)?,
                    end_level: row.get(7)?,
                    energy_used: row.get(8)?,
                    cost: row.get(9)?,
                    saved: row.get(10)?,
                    connected: row.get(11)?,
                    charged_seconds_accum: row.get(12)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("connection {id}")))
    }

    fn list_closed_connections_for_vehicle(&self, vehicle_id: VehicleId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Connection>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT connected_id, location_id, charger_type, start_ts, end_ts, start_level, end_level,
                    energy_used, cost, saved, connected, charged_seconds_accum
             FROM connected WHERE vehicle_id = ?1 AND connected = 0 AND start_ts >= ?2 AND start_ts < ?3
             ORDER BY start_ts ASC",
        )?;
        let rows = stmt
            .query_map(params![vehicle_id.to_string(), to_rfc3339(from), to_rfc3339(to)], |row| {
                Ok(Connection {
                    connected_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                    vehicle_id,
                    location_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                    charger_type: Self::charger_type_from_str(&row.get::<_, String>(2)?),
                    start_ts: from_rfc3339(&row.get::<_, String>(3)?),
                    end_ts: from_rfc3339(&row.get::<_, String>(4)?),
                    start_level: row.get(5)?,
                    end_level: row.get(6)?,
                    energy_used: row.get(7)?,
                    cost: row.get(8)?,
                    saved: row.get(9)?,
                    connected: row.get(10)?,
                    charged_seconds_accum: row.get(11)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    fn open_charge(&self, c: &Charge) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO charge (charge_id, connected_id, vehicle_id, location_id, charger_type, start_ts,
                end_ts, start_level, end_level, start_added, end_added, target_level, estimate_min, energy_used)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                c.charge_id.to_string(),
                c.connected_id.to_string(),
                c.vehicle_id.to_string(),
                c.location_id.to_string(),
                Self::charger_type_str(c.charger_type),
                to_rfc3339(c.start_ts),
                to_rfc3339(c.end_ts),
                c.start_level,
                c.end_level,
                c.start_added,
                c.end_added,
                c.target_level,
                c.estimate_min,
                c.energy_used,
            ],
        )?;
        Ok(())
    }

    fn update_charge(&self, c: &Charge) -> Result<()> {
        let conn = self.conn.lock()?;
        let n = conn.execute(
            "UPDATE charge SET end_ts=?2, end_level=?3, end_added=?4, target_level=?5, estimate_min=?6, energy_used=?7
             WHERE charge_id = ?1",
            params![
                c.charge_id.to_string(),
                to_rfc3339(c.end_ts),
                c.end_level,
                c.end_added,
                c.target_level,
                c.estimate_min,
                c.energy_used,
            ],
        )?;
        if n == 0 {
            return Err(GatewayError::NotFound(format!("charge {}", c.charge_id)));
        }
        Ok(())
    }

    fn get_charge(&self, id: ChargeId) -> Result<Charge> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT charge_id, connected_id, vehicle_id, location_id, charger_type, start_ts, end_ts,
                    start_level, end_level, start_added, end_added, target_level, estimate_min, energy_used
             FROM charge WHERE charge_id = ?1",
            params![id.to_string()],
            |row| Self::row_to_charge(row, id),
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("charge {id}")))
    }

    fn list_charges_for_connection(&self, connected_id: ConnectionId) -> Result<Vec<Charge>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT charge_id, connected_id, vehicle_id, location_id, charger_type, start_ts, end_ts,
                    start_level, end_level, start_added, end_added, target_level, estimate_min, energy_used
             FROM charge WHERE connected_id = ?1 ORDER BY start_ts ASC",
        )?;
        let rows = stmt
            .query_map(params![connected_id.to_string()], |row| {
                let id: String = row.get(0)?;
                Self::row_to_charge(row, id.parse().unwrap_or_default())
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    fn put_charge_current(&self, cur: &ChargeCurrent) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO charge_current (charge_id, start_ts, start_level, start_added, powers, outside_deci_temps, discarded_first_gain)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(charge_id) DO UPDATE SET start_ts=?2, start_level=?3, start_added=?4, powers=?5, outside_deci_temps=?6, discarded_first_gain=?7",
            params![
                cur.charge_id.to_string(),
                to_rfc3339(cur.start_ts),
                cur.start_level,
                cur.start_added,
                serde_json::to_string(&cur.powers).unwrap_or_default(),
                serde_json::to_string(&cur.outside_deci_temps).unwrap_or_default(),
                cur.discarded_first_gain,
            ],
        )?;
        Ok(())
    }

    fn get_charge_current(&self, charge_id: ChargeId) -> Result<Option<ChargeCurrent>> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT start_ts, start_level, start_added, powers, outside_deci_temps, discarded_first_gain FROM charge_current WHERE charge_id = ?1",
            params![charge_id.to_string()],
            |row| {
                let powers: String = row.get(3)?;
                let temps: String = row.get(4)?;
                Ok(ChargeCurrent {
                    charge_id,
                    start_ts: from_rfc3339(&row.get::<_, String>(0)?),
                    start_level: row.get(1)?,
                    start_added: row.get(2)?,
                    powers: serde_json::from_str(&powers).unwrap_or_default(),
                    outside_deci_temps: serde_json::from_str(&temps).unwrap_or_default(),
                    discarded_first_gain: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(GatewayError::from)
    }

    fn clear_charge_current(&self, charge_id: ChargeId) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM charge_current WHERE charge_id = ?1", params![charge_id.to_string()])?;
        Ok(())
    }

    fn get_charge_curve(&self, vehicle_id: VehicleId, location_id: LocationId) -> Result<Vec<ChargeCurve>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT level, duration_s, avg_deci_temp, energy_used, energy_added
             FROM charge_curve WHERE vehicle_id = ?1 AND location_id = ?2 ORDER BY level ASC",
        )?;
        let rows = stmt
            .query_map(params![vehicle_id.to_string(), location_id.to_string()], |row| {
                Ok(ChargeCurve {
                    vehicle_id,
                    location_id,
                    level: row.get(0)?,
                    duration_s: row.get(1)?,
                    avg_deci_temp: row.get(2)?,
                    energy_used: row.get(3)?,
                    energy_added: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    fn put_charge_curve_point(&self, p: &ChargeCurve) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO charge_curve (vehicle_id, location_id, level, duration_s, avg_deci_temp, energy_used, energy_added)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(vehicle_id, location_id, level) DO UPDATE SET
                duration_s=?4, avg_deci_temp=?5, energy_used=?6, energy_added=?7",
            params![
                p.vehicle_id.to_string(),
                p.location_id.to_string(),
                p.level,
                p.duration_s,
                p.avg_deci_temp,
                p.energy_used,
                p.energy_added,
            ],
        )?;
        Ok(())
    }

    fn open_trip(&self, t: &Trip) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO trip (trip_id, vehicle_id, start_ts, end_ts, start_level, end_level,
                start_location_id, end_location_id, start_odometer, start_outside_deci_temp, distance_m)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                t.trip_id.to_string(),
                t.vehicle_id.to_string(),
                to_rfc3339(t.start_ts),
                t.end_ts.map(to_rfc3339),
                t.start_level,
                t.end_level,
                t.start_location_id.map(|x| x.to_string()),
                t.end_location_id.map(|x| x.to_string()),
                t.start_odometer,
                t.start_outside_deci_temp,
                t.distance_m,
            ],
        )?;
        Ok(())
    }

    fn update_trip(&self, t: &Trip) -> Result<()> {
        let conn = self.conn.lock()?;
        let n = conn.execute(
            "UPDATE trip SET end_ts=?2, end_level=?3, end_location_id=?4, distance_m=?5 WHERE trip_id = ?1",
            params![
                t.trip_id.to_string(),
                t.end_ts.map(to_rfc3339),
                t.end_level,
                t.end_location_id.map(|x| x.to_string()),
                t.distance_m,
            ],
        )?;
        if n == 0 {
            return Err(GatewayError::NotFound(format!("trip {}", t.trip_id)));
        }
        Ok(())
    }

    fn delete_trip(&self, trip_id: TripId) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM trip WHERE trip_id = ?1", params![trip_id.to_string()])?;
        Ok(())
    }

    fn get_open_trip(&self, vehicle_id: VehicleId) -> Result<Option<Trip>> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT trip_id, start_ts, end_ts, start_level, end_level, start_location_id, end_location_id,
                    start_odometer, start_outside_deci_temp, distance_m
             FROM trip WHERE vehicle_id = ?1 AND end_ts IS NULL ORDER BY start_ts DESC LIMIT 1",
            params![vehicle_id.to_string()],
            |row| {
                Ok(Trip {
                    trip_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                    vehicle_id,
                    start_ts: from_rfc3339(&row.get::<_, String>(1)?),
                    end_ts: row.get::<_, Option<String>>(2)?.map(|s| from_rfc3339(&s)),
                    start_level: row.get(3)?,
                    end_level: row.get(4)?,
                    start_location_id: row.get::<_, Option<String>>(5)?.and_then(|s| s.parse().ok()),
                    end_location_id: row.get::<_, Option<String>>(6)?.and_then(|s| s.parse().ok()),
                    start_odometer: row.get(7)?,
                    start_outside_deci_temp: row.get(8)?,
                    distance_m: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(GatewayError::from)
    }

    fn upsert_event_map_row(&self, row: &EventMapRow) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO event_map (vehicle_id, hour, minimum_level, maximum_level, driven_seconds, driven_meters, charged_seconds, charge_energy)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(vehicle_id, hour) DO UPDATE SET
                minimum_level = MIN(minimum_level, ?3),
                maximum_level = MAX(maximum_level, ?4),
                driven_seconds = driven_seconds + ?5,
                driven_meters = driven_meters + ?6,
                charged_seconds = charged_seconds + ?7,
                charge_energy = charge_energy + ?8",
            params![
                row.vehicle_id.to_string(),
                to_rfc3339(row.hour),
                row.minimum_level,
                row.maximum_level,
                row.driven_seconds,
                row.driven_meters,
                row.charged_seconds,
                row.charge_energy,
            ],
        )?;
        Ok(())
    }

    fn get_event_map(&self, vehicle_id: VehicleId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<EventMapRow>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT hour, minimum_level, maximum_level, driven_seconds, driven_meters, charged_seconds, charge_energy
             FROM event_map WHERE vehicle_id = ?1 AND hour >= ?2 AND hour < ?3 ORDER BY hour ASC",
        )?;
        let rows = stmt
            .query_map(params![vehicle_id.to_string(), to_rfc3339(from), to_rfc3339(to)], |row| {
                Ok(EventMapRow {
                    vehicle_id,
                    hour: from_rfc3339(&row.get::<_, String>(0)?),
                    minimum_level: row.get(1)?,
                    maximum_level: row.get(2)?,
                    driven_seconds: row.get(3)?,
                    driven_meters: row.get(4)?,
                    charged_seconds: row.get(5)?,
                    charge_energy: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    fn get_current_stats(&self, vehicle_id: VehicleId) -> Result<Option<CurrentStats>> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT stats_id, location_id, price_list_ts, level_charge_time_s, weekly_avg7_price, weekly_avg21_price, threshold
             FROM current_stats WHERE vehicle_id = ?1 ORDER BY price_list_ts DESC LIMIT 1",
            params![vehicle_id.to_string()],
            |row| {
                Ok(CurrentStats {
                    stats_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                    vehicle_id,
                    location_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                    price_list_ts: from_rfc3339(&row.get::<_, String>(2)?),
                    level_charge_time_s: row.get(3)?,
                    weekly_avg7_price: row.get(4)?,
                    weekly_avg21_price: row.get(5)?,
                    threshold: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(GatewayError::from)
    }

    fn put_current_stats(&self, s: &CurrentStats) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO current_stats (stats_id, vehicle_id, location_id, price_list_ts, level_charge_time_s, weekly_avg7_price, weekly_avg21_price, threshold)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(stats_id) DO UPDATE SET
                price_list_ts=?4, level_charge_time_s=?5, weekly_avg7_price=?6, weekly_avg21_price=?7, threshold=?8",
            params![
                s.stats_id.to_string(),
                s.vehicle_id.to_string(),
                s.location_id.to_string(),
                to_rfc3339(s.price_list_ts),
                s.level_charge_time_s,
                s.weekly_avg7_price,
                s.weekly_avg21_price,
                s.threshold,
            ],
        )?;
        Ok(())
    }
}

impl SqliteGateway {
    fn row_to_charge(row: &rusqlite::Row, id: ChargeId) -> rusqlite::Result<Charge> {
        Ok(Charge {
            charge_id: id,
            connected_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
            vehicle_id: row.get::<_, String>(2)?.parse().unwrap_or_default(),
            location_id: row.get::<_, String>(3)?.parse().unwrap_or_default(),
            charger_type: Self::charger_type_from_str(&row.get::<_, String>(4)?),
            start_ts: from_rfc3339(&row.get::<_, String>(5)?),
            end_ts: from_rfc3339(&row.get::<_, String>(6)?),
            start_level: row.get(7)?,
            end_level: row.get(8)?,
            start_added: row.get(9)?,
            end_added: row.get(10)?,
            target_level: row.get(11)?,
            estimate_min: row.get(12)?,
            energy_used: row.get(13)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_vehicle(id: VehicleId, account_id: AccountId) -> Vehicle {
        Vehicle {
            id,
            account_id,
            name: "test".into(),
            minimum_charge: 50,
            maximum_charge: 90,
            anxiety_level: AnxietyLevel::Relaxed,
            scheduled_trip: None,
            paused_until: None,
            location_id: None,
            level: 60,
            odometer: 1000.0,
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
            updated: Utc::now_or_fixed(),
            provider_data: None,
        }
    }

    trait FixedNow {
        fn now_or_fixed() -> DateTime<Utc>;
    }
    impl FixedNow for Utc {
        fn now_or_fixed() -> DateTime<Utc> {
            Utc.timestamp_opt(1_700_000_000, 0).unwrap()
        }
    }

    #[test]
    fn put_then_get_vehicle_round_trips() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let v = new_vehicle(VehicleId::new_v4(), AccountId::new_v4());
        gw.put_vehicle(&v).unwrap();
        let back = gw.get_vehicle(v.id).unwrap();
        assert_eq!(back.level, v.level);
        assert_eq!(back.minimum_charge, v.minimum_charge);
    }

    #[test]
    fn get_missing_vehicle_is_not_found() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let err = gw.get_vehicle(VehicleId::new_v4()).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn update_price_without_internal_identity_is_denied() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let err = gw.update_price(&"SE4".to_string(), &[], false).unwrap_err();
        assert!(matches!(err, GatewayError::AuthDenied(_)));
    }

    #[test]
    fn event_map_upsert_combines_min_max_sum() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let vehicle_id = VehicleId::new_v4();
        let hour = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        gw.upsert_event_map_row(&EventMapRow {
            vehicle_id,
            hour,
            minimum_level: 40,
            maximum_level: 60,
            driven_seconds: 100,
            driven_meters: 500.0,
            charged_seconds: 0,
            charge_energy: 0.0,
        })
        .unwrap();
        gw.upsert_event_map_row(&EventMapRow {
            vehicle_id,
            hour,
            minimum_level: 35,
            maximum_level: 65,
            driven_seconds: 50,
            driven_meters: 250.0,
            charged_seconds: 0,
            charge_energy: 0.0,
        })
        .unwrap();
        let rows = gw.get_event_map(vehicle_id, hour - Duration::hours(1), hour + Duration::hours(1)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].minimum_level, 35);
        assert_eq!(rows[0].maximum_level, 65);
        assert_eq!(rows[0].driven_seconds, 150);
    }

    #[test]
    fn find_location_at_prefers_smallest_radius() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let account_id = AccountId::new_v4();
        let point = GeoPoint::from_degrees(59.0, 18.0);
        let small = Location {
            id: LocationId::new_v4(),
            account_id,
            name: "home".into(),
            geo: point,
            geo_fence_radius_m: 50.0,
            price_code: "SE3".into(),
        };
        let big = Location {
            id: LocationId::new_v4(),
            account_id,
            name: "work".into(),
            geo: point,
            geo_fence_radius_m: 500.0,
            price_code: "SE3".into(),
        };
        gw.put_location(&small).unwrap();
        gw.put_location(&big).unwrap();
        let found = gw.find_location_at(account_id, point).unwrap().unwrap();
        assert_eq!(found.id, small.id);
    }
}
