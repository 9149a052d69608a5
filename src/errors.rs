use std::fmt;
use std::fmt::Formatter;
use std::sync::PoisonError;
use chrono::format::ParseError;
use crate::manager_mail::errors::MailError;

/// Error depicting errors that occur during initialization of the engine
///
pub struct EngineInitError(pub String);

impl fmt::Display for EngineInitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "EngineInitError: {}", self.0)
    }
}
impl From<ConfigError> for EngineInitError {
    fn from(e: ConfigError) -> Self {
        EngineInitError(e.to_string())
    }
}
impl From<GatewayError> for EngineInitError {
    fn from(e: GatewayError) -> Self {
        EngineInitError(e.to_string())
    }
}
impl From<MailError> for EngineInitError {
    fn from(e: MailError) -> Self { EngineInitError(e.to_string()) }
}
impl From<&str> for EngineInitError {
    fn from(e: &str) -> Self { EngineInitError(e.to_string()) }
}
impl fmt::Debug for EngineInitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "EngineInitError({})", self.0)
    }
}
impl std::error::Error for EngineInitError {}

/// Error taxonomy returned by the persistence gateway and propagated through
/// the ingest, statistics, planner and orchestrator layers. The kind decides
/// caller-visible behaviour: `Transient` is retried with exponential backoff
/// inside the gateway itself (see `crate::macros::retry`), the rest surface.
#[derive(Debug, Clone)]
pub enum GatewayError {
    NotFound(String),
    Conflict(String),
    InvalidInput(String),
    Transient(String),
    AuthDenied(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            GatewayError::NotFound(m) => write!(f, "NotFound: {m}"),
            GatewayError::Conflict(m) => write!(f, "Conflict: {m}"),
            GatewayError::InvalidInput(m) => write!(f, "InvalidInput: {m}"),
            GatewayError::Transient(m) => write!(f, "Transient: {m}"),
            GatewayError::AuthDenied(m) => write!(f, "AuthDenied: {m}"),
        }
    }
}
impl std::error::Error for GatewayError {}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => GatewayError::NotFound(e.to_string()),
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                GatewayError::Conflict(e.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                GatewayError::Transient(e.to_string())
            }
            _ => GatewayError::Transient(e.to_string()),
        }
    }
}
impl From<PoisonError<std::sync::MutexGuard<'_, rusqlite::Connection>>> for GatewayError {
    fn from(e: PoisonError<std::sync::MutexGuard<'_, rusqlite::Connection>>) -> Self {
        GatewayError::Transient(e.to_string())
    }
}

/// Error depicting errors that occur while ingesting a telemetry sample
///
#[derive(Debug)]
pub struct IngestError(pub String);

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "IngestError: {}", self.0)
    }
}
impl From<GatewayError> for IngestError {
    fn from(e: GatewayError) -> Self {
        IngestError(e.to_string())
    }
}
impl From<&str> for IngestError {
    fn from(e: &str) -> Self {
        IngestError(e.to_string())
    }
}

/// Error depicting errors that occur while building or reconciling a charge plan
///
#[derive(Debug)]
pub struct PlanError(pub String);

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "PlanError: {}", self.0)
    }
}
impl From<&str> for PlanError {
    fn from(e: &str) -> Self {
        PlanError(e.to_string())
    }
}
impl From<GatewayError> for PlanError {
    fn from(e: GatewayError) -> Self {
        PlanError(e.to_string())
    }
}
impl From<IngestError> for PlanError {
    fn from(e: IngestError) -> Self {
        PlanError(e.to_string())
    }
}

/// Error depicting errors that occur while running a replan pass across vehicles
///
pub struct OrchestratorError {
    msg: String,
    vehicle: Option<String>,
}

impl OrchestratorError {
    pub fn new(msg: String, vehicle: &str) -> OrchestratorError {
        OrchestratorError {
            msg,
            vehicle: Some(vehicle.to_string()),
        }
    }
}
impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let report_time = format!("{}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let caption = format!("{} OrchestratorError ", report_time);
        write!(f, "{:=<80}\n", caption)?;
        write!(f, "{}\n", self.msg)?;
        if let Some(vehicle) = &self.vehicle {
            write!(f, "vehicle: {vehicle}")?;
        }
        Ok(())
    }
}
impl From<PlanError> for OrchestratorError {
    fn from(e: PlanError) -> Self {
        OrchestratorError { msg: e.to_string(), vehicle: None }
    }
}
impl From<IngestError> for OrchestratorError {
    fn from(e: IngestError) -> Self {
        OrchestratorError { msg: e.to_string(), vehicle: None }
    }
}
impl From<GatewayError> for OrchestratorError {
    fn from(e: GatewayError) -> Self {
        OrchestratorError { msg: e.to_string(), vehicle: None }
    }
}
impl From<&str> for OrchestratorError {
    fn from(e: &str) -> Self { OrchestratorError { msg: e.to_string(), vehicle: None } }
}
impl fmt::Debug for OrchestratorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "OrchestratorError({}, vehicle: {:?})", self.msg, self.vehicle)
    }
}
impl std::error::Error for OrchestratorError {}

/// Error depicting errors that occur while doing config operations
///
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ConfigError: {}", self.0)
    }
}
impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError(e.to_string())
    }
}
impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self { ConfigError(e.to_string()) }
}
impl From<&str> for ConfigError {
    fn from(e: &str) -> Self {
        ConfigError(e.to_string())
    }
}
impl From<ParseError> for ConfigError {
    fn from(e: ParseError) -> Self { ConfigError(e.to_string()) }
}
impl From<log4rs::config::runtime::ConfigErrors> for ConfigError {
    fn from(e: log4rs::config::runtime::ConfigErrors) -> Self { ConfigError(e.to_string()) }
}
impl From<log::SetLoggerError> for ConfigError {
    fn from(e: log::SetLoggerError) -> Self { ConfigError(e.to_string()) }
}
impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigError({})", self.0)
    }
}
impl std::error::Error for ConfigError {}
