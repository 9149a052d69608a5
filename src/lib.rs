pub mod config;
pub mod curve;
pub mod errors;
pub mod gateway;
pub mod ingest;
pub mod initialization;
pub mod logging;
#[macro_use]
pub mod macros;
pub mod manager_mail;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod stats;
