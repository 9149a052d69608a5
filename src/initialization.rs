use std::env;
use std::sync::Arc;

use log::info;

use crate::config::{load_config, Config};
use crate::errors::EngineInitError;
use crate::gateway::sqlite::SqliteGateway;
use crate::gateway::Gateway;
use crate::logging::setup_logger;
use crate::manager_mail::Mail;

pub struct Mgr {
    pub gateway: Arc<dyn Gateway>,
    pub mail: Mail,
}

/// Initializes and returns configuration and a Mgr struct holding the
/// gateway and mail notifier the housekeeping sweep depends on.
///
pub fn init() -> Result<(Config, Mgr), EngineInitError> {
    let args: Vec<String> = env::args().collect();
    let config_path = args
        .iter()
        .find(|p| p.starts_with("--config="))
        .expect("config file argument should be present");
    let config_path = config_path
        .split_once('=')
        .expect("config file argument should be correct")
        .1;

    // Load configuration
    let config = load_config(config_path)?;

    // Setup logging
    setup_logger(&config.general.log_path, config.general.log_level, config.general.log_to_stdout)?;

    // Print version
    info!("starting evcharge_planner version: {}", env!("CARGO_PKG_VERSION"));

    // Instantiate structs
    let gateway: Arc<dyn Gateway> = Arc::new(SqliteGateway::open(&config.database.url)?);
    let mail = Mail::new(&config.mail)?;

    let mgr = Mgr { gateway, mail };

    Ok((config, mgr))
}
