//! Configuration: a TOML file (general/mail parameters) overlaid with a
//! handful of deployment environment variables. `DATABASE_URL` is the only
//! setting the core cannot run without; the rest exist so a co-deployed
//! façade process sharing this config file has somewhere to read them
//! from, and are never branched on by the core.

use std::env;
use std::fs;

use log::LevelFilter;
use serde::Deserialize;

use crate::errors::ConfigError;

#[derive(Deserialize)]
pub struct MailParameters {
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_endpoint: String,
    pub from: String,
    pub to: String,
}

#[derive(Deserialize)]
pub struct General {
    pub log_path: String,
    pub log_level: LevelFilter,
    pub log_to_stdout: bool,
}

pub struct DatabaseConfig {
    /// Filesystem path to the sqlite file (or `:memory:`) for this crate's
    /// gateway implementation; a networked backend would parse this as a
    /// connection string instead.
    pub url: String,
    pub ssl: bool,
}

pub struct ServerConfig {
    pub public_url: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
}

pub struct SingleUserConfig {
    pub enabled: bool,
    pub password: Option<String>,
}

#[derive(Deserialize)]
struct FileConfig {
    general: General,
    mail: MailParameters,
}

pub struct Config {
    pub general: General,
    pub mail: MailParameters,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub single_user: SingleUserConfig,
}

/// Loads the TOML config file and overlays it with the deployment
/// environment variables. `DATABASE_URL` missing is fatal; the rest
/// default to absent/disabled.
///
/// # Arguments
///
/// * 'config_path' - path to the configuration file
pub fn load_config(config_path: &str) -> Result<Config, ConfigError> {
    let toml = fs::read_to_string(config_path)?;
    let file: FileConfig = toml::from_str(&toml)?;

    let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::from("DATABASE_URL is required"))?;
    let database_ssl = env::var("DATABASE_SSL").map(|v| v == "true" || v == "1").unwrap_or(false);

    let server = ServerConfig {
        public_url: env::var("PUBLIC_URL").ok(),
        ip: env::var("SERVER_IP").ok(),
        port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()),
    };
    let single_user = SingleUserConfig {
        enabled: env::var("SINGLE_USER").map(|v| v == "true" || v == "1").unwrap_or(false),
        password: env::var("SINGLE_USER_PASSWORD").ok(),
    };

    Ok(Config {
        general: file.general,
        mail: file.mail,
        database: DatabaseConfig { url: database_url, ssl: database_ssl },
        server,
        single_user,
    })
}
