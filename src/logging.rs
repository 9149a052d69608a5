//! Logging setup: one `log4rs` file appender plus an optional stdout mirror,
//! both on the same timestamped pattern, wired to a single `Root` logger.

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::errors::ConfigError;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l} [{T}] {m}{n}";

/// Initializes the global logger. Fatal on failure: a broken log sink is
/// treated the same as a broken config file, since the operator has no
/// other way to see what the engine is doing.
///
/// # Arguments
///
/// * 'log_path' - path to the log file
/// * 'log_level' - minimum level recorded by the root logger
/// * 'log_to_stdout' - whether to additionally mirror log lines to stdout
pub fn setup_logger(log_path: &str, log_level: LevelFilter, log_to_stdout: bool) -> Result<(), ConfigError> {
    let file = FileAppender::builder().encoder(Box::new(PatternEncoder::new(PATTERN))).build(log_path)?;

    let mut builder = LogConfig::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if log_to_stdout {
        let console = ConsoleAppender::builder().encoder(Box::new(PatternEncoder::new(PATTERN))).build();
        builder = builder.appender(Appender::builder().build("stdout", Box::new(console)));
        root = root.appender("stdout");
    }

    let config = builder.build(root.build(log_level))?;
    log4rs::init_config(config)?;
    Ok(())
}
