//! Logging setup
//!
//! Terminal sessions log through env_logger. A detached daemon has no
//! terminal, so when a log file is configured everything goes there
//! through fern instead.

use crate::config::Config;

/// Initialize the global logger from the daemon configuration
pub fn init(config: &Config) -> Result<(), LoggingError> {
    match &config.log_file {
        Some(path) => {
            let role = role_tag();
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    out.finish(format_args!(
                        "{} {} {}[{}] {}: {}",
                        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                        record.level(),
                        role,
                        std::process::id(),
                        record.target(),
                        message
                    ))
                })
                .level(config.level_filter())
                .chain(fern::log_file(path)?)
                .apply()?;
        }
        None => init_terminal(&config.log_level),
    }
    Ok(())
}

/// Initialize env_logger with a default filter, honouring RUST_LOG
pub fn init_terminal(default_filter: &str) {
    // A second init (e.g. in tests) is not an error worth failing on
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .try_init();
}

fn role_tag() -> &'static str {
    if std::env::var_os(crate::protocol::CONTROL_SOCKET_ENV).is_some() {
        "worker"
    } else {
        "jobd"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logger already initialized: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}
