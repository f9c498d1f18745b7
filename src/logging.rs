use std::io;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::environment::get_env_var_or;
use crate::retag::TARGET_RETAG;
use crate::tagger::TARGET_TAGGER;
use crate::{TARGET_DB, TARGET_WEB_REQUEST};

const DEFAULT_LOG_DIR: &str = "logs";

/// Console directives: the service's own targets at `level`, per-request and
/// per-query chatter at warn, sqlx silenced.
fn console_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!(
        "{level},{TARGET_TAGGER}={level},{TARGET_RETAG}={level},{TARGET_WEB_REQUEST}=warn,{TARGET_DB}=warn,sqlx=off"
    )
}

/// File directives: tagging and sweeps at debug, everything else at info.
fn file_directives() -> String {
    format!("info,{TARGET_TAGGER}=debug,{TARGET_RETAG}=debug,{TARGET_WEB_REQUEST}=info,sqlx=info")
}

/// Logging for the tag service, written to `<LOG_DIR>/tagservice.log`.
pub fn configure_logging() {
    configure_logging_for("tagservice");
}

/// Installs a stdout layer at `LOG_LEVEL` (default info) and a daily rolling
/// file `<LOG_DIR>/<app>.log` (default dir `logs`).
pub fn configure_logging_for(app: &str) {
    let level = get_env_var_or("LOG_LEVEL", Level::INFO);
    let log_dir = get_env_var_or("LOG_DIR", DEFAULT_LOG_DIR.to_string());

    let console = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(EnvFilter::new(console_directives(level)));

    let file = fmt::layer()
        .with_ansi(false)
        .with_writer(rolling::daily(log_dir, format!("{}.log", app)))
        .with_filter(EnvFilter::new(file_directives()));

    tracing_subscriber::Registry::default()
        .with(console)
        .with(file)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_directives_follow_level() {
        assert_eq!(
            console_directives(Level::DEBUG),
            "debug,tagger=debug,retag=debug,web_request=warn,db_query=warn,sqlx=off"
        );
        assert!(console_directives(Level::INFO).starts_with("info,tagger=info,"));
    }

    #[test]
    fn test_directives_parse() {
        for level in [Level::TRACE, Level::INFO, Level::ERROR] {
            assert!(EnvFilter::try_new(console_directives(level)).is_ok());
        }
        assert!(EnvFilter::try_new(file_directives()).is_ok());
    }
}
