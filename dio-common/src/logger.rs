use dio_error::{DioError, DioResult};
use std::{
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{subscriber::set_global_default, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn,
    fmt::{self},
    layer::SubscriberExt,
    Layer, Registry,
};

pub struct Logger {
    level: Arc<Mutex<Level>>,
    dir: PathBuf,
    file_prefix: String,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(level: Option<Level>) -> Self {
        Logger {
            level: Arc::new(Mutex::new(level.unwrap_or(Level::INFO))),
            dir: PathBuf::from("logs"),
            file_prefix: "dio.log".to_string(),
            _file_guard: None,
        }
    }

    /// Parse a textual level (`trace`, `debug`, `info`, `warn`, `error`).
    pub fn parse_level(level: &str) -> DioResult<Level> {
        Level::from_str(level.trim())
            .map_err(|_| DioError::ConfigurationError(format!("Invalid log level '{level}'")))
    }

    /// Set the directory and file name prefix of the rolling log file.
    pub fn with_output(mut self, dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        self.dir = dir.into();
        self.file_prefix = file_prefix.into();
        self
    }

    #[inline]
    pub fn set_level(&self, new_level: Level) {
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        *level = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the global subscriber: console output plus a daily rolling
    /// file, both filtered by the adjustable level.
    pub fn initialize(&mut self) -> DioResult<()> {
        let file_appender = rolling::daily(&self.dir, &self.file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        self._file_guard = Some(guard);

        let console_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| {
                metadata.level() <= &*level.lock().unwrap_or_else(PoisonError::into_inner)
            })
        };

        let file_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| {
                metadata.level() <= &*level.lock().unwrap_or_else(PoisonError::into_inner)
            })
        };

        let console_layer = {
            #[cfg(debug_assertions)]
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(true)
                .with_line_number(true);

            #[cfg(not(debug_assertions))]
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(false)
                .with_line_number(false);

            layer.with_filter(console_filter)
        };

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_filter(file_filter);

        let subscriber = Registry::default().with(console_layer).with(file_layer);

        set_global_default(subscriber).map_err(|_| DioError::from("Failed to set logger"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_known_names() {
        assert_eq!(Logger::parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(Logger::parse_level(" WARN ").unwrap(), Level::WARN);
        assert!(Logger::parse_level("chatty").is_err());
    }

    #[test]
    fn level_is_adjustable_at_runtime() {
        let logger = Logger::new(None);
        assert_eq!(logger.get_level(), Level::INFO);
        logger.set_level(Level::TRACE);
        assert_eq!(logger.get_level(), Level::TRACE);
    }

    #[test]
    fn output_location_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(Some(Level::DEBUG)).with_output(dir.path(), "panel.log");
        assert_eq!(logger.dir, dir.path());
        assert_eq!(logger.file_prefix, "panel.log");
    }
}
