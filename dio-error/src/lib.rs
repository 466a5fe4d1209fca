use config::ConfigError;
use std::io::Error as IoError;
use thiserror::Error;

pub type DioResult<T, E = DioError> = anyhow::Result<T, E>;

#[derive(Error, Debug)]
pub enum DioError {
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("Device error: {0}")]
    DeviceError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Initialization error: {0}")]
    InitializationError(String),
}

impl From<String> for DioError {
    #[inline]
    fn from(e: String) -> Self {
        DioError::Msg(e)
    }
}

impl From<&str> for DioError {
    #[inline]
    fn from(e: &str) -> Self {
        DioError::Msg(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_conversions_keep_message() {
        let err: DioError = "boom".into();
        assert_eq!(err.to_string(), "boom");

        let err: DioError = String::from("bad roster").into();
        assert!(matches!(err, DioError::Msg(ref m) if m == "bad roster"));
    }

    #[test]
    fn prefixed_variants_render_context() {
        let err = DioError::ConfigurationError("unknown profile 'x'".into());
        assert_eq!(err.to_string(), "Configuration error: unknown profile 'x'");

        let err = DioError::DeviceError("DM1-1 disconnected".into());
        assert_eq!(err.to_string(), "Device error: DM1-1 disconnected");
    }

    #[test]
    fn io_error_converts_with_question_mark() {
        fn open() -> DioResult<()> {
            Err(IoError::new(std::io::ErrorKind::NotFound, "missing"))?;
            Ok(())
        }
        assert!(matches!(open(), Err(DioError::IoError(_))));
    }
}
