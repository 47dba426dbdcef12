use thiserror::Error;

/// Errors that can occur while configuring or operating the report engine.
#[derive(Error, Debug)]
pub enum ReportError {
    /// An invalid or unusable configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error from the standard library.
    #[error("Std Io error: {0}")]
    StdIo(#[from] std::io::Error),

    /// The TOML configuration document could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A worker thread could not be started or torn down cleanly.
    #[error("worker error: {0}")]
    Worker(String),

    /// The downstream result consumer rejected a row.
    #[error("output sink error: {0}")]
    Sink(String),
}

impl From<String> for ReportError {
    fn from(value: String) -> Self {
        Self::Config(value)
    }
}

impl From<&str> for ReportError {
    fn from(value: &str) -> Self {
        Self::Config(value.to_string())
    }
}
