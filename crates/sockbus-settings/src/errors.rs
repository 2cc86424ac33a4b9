//! Settings loading errors.

/// Failure to read or parse a settings source.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// The settings JSON is malformed or has wrongly typed fields.
    #[error("invalid settings json: {0}")]
    Json(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SettingsError>;
