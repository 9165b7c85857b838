use thiserror::Error;

/// Main error type for the appwarden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    #[error("Duplicate application name in configuration: {0}")]
    DuplicateApp(String),

    // Application lifecycle errors
    #[error("Application not found: {0}")]
    AppNotFound(String),

    #[error("Application {0} is already running")]
    AlreadyRunning(String),

    #[error("Application {0} is not running")]
    NotRunning(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    // PID registry errors
    #[error("PID registry error: {0}")]
    RegistryError(String),

    #[error("Failed to relocate PID record for {app} into the deaf area: {reason}")]
    RelocationError { app: String, reason: String },

    #[error("Signal error: {0}")]
    SignalError(String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    #[error("Failed to dispatch notification: {0}")]
    NotificationDispatch(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Whether this error belongs to the configuration class, which aborts startup
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            WardenError::ConfigError(_)
                | WardenError::InvalidConfig(_)
                | WardenError::MissingConfigField(_)
                | WardenError::ConfigValidationError(_)
                | WardenError::DuplicateApp(_)
        )
    }
}

/// Result type alias for appwarden operations
pub type Result<T> = std::result::Result<T, WardenError>;
