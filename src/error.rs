use thiserror::Error;

/// Central error type for blobflow pipelines
#[derive(Error, Debug)]
pub enum PipeError {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error in module '{module}': {message}")]
    Configuration { module: String, message: String },

    #[error("Module '{module}' failed to {stage}: {source}")]
    ModuleSetup {
        module: String,
        stage: &'static str,
        #[source]
        source: Box<PipeError>,
    },

    #[error("Following services are required and missing: {}", .0.join(", "))]
    MissingServices(Vec<String>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ============================================================================
    // Execution Errors
    // ============================================================================
    #[error("Module '{module}' failed in cycle {cycle}: {source}")]
    ModuleExecution {
        module: String,
        cycle: u64,
        #[source]
        source: Box<PipeError>,
    },

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("Module '{module}' failed to finish: {message}")]
    FinishFailed { module: String, message: String },

    #[error("Pipeline has already been drained")]
    AlreadyDrained,

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // ============================================================================
    // Blob Errors
    // ============================================================================
    #[error("No key named '{key}' found in blob (available keys: {available})")]
    MissingKey { key: String, available: String },

    #[error("Blob key '{key}' is not a {expected}")]
    WrongType { key: String, expected: &'static str },

    // ============================================================================
    // Service Errors
    // ============================================================================
    #[error("Service not registered: {0}")]
    ServiceNotFound(String),

    #[error("Service '{0}' has a different type than requested")]
    ServiceTypeMismatch(String),

    // ============================================================================
    // Provenance Errors
    // ============================================================================
    #[error("Provenance error: {0}")]
    Provenance(String),

    // ============================================================================
    // Generic/System Errors
    // ============================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Mutex lock error")]
    LockError,

    #[error("{0}")]
    GenericError(String),
}

impl PipeError {
    /// Build a configuration error for the given module
    pub fn configuration(module: impl Into<String>, message: impl Into<String>) -> Self {
        PipeError::Configuration {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Whether this error was raised while configuring modules
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipeError::Configuration { .. }
                | PipeError::ModuleSetup { .. }
                | PipeError::MissingServices(_)
                | PipeError::ConfigError(_)
        )
    }

    /// Wrap an error raised while setting a module up, keeping it as source
    pub fn setup(module: impl Into<String>, stage: &'static str, source: PipeError) -> Self {
        PipeError::ModuleSetup {
            module: module.into(),
            stage,
            source: Box::new(source),
        }
    }

    /// Whether this error was raised by a module's process step
    pub fn is_module_execution(&self) -> bool {
        matches!(self, PipeError::ModuleExecution { .. })
    }
}

// Implement conversion from PoisonError for locks
impl<T> From<std::sync::PoisonError<T>> for PipeError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        PipeError::LockError
    }
}

// Automatic conversion from String, handy inside module implementations
impl From<String> for PipeError {
    fn from(err: String) -> Self {
        PipeError::GenericError(err)
    }
}

impl From<&str> for PipeError {
    fn from(err: &str) -> Self {
        PipeError::GenericError(err.to_string())
    }
}

// Helper type alias for Results
pub type PipeResult<T> = Result<T, PipeError>;
