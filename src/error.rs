use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// One step of the image fallback chain failed. Recovered by the
    /// next strategy; only surfaces when callers resolve a single step.
    #[error("Image resolution failed ({strategy}): {source}")]
    Resolution {
        strategy: String,
        #[source]
        source: EngineError,
    },

    #[error("Base container initialization failed: {0}")]
    Initialization(String),

    #[error("Command execution failed: {0}")]
    Execution(String),

    #[error("Configuration read failed: {0}")]
    ConfigurationRead(String),

    #[error("Sandbox {0} has been killed")]
    Killed(String),

    #[error("Registry setup failed: {0}")]
    Registry(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;
