use thiserror::Error;

#[derive(Error, Debug)]
pub enum TermKeepError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Corrupt document at '{key}': {detail}")]
    Parse { key: String, detail: String },

    #[error("Write failed for '{key}': {detail}")]
    Write { key: String, detail: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration run already in progress")]
    AlreadyRunning,

    #[error("Migration not found: {0}")]
    MigrationNotFound(String),

    #[error("No rollback registered for migration {0}")]
    RollbackUnavailable(String),

    #[error("Preserved version not found: {0}")]
    VersionNotFound(String),

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("Terminal error: {0}")]
    Terminal(String),
}
