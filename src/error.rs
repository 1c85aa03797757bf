use thiserror::Error;

/// Errors surfaced to callers of the engine API. Probe failures never show up
/// here; they are recorded as failed samples instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("monitoring is already running")]
    AlreadyRunning,

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("host already registered: {0}")]
    DuplicateHost(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start probe runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("aggregator loop is no longer running")]
    Disconnected,
}
