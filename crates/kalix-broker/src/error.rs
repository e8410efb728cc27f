use thiserror::Error;

/// Failure of one fetch request. Cloned to every caller sharing the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("session '{0}' has no engine instance to fetch from")]
    InstanceUnavailable(String),
    #[error("invalid series data for '{resource}': {reason}")]
    InvalidFormat { resource: String, reason: String },
    #[error("session '{session_key}' was removed before '{resource}' arrived")]
    SessionRemoved { session_key: String, resource: String },
    #[error("session '{session_key}' ended before '{resource}' arrived")]
    SessionTerminated { session_key: String, resource: String },
    #[error("failed to request '{resource}': {reason}")]
    Dispatch { resource: String, reason: String },
    #[error("engine could not provide '{resource}': {message}")]
    EngineReported { resource: String, message: String },
    #[error("request broker worker has stopped")]
    WorkerStopped,
}
