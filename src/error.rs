//! Error types for fishpool.

use std::path::PathBuf;

/// Top-level error type for the dispatch engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable(s): {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while enumerating jobs. Always fatal: nothing is dispatched.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid input pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("No catalog credentials available for user {user}")]
    MissingCredentials { user: String },

    #[error("Catalog discovery failed: {0}")]
    Catalog(#[from] CatalogError),
}

/// Remote catalog errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Catalog rejected credentials for user {user}")]
    AuthRejected { user: String },

    #[error("{kind} {id} not found in catalog")]
    NotFound { kind: String, id: i64 },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Unexpected catalog response: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is sealed, job {job_id} cannot be added after workers launched")]
    Sealed { job_id: u64 },

    #[error("Queue was already sealed")]
    AlreadySealed,
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    #[error("Failed to launch worker {worker_id}: {reason}")]
    LaunchFailed { worker_id: usize, reason: String },

    #[error("Worker {worker_id} protocol violation: {reason}")]
    Protocol { worker_id: usize, reason: String },

    #[error("Worker {worker_id} failed: {reason}")]
    WorkerFailed { worker_id: usize, reason: String },

    #[error("Result channel closed")]
    ResultsClosed,

    #[error("Invalid supervisor transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the processing collaborator for a single job.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("No analysis command configured")]
    NoCommand,

    #[error("Failed to spawn analysis command {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Analysis command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Remote job for image {image_id} has no catalog session")]
    MissingSession { image_id: i64 },

    #[error("No catalog credentials available for remote job")]
    MissingCredentials,

    #[error("Invalid analysis parameters: {0}")]
    InvalidParameters(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
