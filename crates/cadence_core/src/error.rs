use miette::Diagnostic;
use thiserror::Error;

/// Errors produced inside the sync/notification core.
///
/// Most of these are absorbed at the edges per the error taxonomy: transport
/// and authorization failures turn into local side effects, decode failures
/// fall back to defaults. They still carry diagnostics so the tracing layer
/// can report what was swallowed.
#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error("Serialization error")]
    #[diagnostic(
        code(cadence_core::serialization_error),
        help("Failed to serialize/deserialize {data_type}")
    )]
    SerializationError {
        data_type: String,
        #[source]
        cause: serde_json::Error,
    },

    #[error("Persistence operation failed")]
    #[diagnostic(
        code(cadence_core::persistence_failed),
        help("Check that the key-value store backing replica data is reachable")
    )]
    PersistenceFailed {
        operation: String,
        key: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Remote sync failed for {resource}")]
    #[diagnostic(
        code(cadence_core::sync_failed),
        help("Transport failures are retried implicitly on the next sync trigger")
    )]
    SyncFailed {
        resource: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Remote rejected credential for {resource}")]
    #[diagnostic(
        code(cadence_core::unauthorized),
        help("The local credential is invalidated; the next attempt re-resolves the session")
    )]
    Unauthorized { resource: String },

    #[error("Notification scheduler operation failed")]
    #[diagnostic(
        code(cadence_core::scheduler_failed),
        help("Scheduling is retried on the next reconciliation pass")
    )]
    SchedulerFailed {
        operation: String,
        identifier: Option<String>,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Shared bridge storage unavailable")]
    #[diagnostic(
        code(cadence_core::bridge_unavailable),
        help("Bridge operations degrade to no-ops when the shared slot cannot be reached")
    )]
    BridgeUnavailable {
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error")]
    #[diagnostic(
        code(cadence_core::configuration_error),
        help("Check configuration file at {config_path}")
    )]
    ConfigurationError {
        config_path: String,
        field: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

// Helper functions for creating common errors with context
impl CoreError {
    pub fn serialization(data_type: impl Into<String>, cause: serde_json::Error) -> Self {
        Self::SerializationError {
            data_type: data_type.into(),
            cause,
        }
    }

    pub fn persistence(
        operation: impl Into<String>,
        key: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PersistenceFailed {
            operation: operation.into(),
            key: key.into(),
            cause: Box::new(cause),
        }
    }

    pub fn sync_failed(
        resource: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SyncFailed {
            resource: resource.into(),
            cause: Box::new(cause),
        }
    }

    pub fn scheduler(
        operation: impl Into<String>,
        identifier: Option<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SchedulerFailed {
            operation: operation.into(),
            identifier,
            cause: Box::new(cause),
        }
    }
}
