use api_types::DeviceType;
use thiserror::Error;

use crate::platform::PlatformError;

/// Unified error type for claim preparation and release
#[derive(Debug, Error)]
pub enum DriverError {
    /// The claim's configuration was rejected before any side effect.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("no handler registered for type={device_type} kind={kind}")]
    NotFound { device_type: DeviceType, kind: String },

    /// An OS-level create, find or relocate operation failed.
    #[error("{message}")]
    Resource { message: String },

    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// Several independent failures of one operation.
    #[error("{context}: [{}]", join_errors(.errors))]
    Aggregate {
        context: String,
        errors: Vec<DriverError>,
    },
}

impl DriverError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Prefixes the message with `context`, keeping the variant.
    pub fn context(self, context: &str) -> Self {
        match self {
            Self::Config { message } => Self::Config {
                message: format!("{context}: {message}"),
            },
            Self::Resource { message } => Self::Resource {
                message: format!("{context}: {message}"),
            },
            Self::Persistence { message } => Self::Persistence {
                message: format!("{context}: {message}"),
            },
            other => other,
        }
    }
}

impl From<PlatformError> for DriverError {
    fn from(err: PlatformError) -> Self {
        Self::resource(err.to_string())
    }
}

fn join_errors(errors: &[DriverError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for driver operations
pub type Result<T, E = DriverError> = std::result::Result<T, E>;
