//! Error types for the discovery engine

use tonic::Status;

/// Errors raised while serving xDS streams and computing pushes
#[derive(thiserror::Error, Debug)]
pub enum XdsError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to generate {resource_type} for {proxy}: {message}")]
    Generation {
        resource_type: String,
        proxy: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("discovery server is shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl XdsError {
    pub fn generation(
        resource_type: impl Into<String>,
        proxy: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        XdsError::Generation {
            resource_type: resource_type.into(),
            proxy: proxy.into(),
            message: message.into(),
        }
    }
}

impl From<XdsError> for Status {
    fn from(err: XdsError) -> Self {
        match err {
            XdsError::Protocol(msg) => Status::invalid_argument(msg),
            XdsError::ConnectionNotFound(id) => Status::not_found(id),
            XdsError::Shutdown => Status::unavailable("discovery server is shutting down"),
            other => Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, XdsError>;
