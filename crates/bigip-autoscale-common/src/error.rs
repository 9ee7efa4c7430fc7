//! Error types for autoscale convergence
//!
//! Errors are structured with fields to aid debugging in production.
//! Collaborator failures (instance directory, device, DNS) carry the operation
//! that failed and, when the collaborator reported one, a numeric status code.
//! The code and message are what the retry executor classifies on.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Prefix of the message carried by an error after the retry budget is spent
pub const MAX_TRIES_PREFIX: &str = "tryUntil: max tries reached: ";

/// Main error type for autoscale operations
#[derive(Debug, Error)]
pub enum Error {
    /// Instance directory (cloud provider) call failed
    #[error("directory error [{operation}]: {message}")]
    Directory {
        /// Directory operation that failed (e.g., "get_instances")
        operation: String,
        /// Description of what failed
        message: String,
        /// Status code reported by the provider, if any
        code: Option<u16>,
    },

    /// Device command client call failed
    #[error("device error [{operation}]: {message}")]
    Device {
        /// Device operation that failed (e.g., "join_cluster")
        operation: String,
        /// Description of what failed
        message: String,
        /// Status code reported by the device REST API, if any
        code: Option<u16>,
    },

    /// DNS provider update failed
    #[error("dns error: {message}")]
    Dns {
        /// Description of what failed
        message: String,
    },

    /// A required provider capability is not implemented
    #[error("unimplemented capability: {capability}")]
    Unimplemented {
        /// Name of the missing capability (e.g., "messaging")
        capability: String,
    },

    /// Invalid input or inconsistent directory snapshot
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field, if known
        field: Option<String>,
    },

    /// A stored backup failed its integrity check
    #[error("backup {name} is corrupted: {message}")]
    Corruption {
        /// Name of the corrupted backup
        name: String,
        /// Description of the integrity failure
        message: String,
    },

    /// Payload encryption or decryption failed
    #[error("crypto error: {message}")]
    Crypto {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Local filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being done when the error occurred
        context: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Another actor holds the resource this pass needs
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict
        message: String,
    },

    /// The retry budget was spent; wraps the last failure
    #[error("{message}")]
    RetriesExhausted {
        /// `"tryUntil: max tries reached: "` followed by the last failure's message
        message: String,
        /// The last failure
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "engine", "mailbox")
        context: String,
    },
}

impl Error {
    /// Create a directory error without a status code
    pub fn directory(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Directory {
            operation: operation.into(),
            message: msg.into(),
            code: None,
        }
    }

    /// Create a directory error carrying the provider's status code
    pub fn directory_with_code(
        operation: impl Into<String>,
        code: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self::Directory {
            operation: operation.into(),
            message: msg.into(),
            code: Some(code),
        }
    }

    /// Create a device error without a status code
    pub fn device(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Device {
            operation: operation.into(),
            message: msg.into(),
            code: None,
        }
    }

    /// Create a device error carrying the REST status code
    pub fn device_with_code(
        operation: impl Into<String>,
        code: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self::Device {
            operation: operation.into(),
            message: msg.into(),
            code: Some(code),
        }
    }

    /// Create a DNS error
    pub fn dns(msg: impl Into<String>) -> Self {
        Self::Dns {
            message: msg.into(),
        }
    }

    /// Create an error for a capability the provider set does not implement
    pub fn unimplemented(capability: impl Into<String>) -> Self {
        Self::Unimplemented {
            capability: capability.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a corruption error for a named backup
    pub fn corruption(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Corruption {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Wrap an I/O error with what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error as the final failure of a spent retry budget
    pub fn exhausted(self) -> Self {
        Self::RetriesExhausted {
            message: format!("{}{}", MAX_TRIES_PREFIX, self.message()),
            source: Box::new(self),
        }
    }

    /// Status code reported by the collaborator, if any
    ///
    /// A spent retry budget reports the code of the failure it wraps.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Directory { code, .. } | Error::Device { code, .. } => *code,
            Error::RetriesExhausted { source, .. } => source.code(),
            _ => None,
        }
    }

    /// The bare failure message, without the variant prefix
    ///
    /// Collaborator errors return what the collaborator said; everything else
    /// returns the full display string.
    pub fn message(&self) -> String {
        match self {
            Error::Directory { message, .. }
            | Error::Device { message, .. }
            | Error::Dns { message }
            | Error::Validation { message, .. }
            | Error::Crypto { message }
            | Error::Serialization { message }
            | Error::Conflict { message }
            | Error::RetriesExhausted { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error can never succeed on retry
    ///
    /// Missing capabilities and invalid input need a code or config fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::Unimplemented { .. } | Error::Validation { .. } => true,
            Error::RetriesExhausted { source, .. } => source.is_permanent(),
            _ => false,
        }
    }

    /// Get the collaborator operation if this error came from one
    pub fn operation(&self) -> Option<&str> {
        match self {
            Error::Directory { operation, .. } | Error::Device { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
