//! Structured error types for kernelmesh
//!
//! One error enum covers the whole orchestration layer. Variants are grouped
//! by how callers are expected to react: protocol violations are programming
//! errors, execution and routing failures end up as `CommandFailed` events,
//! cancellation is terminal for the scheduler that raised it.

use thiserror::Error;

use crate::contract::transport::TransportError;

/// Primary error type for kernelmesh operations
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    // =========================================================================
    // Routing Slip Protocol Violations
    // =========================================================================
    /// A kernel stamped arrival twice
    #[error("The uri {uri} is already in the routing slip [{slip}]")]
    AlreadyInRoutingSlip { uri: String, slip: String },

    /// Completion stamp without a matching arrival
    #[error("The uri {uri} is not in the routing slip or has already been completed [{slip}]")]
    NotArrivedOrCompleted { uri: String, slip: String },

    /// Continuation slip does not share this slip's prefix
    #[error("The uri {uri} is already in the routing slip [{slip}], cannot continue with routing slip [{other}]")]
    RoutingSlipDiverged {
        uri: String,
        slip: String,
        other: String,
    },

    /// Malformed kernel uri
    #[error("invalid kernel uri '{uri}': {reason}")]
    InvalidKernelUri { uri: String, reason: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// A handler returned an error
    #[error("{message}")]
    CommandFailed { message: String },

    /// No handler registered for the command type
    #[error("Command {command_type} is not supported by kernel {kernel}")]
    NoHandler { command_type: String, kernel: String },

    /// An operation body panicked
    #[error("operation panicked: {message}")]
    OperationPanicked { message: String },

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// Scheduler was cancelled before or while the item ran
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Routing Errors
    // =========================================================================
    /// No kernel matches the command's target
    #[error("No kernel found for {target}")]
    NoSuitableKernel { target: String },

    /// A kernel name or alias is already taken in a composite
    #[error("Alias '{alias}' is already in use by kernel {kernel}")]
    DuplicateKernel { alias: String, kernel: String },

    // =========================================================================
    // Transport / Codec Errors
    // =========================================================================
    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire payload carries a tag nobody registered
    #[error("unregistered {kind} type '{tag}'")]
    UnregisteredType { kind: PayloadKind, tag: String },

    /// Serialization / deserialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Configuration / System Errors
    // =========================================================================
    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// IO error
    #[error("io error: {0}")]
    Io(String),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Which side of the wire a payload tag belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Command,
    Event,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadKind::Command => write!(f, "command"),
            PayloadKind::Event => write!(f, "event"),
        }
    }
}

impl MeshError {
    /// Routing slip misuse; never transient
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MeshError::AlreadyInRoutingSlip { .. }
                | MeshError::NotArrivedOrCompleted { .. }
                | MeshError::RoutingSlipDiverged { .. }
                | MeshError::InvalidKernelUri { .. }
        )
    }

    /// Raised by a cancelled scheduler
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MeshError::Cancelled)
    }

    /// Failure that should surface as a command failure rather than escape
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            MeshError::NoSuitableKernel { .. } | MeshError::NoHandler { .. }
        )
    }

    /// Message suitable for a `CommandFailed` event
    pub fn failure_message(&self) -> String {
        match self {
            MeshError::Cancelled => "Command cancelled.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(e: std::io::Error) -> Self {
        MeshError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for MeshError {
    fn from(e: toml::de::Error) -> Self {
        MeshError::InvalidConfig {
            message: e.to_string(),
        }
    }
}

impl From<toml::ser::Error> for MeshError {
    fn from(e: toml::ser::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<anyhow::Error> for MeshError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<MeshError>() {
            Ok(mesh) => mesh,
            Err(other) => MeshError::CommandFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MeshError>;
