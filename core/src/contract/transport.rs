//! Transport traits - the wire boundary between kernel trees
//!
//! A transport is an ordered, reliable, bidirectional message channel. It is
//! split into a sending half (shared by every proxy and host using the
//! connection) and a receiving half (owned by the connector's pump task).
//!
//! # Implementations
//! - `transport::in_memory`: paired channels inside one process
//! - `transport::stream`: one JSON message per line over any byte stream

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::envelope::WireMessage;

/// Sending half of a transport
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Send one message to the remote side
    async fn send(&self, message: &WireMessage) -> Result<(), TransportError>;

    /// Flush any buffered messages
    async fn flush(&self) -> Result<(), TransportError>;

    /// Close the sending side gracefully
    async fn close(&self) -> Result<(), TransportError>;

    /// Get transport capabilities
    fn capabilities(&self) -> TransportCapabilities;
}

/// Receiving half of a transport
#[async_trait]
pub trait TransportReceiver: Send {
    /// Wait for the next batch of messages
    ///
    /// An empty batch means the remote side closed the connection.
    async fn next_batch(&mut self) -> Result<Vec<WireMessage>, TransportError>;
}

/// Both halves of one connection
pub struct TransportEndpoint {
    pub sender: Box<dyn TransportSender>,
    pub receiver: Box<dyn TransportReceiver>,
}

impl TransportEndpoint {
    pub fn new(sender: Box<dyn TransportSender>, receiver: Box<dyn TransportReceiver>) -> Self {
        Self { sender, receiver }
    }
}

/// Errors that can occur in transport
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Connection lost
    Disconnected { reason: String },

    /// Send failed
    SendFailed { error: String },

    /// Receive failed
    ReceiveFailed { error: String },

    /// A message could not be encoded or decoded
    Serialization { error: String },

    /// Timeout
    Timeout { operation: String, duration_ms: u64 },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Disconnected { reason } => write!(f, "Transport disconnected: {}", reason),
            TransportError::SendFailed { error } => write!(f, "Send failed: {}", error),
            TransportError::ReceiveFailed { error } => write!(f, "Receive failed: {}", error),
            TransportError::Serialization { error } => write!(f, "Serialization error: {}", error),
            TransportError::Timeout { operation, duration_ms } => {
                write!(f, "Timeout after {}ms: {}", duration_ms, operation)
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// The connection cannot be used any more
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Disconnected { .. })
    }
}

/// Capabilities of a transport implementation
#[derive(Debug, Clone)]
pub struct TransportCapabilities {
    /// Delivery guarantee
    pub delivery_guarantee: DeliveryGuarantee,

    /// Ordering guarantee
    pub ordering_guarantee: OrderingGuarantee,
}

impl TransportCapabilities {
    /// What kernel routing requires of a connection
    pub fn is_suitable_for_routing(&self) -> bool {
        self.delivery_guarantee != DeliveryGuarantee::AtMostOnce
            && self.ordering_guarantee == OrderingGuarantee::Fifo
    }
}

/// Delivery guarantee level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    /// Fire and forget, no guarantee
    AtMostOnce,

    /// Will be delivered at least once (may duplicate)
    AtLeastOnce,

    /// Delivered exactly once
    ExactlyOnce,
}

/// Ordering guarantee level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingGuarantee {
    /// Strict FIFO per connection
    Fifo,

    /// No ordering guarantees
    None,
}

/// Configuration for transports and connectors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Batch size for next_batch()
    pub batch_size: usize,

    /// Timeout for a single send
    pub timeout_ms: u64,

    /// Buffer size for internal channels
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            timeout_ms: 30000,
            buffer_size: 1000,
        }
    }
}
