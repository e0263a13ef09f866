//! Contract types shared by every kernel and transport
//!
//! # Module Structure
//! - `ids`: command identity, lineage tokens, kernel uris
//! - `command`: commands and their payloads
//! - `events`: events and their payloads
//! - `kernel_info`: kernel descriptions
//! - `envelope`: wire envelopes and the type-tag codec
//! - `transport`: the transport traits

#![forbid(unsafe_code)]

pub mod command;
pub mod envelope;
pub mod events;
pub mod ids;
pub mod kernel_info;
pub mod transport;

pub use command::{CommandPayload, CustomCommand, KernelCommand, RequestKernelInfo, SubmitCode};
pub use envelope::{WireCodec, WireMessage};
pub use events::{
    CommandFailed, CommandSucceeded, CustomEvent, Diagnostic, DiagnosticSeverity,
    DiagnosticsProduced, DisplayedValueProduced, ErrorProduced, EventPayload, FormattedValue,
    KernelEvent, KernelInfoProduced, KernelReady, ReturnValueProduced,
    StandardOutputValueProduced,
};
pub use ids::{CommandId, CommandToken, KernelUri};
pub use kernel_info::KernelInfo;
pub use transport::{
    DeliveryGuarantee, OrderingGuarantee, TransportCapabilities, TransportConfig,
    TransportEndpoint, TransportError, TransportReceiver, TransportSender,
};
