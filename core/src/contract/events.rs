//! Kernel events
//!
//! Events are a closed sum type. Every event optionally carries a snapshot of
//! the command that caused it (including that command's routing slip at the
//! time of publication) and its own [`EventRoutingSlip`].

use serde::{Deserialize, Serialize};

use super::command::KernelCommand;
use super::ids::CommandId;
use super::kernel_info::KernelInfo;
use crate::routing_slip::EventRoutingSlip;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSucceeded {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailed {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorProduced {
    pub message: String,
}

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Hidden,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    pub severity: DiagnosticSeverity,
    #[serde(default)]
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsProduced {
    pub diagnostics: Vec<Diagnostic>,
}

/// A value rendered for one mime type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedValue {
    pub mime_type: String,
    pub value: String,
}

impl FormattedValue {
    pub fn plain_text(value: impl Into<String>) -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayedValueProduced {
    pub formatted_values: Vec<FormattedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnValueProduced {
    pub formatted_values: Vec<FormattedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardOutputValueProduced {
    pub formatted_values: Vec<FormattedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfoProduced {
    pub kernel_info: KernelInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelReady {
    pub kernel_infos: Vec<KernelInfo>,
}

/// An event type registered at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEvent {
    pub event_type: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CommandSucceeded(CommandSucceeded),
    CommandFailed(CommandFailed),
    ErrorProduced(ErrorProduced),
    DiagnosticsProduced(DiagnosticsProduced),
    DisplayedValueProduced(DisplayedValueProduced),
    ReturnValueProduced(ReturnValueProduced),
    StandardOutputValueProduced(StandardOutputValueProduced),
    KernelInfoProduced(KernelInfoProduced),
    KernelReady(KernelReady),
    Custom(CustomEvent),
}

impl EventPayload {
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::CommandSucceeded(_) => "CommandSucceeded",
            EventPayload::CommandFailed(_) => "CommandFailed",
            EventPayload::ErrorProduced(_) => "ErrorProduced",
            EventPayload::DiagnosticsProduced(_) => "DiagnosticsProduced",
            EventPayload::DisplayedValueProduced(_) => "DisplayedValueProduced",
            EventPayload::ReturnValueProduced(_) => "ReturnValueProduced",
            EventPayload::StandardOutputValueProduced(_) => "StandardOutputValueProduced",
            EventPayload::KernelInfoProduced(_) => "KernelInfoProduced",
            EventPayload::KernelReady(_) => "KernelReady",
            EventPayload::Custom(custom) => &custom.event_type,
        }
    }

    /// Success or failure of the causing command
    pub fn is_terminal(&self) -> bool {
        match self {
            EventPayload::CommandSucceeded(_) | EventPayload::CommandFailed(_) => true,
            EventPayload::ErrorProduced(_)
            | EventPayload::DiagnosticsProduced(_)
            | EventPayload::DisplayedValueProduced(_)
            | EventPayload::ReturnValueProduced(_)
            | EventPayload::StandardOutputValueProduced(_)
            | EventPayload::KernelInfoProduced(_)
            | EventPayload::KernelReady(_)
            | EventPayload::Custom(_) => false,
        }
    }
}

/// An event emitted by a kernel
#[derive(Debug, Clone, PartialEq)]
pub struct KernelEvent {
    pub payload: EventPayload,
    pub command: Option<KernelCommand>,
    pub routing_slip: EventRoutingSlip,
}

impl KernelEvent {
    pub fn new(payload: EventPayload, command: &KernelCommand) -> Self {
        Self {
            payload,
            command: Some(command.clone()),
            routing_slip: EventRoutingSlip::new(),
        }
    }

    /// An event not caused by any command (e.g. `KernelReady`)
    pub fn unsolicited(payload: EventPayload) -> Self {
        Self {
            payload,
            command: None,
            routing_slip: EventRoutingSlip::new(),
        }
    }

    pub fn succeeded(command: &KernelCommand) -> Self {
        Self::new(EventPayload::CommandSucceeded(CommandSucceeded {}), command)
    }

    pub fn failed(command: &KernelCommand, message: impl Into<String>) -> Self {
        Self::new(
            EventPayload::CommandFailed(CommandFailed {
                message: message.into(),
            }),
            command,
        )
    }

    pub fn error_produced(command: &KernelCommand, message: impl Into<String>) -> Self {
        Self::new(
            EventPayload::ErrorProduced(ErrorProduced {
                message: message.into(),
            }),
            command,
        )
    }

    pub fn return_value(command: &KernelCommand, value: FormattedValue) -> Self {
        Self::new(
            EventPayload::ReturnValueProduced(ReturnValueProduced {
                formatted_values: vec![value],
            }),
            command,
        )
    }

    pub fn standard_output(command: &KernelCommand, text: impl Into<String>) -> Self {
        Self::new(
            EventPayload::StandardOutputValueProduced(StandardOutputValueProduced {
                formatted_values: vec![FormattedValue::plain_text(text)],
            }),
            command,
        )
    }

    pub fn kernel_info_produced(command: &KernelCommand, kernel_info: KernelInfo) -> Self {
        Self::new(
            EventPayload::KernelInfoProduced(KernelInfoProduced { kernel_info }),
            command,
        )
    }

    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    pub fn command_id(&self) -> Option<&CommandId> {
        self.command.as_ref().map(|command| &command.id)
    }

    /// Terminal event for exactly this command
    pub fn is_terminal_for(&self, id: &CommandId) -> bool {
        self.is_terminal() && self.command_id() == Some(id)
    }

    pub fn failure_message(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::CommandFailed(failed) => Some(&failed.message),
            _ => None,
        }
    }
}
