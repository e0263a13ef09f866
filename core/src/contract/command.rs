//! Kernel commands
//!
//! A command is a payload plus routing metadata. The payload is a closed sum
//! type; runtime-defined commands travel as [`CustomCommand`] and must be
//! registered with the wire codec before they can cross a transport.

use serde::{Deserialize, Serialize};

use super::ids::{CommandId, CommandToken, KernelUri};
use crate::routing_slip::CommandRoutingSlip;

/// Submit source code for execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCode {
    pub code: String,
}

impl SubmitCode {
    pub const TYPE: &'static str = "SubmitCode";
}

/// Ask a kernel to describe itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestKernelInfo {}

impl RequestKernelInfo {
    pub const TYPE: &'static str = "RequestKernelInfo";
}

/// A command type registered at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCommand {
    pub command_type: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Command payloads
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    SubmitCode(SubmitCode),
    RequestKernelInfo(RequestKernelInfo),
    Custom(CustomCommand),
}

impl CommandPayload {
    /// Wire tag and handler key
    pub fn command_type(&self) -> &str {
        match self {
            CommandPayload::SubmitCode(_) => SubmitCode::TYPE,
            CommandPayload::RequestKernelInfo(_) => RequestKernelInfo::TYPE,
            CommandPayload::Custom(custom) => &custom.command_type,
        }
    }
}

/// A command travelling through the kernel tree
#[derive(Debug, Clone, PartialEq)]
pub struct KernelCommand {
    pub id: CommandId,
    pub token: CommandToken,
    pub parent_id: Option<CommandId>,
    pub target_kernel_name: Option<String>,
    pub origin_uri: Option<KernelUri>,
    pub destination_uri: Option<KernelUri>,
    pub payload: CommandPayload,
    pub routing_slip: CommandRoutingSlip,
}

impl KernelCommand {
    pub fn new(payload: CommandPayload) -> Self {
        let id = CommandId::new();
        Self {
            token: CommandToken::root(&id),
            id,
            parent_id: None,
            target_kernel_name: None,
            origin_uri: None,
            destination_uri: None,
            payload,
            routing_slip: CommandRoutingSlip::new(),
        }
    }

    pub fn submit_code(code: impl Into<String>) -> Self {
        Self::new(CommandPayload::SubmitCode(SubmitCode { code: code.into() }))
    }

    pub fn request_kernel_info() -> Self {
        Self::new(CommandPayload::RequestKernelInfo(RequestKernelInfo {}))
    }

    pub fn custom(command_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(CommandPayload::Custom(CustomCommand {
            command_type: command_type.into(),
            body,
        }))
    }

    /// A new command issued on behalf of `parent`
    pub fn child_of(parent: &KernelCommand, payload: CommandPayload) -> Self {
        let mut command = Self::new(payload);
        command.set_parent(parent);
        command
    }

    pub fn with_target(mut self, kernel_name: impl Into<String>) -> Self {
        self.target_kernel_name = Some(kernel_name.into());
        self
    }

    pub fn with_destination(mut self, uri: KernelUri) -> Self {
        self.destination_uri = Some(uri);
        self
    }

    /// Adopt `parent` unless a parent was already set
    pub fn set_parent(&mut self, parent: &KernelCommand) {
        if self.parent_id.is_some() || parent.id == self.id {
            return;
        }
        self.parent_id = Some(parent.id.clone());
        self.token = CommandToken::child(&parent.token, &self.id);
    }

    pub fn command_type(&self) -> &str {
        self.payload.command_type()
    }

    pub fn code(&self) -> Option<&str> {
        match &self.payload {
            CommandPayload::SubmitCode(submit) => Some(&submit.code),
            _ => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
