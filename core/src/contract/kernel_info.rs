//! Kernel descriptions exchanged with `RequestKernelInfo`

use serde::{Deserialize, Serialize};

use super::ids::KernelUri;

/// What a kernel is and what it can handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfo {
    pub local_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub uri: KernelUri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_uri: Option<KernelUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub is_composite: bool,
    #[serde(default)]
    pub supported_kernel_commands: Vec<String>,
}

impl KernelInfo {
    pub fn new(local_name: impl Into<String>, uri: KernelUri) -> Self {
        Self {
            local_name: local_name.into(),
            aliases: Vec::new(),
            uri,
            remote_uri: None,
            language_name: None,
            language_version: None,
            display_name: None,
            is_proxy: false,
            is_composite: false,
            supported_kernel_commands: Vec::new(),
        }
    }

    /// Local name followed by aliases
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.local_name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }

    pub fn supports(&self, command_type: &str) -> bool {
        self.supported_kernel_commands
            .iter()
            .any(|supported| supported == command_type)
    }

    pub(crate) fn add_supported_command(&mut self, command_type: &str) {
        if !self.supports(command_type) {
            self.supported_kernel_commands.push(command_type.to_string());
        }
    }
}
