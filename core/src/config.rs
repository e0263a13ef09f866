//! Configuration Store
//!
//! Loads and saves the kernelmesh TOML configuration:
//!
//! ```toml
//! [kernel]
//! name = ".NET"
//! default_kernel = "csharp"
//! host_uri = "kernel://local/"
//!
//! [kernel.default_kernels_by_command]
//! RequestHoverText = "csharp"
//!
//! [transport]
//! batch_size = 100
//! timeout_ms = 30000
//! buffer_size = 1000
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::contract::{KernelUri, TransportConfig};
use crate::error::{MeshError, Result};

/// Unified kernelmesh configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub kernel: KernelConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the root composite is named and routes untargeted commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Name of the root composite kernel
    #[serde(default = "default_kernel_name")]
    pub name: String,

    /// Child that receives commands without a target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_kernel: Option<String>,

    /// Base uri when the composite is hosted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_uri: Option<String>,

    /// Command type -> kernel name overrides for untargeted commands
    #[serde(default)]
    pub default_kernels_by_command: HashMap<String, String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: default_kernel_name(),
            default_kernel: None,
            host_uri: None,
            default_kernels_by_command: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_kernel_name() -> String {
    ".NET".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl MeshConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file, creating its directory
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// `<config dir>/kernelmesh/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kernelmesh").join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        Self::default_path()
            .filter(|path| path.exists())
            .and_then(|path| match Self::load(&path) {
                Ok(config) => Some(config),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "ignoring unreadable config");
                    None
                }
            })
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.kernel.name.trim().is_empty() {
            return Err(MeshError::InvalidConfig {
                message: "kernel.name must not be empty".to_string(),
            });
        }
        if self.transport.batch_size == 0 || self.transport.buffer_size == 0 {
            return Err(MeshError::InvalidConfig {
                message: "transport.batch_size and transport.buffer_size must be positive".to_string(),
            });
        }
        self.host_uri()?;
        Ok(())
    }

    /// Parsed `kernel.host_uri`
    pub fn host_uri(&self) -> Result<Option<KernelUri>> {
        self.kernel
            .host_uri
            .as_deref()
            .map(KernelUri::parse)
            .transpose()
    }
}
