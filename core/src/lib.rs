pub mod config;
pub mod contract;
pub mod error;
pub mod invocation;
pub mod kernel;
pub mod routing_slip;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use config::MeshConfig;
pub use contract::{KernelCommand, KernelEvent, KernelInfo, KernelUri, WireCodec, WireMessage};
pub use error::{MeshError, Result};
pub use invocation::InvocationContext;
pub use kernel::{CompositeKernel, Kernel, KernelCommandResult, KernelHost, LocalKernel, ProxyKernel};
pub use scheduler::KernelScheduler;
pub use transport::Connector;
