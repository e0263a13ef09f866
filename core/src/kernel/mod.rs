//! Kernels - units that accept commands and emit events
//!
//! # Kinds
//! - [`LocalKernel`]: runs registered handlers on its own scheduler
//! - [`CompositeKernel`]: routes commands to child kernels, splitting
//!   submissions that address several of them
//! - [`ProxyKernel`]: forwards commands to a kernel on the far side of a
//!   transport and replays its events locally
//! - [`KernelHost`]: serves a composite to a remote peer
//!
//! Every kernel stamps a command's routing slip on arrival and on
//! completion, and every event leaving a kernel is stamped with its uri.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::contract::{
    CommandPayload, EventPayload, KernelCommand, KernelEvent, KernelInfo, KernelUri,
};
use crate::error::{MeshError, Result};
use crate::invocation::InvocationContext;

pub mod composite;
pub mod host;
pub mod local;
pub mod proxy;
pub mod submission;

pub use composite::CompositeKernel;
pub use host::KernelHost;
pub use local::{CommandHandler, LocalKernel};
pub use proxy::ProxyKernel;

/// Capacity of each kernel's live event broadcast
pub const EVENT_BROADCAST_CAPACITY: usize = 1024;

/// A node in the kernel tree
#[async_trait]
pub trait Kernel: Send + Sync {
    fn name(&self) -> String;

    fn kernel_info(&self) -> KernelInfo;

    fn uri(&self) -> KernelUri {
        self.kernel_info().uri
    }

    /// Assigned by the composite the kernel is added to
    fn set_uri(&self, uri: KernelUri);

    fn supports_command(&self, command_type: &str) -> bool {
        self.kernel_info().supports(command_type)
    }

    /// Run `command` and collect the events of its invocation context
    ///
    /// Command failures are reported in the result, not as `Err`.
    async fn send(&self, command: KernelCommand) -> Result<KernelCommandResult>;

    /// Live events of commands this kernel ran as root
    fn subscribe(&self) -> broadcast::Receiver<KernelEvent>;

    /// Cancel this kernel's scheduler; terminal
    fn cancel(&self);
}

/// Outcome of [`Kernel::send`]
#[derive(Debug, Clone)]
pub struct KernelCommandResult {
    /// The command with its final routing slip
    pub command: KernelCommand,
    pub events: Vec<KernelEvent>,
}

impl KernelCommandResult {
    pub fn terminal_event(&self) -> Option<&KernelEvent> {
        self.events
            .iter()
            .rev()
            .find(|event| event.is_terminal_for(&self.command.id))
    }

    pub fn succeeded(&self) -> bool {
        matches!(
            self.terminal_event().map(|event| &event.payload),
            Some(EventPayload::CommandSucceeded(_))
        )
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.terminal_event().and_then(KernelEvent::failure_message)
    }

    pub fn events_of_type<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a KernelEvent> + 'a {
        self.events
            .iter()
            .filter(move |event| event.event_type() == event_type)
    }
}

/// Item queued on a kernel scheduler
#[derive(Clone)]
pub(crate) struct ScheduledCommand {
    pub command: KernelCommand,
    pub context: InvocationContext,
    /// Deferred commands own their context and finish it themselves
    pub complete_on_finish: bool,
}

/// Make a command issued from inside a handler a child of that handler's command
pub(crate) fn adopt_ambient_parent(command: &mut KernelCommand) {
    if let Some(current) = InvocationContext::current() {
        if current.command_id() != &command.id {
            command.set_parent(current.command());
        }
    }
}

pub(crate) fn stamp_completion(command: &mut KernelCommand, uri: &KernelUri) {
    if let Err(error) = command.routing_slip.stamp(uri) {
        warn!(command = %command.id, %error, "completion stamp rejected");
    }
}

/// Fail the command's context unless it already finished
pub(crate) fn report_failure(context: &InvocationContext, command: &KernelCommand, error: &MeshError) {
    if context.is_complete() {
        return;
    }
    if error.is_cancellation() {
        debug!(command = %command.id, "command cancelled");
    } else {
        debug!(command = %command.id, %error, "command failed");
    }
    context.fail(command, error.failure_message());
}

/// Fails an owned context whose `send` future is dropped before finishing,
/// releasing the parent that counts it as an active child
pub(crate) struct SendGuard {
    context: InvocationContext,
    command: KernelCommand,
    owned: bool,
}

impl SendGuard {
    pub(crate) fn new(context: &InvocationContext, command: &KernelCommand, owned: bool) -> Self {
        Self {
            context: context.clone(),
            command: command.clone(),
            owned,
        }
    }
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        if self.owned && !self.context.is_complete() {
            debug!(command = %self.command.id, "send dropped before completion");
            self.context.fail(&self.command, MeshError::Cancelled.failure_message());
            self.context.dispose();
        }
    }
}

/// Complete an owned context and build the result
pub(crate) async fn finish(
    context: InvocationContext,
    owned: bool,
    command: KernelCommand,
) -> KernelCommandResult {
    if owned {
        context.complete(&command);
        context.wait_for_completion().await;
        context.dispose();
    }
    KernelCommandResult {
        events: context.events(),
        command,
    }
}

pub(crate) fn is_kernel_info_request(command: &KernelCommand) -> bool {
    matches!(command.payload, CommandPayload::RequestKernelInfo(_))
}
