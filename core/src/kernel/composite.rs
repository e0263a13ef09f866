//! Kernel that routes commands to child kernels
//!
//! # Routing
//! A command is resolved to a target in this order:
//! 1. its destination uri
//! 2. its target kernel name or alias (the composite's own name means itself)
//! 3. with no target: the composite if it handles the command type, then the
//!    default kernel for the command type, then the default kernel, then the
//!    only child
//!
//! Code submissions containing `#!name` selectors are split into
//! sub-commands, one per contiguous run of code for the same kernel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::local::LocalKernel;
use super::submission::split_submission;
use super::{
    adopt_ambient_parent, finish, is_kernel_info_request, report_failure, stamp_completion,
    Kernel, KernelCommandResult, SendGuard,
};
use crate::config::KernelConfig;
use crate::contract::{
    CommandPayload, KernelCommand, KernelEvent, KernelInfo, KernelUri, RequestKernelInfo,
    SubmitCode,
};
use crate::error::{MeshError, Result};
use crate::invocation::{Established, InvocationContext};

const LOCAL_BASE_URI: &str = "kernel://local/";

struct ChildKernel {
    kernel: Arc<dyn Kernel>,
    /// Local name first, then aliases
    names: Vec<String>,
}

#[derive(Clone)]
enum Target {
    Composite,
    Child(Arc<dyn Kernel>),
}

impl Target {
    fn same_as(&self, other: &Target) -> bool {
        match (self, other) {
            (Target::Composite, Target::Composite) => true,
            (Target::Child(a), Target::Child(b)) => a.name() == b.name(),
            _ => false,
        }
    }
}

enum Route {
    Local,
    Forward(Arc<dyn Kernel>),
    Split(Vec<(Target, KernelCommand)>),
}

/// Routes commands to child kernels
pub struct CompositeKernel {
    local: LocalKernel,
    children: RwLock<Vec<ChildKernel>>,
    default_kernel_name: RwLock<Option<String>>,
    default_kernels_by_command: RwLock<HashMap<String, String>>,
    host_uri: RwLock<Option<KernelUri>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl CompositeKernel {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let local = LocalKernel::new(name)?;
        local.mark_composite();
        Ok(Self {
            local,
            children: RwLock::new(Vec::new()),
            default_kernel_name: RwLock::new(None),
            default_kernels_by_command: RwLock::new(HashMap::new()),
            host_uri: RwLock::new(None),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// Composite named and routed as configured
    pub fn from_config(config: &KernelConfig) -> Result<Self> {
        let composite = Self::new(config.name.clone())?;
        if let Some(default_kernel) = &config.default_kernel {
            composite.set_default_kernel_name(Some(default_kernel.clone()));
        }
        for (command_type, kernel_name) in &config.default_kernels_by_command {
            composite.set_default_kernel_for_command(command_type, kernel_name);
        }
        if let Some(host_uri) = &config.host_uri {
            composite.set_host_uri(KernelUri::parse(host_uri)?)?;
        }
        Ok(composite)
    }

    /// Add a child kernel answering to its name, its own aliases and `aliases`
    ///
    /// The first child becomes the default kernel.
    pub fn add(&self, kernel: Arc<dyn Kernel>, aliases: &[&str]) -> Result<()> {
        let name = kernel.name();
        let info_aliases = kernel.kernel_info().aliases;
        let mut names = vec![name.clone()];
        for alias in info_aliases.iter().map(String::as_str).chain(aliases.iter().copied()) {
            if !names.iter().any(|known| known == alias) {
                names.push(alias.to_string());
            }
        }

        let base = self.child_base_uri()?;
        {
            let mut children = self.children.write();
            for candidate in &names {
                if self.local.kernel_info().answers_to(candidate) {
                    return Err(MeshError::DuplicateKernel {
                        alias: candidate.clone(),
                        kernel: self.name(),
                    });
                }
                if let Some(owner) = children.iter().find(|child| child.names.contains(candidate)) {
                    return Err(MeshError::DuplicateKernel {
                        alias: candidate.clone(),
                        kernel: owner.kernel.name(),
                    });
                }
            }
            kernel.set_uri(base.join(&name)?);
            children.push(ChildKernel {
                kernel: Arc::clone(&kernel),
                names,
            });
        }

        {
            let mut default_kernel_name = self.default_kernel_name.write();
            if default_kernel_name.is_none() {
                *default_kernel_name = Some(name.clone());
            }
        }

        self.forwarders.lock().push(self.spawn_forwarder(kernel.subscribe()));
        info!(composite = %self.name(), kernel = %name, uri = %kernel.uri(), "kernel added");
        Ok(())
    }

    /// Republish a child's live events stamped with this composite's uri
    fn spawn_forwarder(&self, mut events: broadcast::Receiver<KernelEvent>) -> JoinHandle<()> {
        let state = Arc::clone(self.local.state());
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(mut event) => {
                        event.routing_slip.stamp_if_absent(&state.uri());
                        let _ = state.events().send(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(composite = %state.name(), skipped, "child event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn child_base_uri(&self) -> Result<KernelUri> {
        match self.host_uri.read().clone() {
            Some(uri) => Ok(uri),
            None => KernelUri::parse(LOCAL_BASE_URI),
        }
    }

    /// Re-root this composite and its children under `uri`
    pub fn set_host_uri(&self, uri: KernelUri) -> Result<()> {
        for child in self.children.read().iter() {
            child.kernel.set_uri(uri.join(&child.kernel.name())?);
        }
        self.local.set_uri(uri.clone());
        *self.host_uri.write() = Some(uri);
        Ok(())
    }

    pub fn host_uri(&self) -> Option<KernelUri> {
        self.host_uri.read().clone()
    }

    pub fn set_default_kernel_name(&self, name: Option<String>) {
        *self.default_kernel_name.write() = name;
    }

    pub fn default_kernel_name(&self) -> Option<String> {
        self.default_kernel_name.read().clone()
    }

    pub fn set_default_kernel_for_command(&self, command_type: &str, kernel_name: &str) {
        self.default_kernels_by_command
            .write()
            .insert(command_type.to_string(), kernel_name.to_string());
    }

    pub fn child_kernels(&self) -> Vec<Arc<dyn Kernel>> {
        self.children
            .read()
            .iter()
            .map(|child| Arc::clone(&child.kernel))
            .collect()
    }

    pub fn find_kernel_by_name(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        self.children
            .read()
            .iter()
            .find(|child| child.names.iter().any(|candidate| candidate == name))
            .map(|child| Arc::clone(&child.kernel))
    }

    /// Child at `uri`, or a proxy whose remote kernel is at `uri`
    pub fn find_kernel_by_uri(&self, uri: &KernelUri) -> Option<Arc<dyn Kernel>> {
        self.children
            .read()
            .iter()
            .find(|child| {
                let info = child.kernel.kernel_info();
                &info.uri == uri || info.remote_uri.as_ref() == Some(uri)
            })
            .map(|child| Arc::clone(&child.kernel))
    }

    /// Register a handler for commands addressed to the composite itself
    pub fn register_handler<F, Fut>(&self, command_type: &str, handler: F)
    where
        F: Fn(KernelCommand, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.local.register_handler(command_type, handler);
    }

    fn is_kernel_name(&self, name: &str) -> bool {
        self.local.kernel_info().answers_to(name) || self.find_kernel_by_name(name).is_some()
    }

    fn single_child(&self) -> Option<Arc<dyn Kernel>> {
        let children = self.children.read();
        match children.as_slice() {
            [only] => Some(Arc::clone(&only.kernel)),
            _ => None,
        }
    }

    fn resolve_name(&self, name: &str) -> Result<Target> {
        if self.local.kernel_info().answers_to(name) {
            return Ok(Target::Composite);
        }
        self.find_kernel_by_name(name)
            .map(Target::Child)
            .ok_or_else(|| MeshError::NoSuitableKernel {
                target: name.to_string(),
            })
    }

    fn resolve(&self, command: &KernelCommand) -> Result<Target> {
        if let Some(destination) = &command.destination_uri {
            if destination == &self.uri() {
                return Ok(Target::Composite);
            }
            if let Some(kernel) = self.find_kernel_by_uri(destination) {
                return Ok(Target::Child(kernel));
            }
        }

        let name = match &command.target_kernel_name {
            Some(name) => name.clone(),
            None => {
                if self.local.supports_command(command.command_type()) {
                    return Ok(Target::Composite);
                }
                let by_command = self
                    .default_kernels_by_command
                    .read()
                    .get(command.command_type())
                    .cloned();
                match by_command.or_else(|| self.default_kernel_name()) {
                    Some(name) => name,
                    None => {
                        return Ok(self
                            .single_child()
                            .map(Target::Child)
                            .unwrap_or(Target::Composite))
                    }
                }
            }
        };
        self.resolve_name(&name)
    }

    fn plan(&self, command: &KernelCommand) -> Result<Route> {
        let target = self.resolve(command)?;
        let Some(code) = command.code() else {
            return Ok(route_to(target));
        };
        let explicitly_targeted = command.target_kernel_name.is_some() || command.destination_uri.is_some();
        if explicitly_targeted && matches!(target, Target::Composite) {
            return Ok(Route::Local);
        }

        let mut parts: Vec<(Target, String)> = Vec::new();
        for section in split_submission(code, |name| self.is_kernel_name(name)) {
            let section_target = match &section.kernel_name {
                Some(name) => self.resolve_name(name)?,
                None => target.clone(),
            };
            match parts.last_mut() {
                Some((last, merged)) if last.same_as(&section_target) => {
                    merged.push('\n');
                    merged.push_str(&section.code);
                }
                _ => parts.push((section_target, section.code)),
            }
        }

        if parts.iter().all(|(part_target, _)| part_target.same_as(&target)) {
            return Ok(route_to(target));
        }

        let sub_commands = parts
            .into_iter()
            .map(|(part_target, code)| {
                let kernel_name = match &part_target {
                    Target::Composite => self.name(),
                    Target::Child(kernel) => kernel.name(),
                };
                let sub_command = KernelCommand::child_of(command, CommandPayload::SubmitCode(SubmitCode { code }))
                    .with_target(kernel_name);
                (part_target, sub_command)
            })
            .collect();
        Ok(Route::Split(sub_commands))
    }

    async fn forward(&self, command: &mut KernelCommand, context: &InvocationContext, kernel: Arc<dyn Kernel>) {
        debug!(composite = %self.name(), command = %command.id, kernel = %kernel.name(), "forwarding command");
        match context.scope(kernel.send(command.clone())).await {
            Ok(result) => {
                if let Err(error) = command.routing_slip.append(&result.command.routing_slip) {
                    warn!(command = %command.id, %error, "routing slip diverged while forwarding");
                }
            }
            Err(error) => report_failure(context, command, &error),
        }
    }

    async fn send_parts(&self, parts: Vec<(Target, KernelCommand)>, context: &InvocationContext) {
        for (target, sub_command) in parts {
            if context.cancellation_token().is_cancelled() {
                break;
            }
            let kernel: &dyn Kernel = match &target {
                Target::Composite => &self.local,
                Target::Child(kernel) => kernel.as_ref(),
            };
            match context.scope(kernel.send(sub_command)).await {
                Ok(result) if result.succeeded() => {}
                Ok(_) => break,
                Err(error) => {
                    report_failure(context, context.command(), &error);
                    break;
                }
            }
        }
    }

    /// Ask every child for its info on behalf of `command`
    async fn request_child_kernel_info(&self, command: &KernelCommand, context: &InvocationContext) {
        for child in self.child_kernels() {
            let request = KernelCommand::child_of(command, CommandPayload::RequestKernelInfo(RequestKernelInfo {}))
                .with_target(child.name());
            if let Err(error) = context.scope(child.send(request)).await {
                warn!(kernel = %child.name(), %error, "kernel info request failed");
            }
        }
    }
}

fn route_to(target: Target) -> Route {
    match target {
        Target::Composite => Route::Local,
        Target::Child(kernel) => Route::Forward(kernel),
    }
}

#[async_trait]
impl Kernel for CompositeKernel {
    fn name(&self) -> String {
        self.local.name()
    }

    fn kernel_info(&self) -> KernelInfo {
        let mut info = self.local.kernel_info();
        for child in self.children.read().iter() {
            for command_type in child.kernel.kernel_info().supported_kernel_commands {
                info.add_supported_command(&command_type);
            }
        }
        info
    }

    fn uri(&self) -> KernelUri {
        self.local.uri()
    }

    fn set_uri(&self, uri: KernelUri) {
        self.local.set_uri(uri);
    }

    async fn send(&self, mut command: KernelCommand) -> Result<KernelCommandResult> {
        adopt_ambient_parent(&mut command);
        let Established { context, owned } = InvocationContext::establish(&command);
        let _guard = SendGuard::new(&context, &command, owned);
        if owned && context.is_root() {
            self.local.forward_root_events(&context);
        }

        let uri = self.uri();
        if let Err(error) = command.routing_slip.stamp_as_arrived(&uri) {
            report_failure(&context, &command, &error);
            return Ok(finish(context, owned, command).await);
        }
        context.enter_kernel(&uri);

        match self.plan(&command) {
            Ok(Route::Local) => {
                let handled = self.local.invoke(&command, &context).await.is_ok();
                if handled && is_kernel_info_request(&command) {
                    self.request_child_kernel_info(&command, &context).await;
                }
            }
            Ok(Route::Forward(kernel)) => self.forward(&mut command, &context, kernel).await,
            Ok(Route::Split(parts)) => {
                debug!(composite = %self.name(), command = %command.id, parts = parts.len(), "splitting submission");
                self.send_parts(parts, &context).await;
            }
            Err(error) => {
                warn!(composite = %self.name(), command = %command.id, %error, "unable to route command");
                report_failure(&context, &command, &error);
            }
        }

        stamp_completion(&mut command, &uri);
        Ok(finish(context, owned, command).await)
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.local.subscribe()
    }

    fn cancel(&self) {
        self.local.cancel();
        for child in self.child_kernels() {
            child.cancel();
        }
    }
}

impl Drop for CompositeKernel {
    fn drop(&mut self) {
        for forwarder in self.forwarders.lock().drain(..) {
            forwarder.abort();
        }
    }
}
