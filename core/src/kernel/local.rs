//! Handler-backed kernel
//!
//! A [`LocalKernel`] owns a scheduler and a table of command handlers.
//! Commands sent to it are queued and run one at a time; a handler that
//! sends further commands to the same kernel runs them inline.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{
    adopt_ambient_parent, finish, report_failure, stamp_completion, Kernel, KernelCommandResult,
    ScheduledCommand, SendGuard, EVENT_BROADCAST_CAPACITY,
};
use crate::contract::{KernelCommand, KernelEvent, KernelInfo, KernelUri, RequestKernelInfo};
use crate::error::{MeshError, Result};
use crate::invocation::{Established, InvocationContext};
use crate::scheduler::{operation, KernelScheduler, Operation};

/// Handles one command type; publishes through the given context
pub type CommandHandler =
    Arc<dyn Fn(KernelCommand, InvocationContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) struct KernelState {
    info: RwLock<KernelInfo>,
    handlers: RwLock<HashMap<String, CommandHandler>>,
    deferred: Mutex<VecDeque<KernelCommand>>,
    events: broadcast::Sender<KernelEvent>,
}

impl KernelState {
    pub(crate) fn name(&self) -> String {
        self.info.read().local_name.clone()
    }

    pub(crate) fn uri(&self) -> KernelUri {
        self.info.read().uri.clone()
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<KernelEvent> {
        &self.events
    }

    /// Publish every event of a root context on the live broadcast
    fn forward_root_events(&self, context: &InvocationContext) {
        let sender = self.events.clone();
        context.on_event(move |event| {
            // no subscribers is fine
            let _ = sender.send(event.clone());
        });
    }

    fn deferred_item(&self, mut command: KernelCommand) -> ScheduledCommand {
        let Established { context, .. } = InvocationContext::establish_within(&command, None);
        self.forward_root_events(&context);
        if let Err(error) = command.routing_slip.stamp_as_arrived(&self.uri()) {
            warn!(command = %command.id, %error, "deferred command already routed here");
        }
        ScheduledCommand {
            command,
            context,
            complete_on_finish: true,
        }
    }

    async fn handle(&self, item: ScheduledCommand) -> Result<()> {
        let ScheduledCommand {
            mut command,
            context,
            complete_on_finish,
        } = item;
        context.enter_kernel(&self.uri());

        let outcome = self.run_handler(&command, &context).await;
        match &outcome {
            // the handler saw its nested commands fail and carried on
            Ok(()) => context.recover_from_child_failures(),
            Err(error) => report_failure(&context, &command, error),
        }
        if complete_on_finish {
            stamp_completion(&mut command, &self.uri());
            context.complete(&command);
        }
        outcome
    }

    async fn run_handler(&self, command: &KernelCommand, context: &InvocationContext) -> Result<()> {
        let handler = self.handlers.read().get(command.command_type()).cloned();
        let Some(handler) = handler else {
            if command.command_type() == RequestKernelInfo::TYPE {
                let info = self.info.read().clone();
                context.publish(KernelEvent::kernel_info_produced(command, info));
                return Ok(());
            }
            return Err(MeshError::NoHandler {
                command_type: command.command_type().to_string(),
                kernel: self.name(),
            });
        };

        debug!(
            kernel = %self.name(),
            command = %command.id,
            command_type = command.command_type(),
            "handling command"
        );
        context
            .scope(handler(command.clone(), context.clone()))
            .await
            .map_err(MeshError::from)
    }
}

/// Kernel that runs registered handlers
pub struct LocalKernel {
    state: Arc<KernelState>,
    scheduler: KernelScheduler<ScheduledCommand, ()>,
    operation: Operation<ScheduledCommand, ()>,
}

impl LocalKernel {
    /// Create a kernel at `kernel://local/{name}`; needs a tokio runtime
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut info = KernelInfo::new(name.clone(), KernelUri::local(&name)?);
        info.add_supported_command(RequestKernelInfo::TYPE);
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let state = Arc::new(KernelState {
            info: RwLock::new(info),
            handlers: RwLock::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            events,
        });

        let scheduler = KernelScheduler::new();
        let deferred_state = Arc::clone(&state);
        scheduler.register_deferred_operation_source(move |_item: &ScheduledCommand, _scope: &str| {
            let drained: Vec<KernelCommand> = deferred_state.deferred.lock().drain(..).collect();
            drained
                .into_iter()
                .map(|command| deferred_state.deferred_item(command))
                .collect()
        });

        let handler_state = Arc::clone(&state);
        let operation = operation(move |item: ScheduledCommand| {
            let state = Arc::clone(&handler_state);
            async move { state.handle(item).await }
        });

        Ok(Self {
            state,
            scheduler,
            operation,
        })
    }

    pub fn with_language(self, name: impl Into<String>, version: impl Into<String>) -> Self {
        {
            let mut info = self.state.info.write();
            info.language_name = Some(name.into());
            info.language_version = Some(version.into());
        }
        self
    }

    pub fn with_display_name(self, display_name: impl Into<String>) -> Self {
        self.state.info.write().display_name = Some(display_name.into());
        self
    }

    pub fn with_aliases(self, aliases: &[&str]) -> Self {
        {
            let mut info = self.state.info.write();
            for alias in aliases {
                if !info.answers_to(alias) {
                    info.aliases.push(alias.to_string());
                }
            }
        }
        self
    }

    /// Register (or replace) the handler for `command_type`
    pub fn register_handler<F, Fut>(&self, command_type: &str, handler: F)
    where
        F: Fn(KernelCommand, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |command, context| handler(command, context).boxed());
        self.state
            .handlers
            .write()
            .insert(command_type.to_string(), handler);
        self.state.info.write().add_supported_command(command_type);
    }

    /// Queue a command to run before the next scheduled command
    ///
    /// Deferred commands run in their own root context; their events
    /// reach subscribers only.
    pub fn defer_command(&self, command: KernelCommand) {
        debug!(kernel = %self.state.name(), command = %command.id, "command deferred");
        self.state.deferred.lock().push_back(command);
    }

    /// Register a source of commands that run ahead of every scheduled command
    pub fn register_deferred_commands<F>(&self, source: F)
    where
        F: Fn(&KernelCommand) -> Vec<KernelCommand> + Send + Sync + 'static,
    {
        let state = Arc::clone(&self.state);
        self.scheduler
            .register_deferred_operation_source(move |item: &ScheduledCommand, _scope: &str| {
                source(&item.command)
                    .into_iter()
                    .map(|command| state.deferred_item(command))
                    .collect()
            });
    }

    pub(crate) fn state(&self) -> &Arc<KernelState> {
        &self.state
    }

    pub(crate) fn forward_root_events(&self, context: &InvocationContext) {
        self.state.forward_root_events(context);
    }

    pub(crate) fn mark_composite(&self) {
        self.state.info.write().is_composite = true;
    }

    /// Run `command` on this kernel's scheduler within `context`
    pub(crate) async fn invoke(&self, command: &KernelCommand, context: &InvocationContext) -> Result<()> {
        let item = ScheduledCommand {
            command: command.clone(),
            context: context.clone(),
            complete_on_finish: false,
        };
        let outcome = self
            .scheduler
            .schedule(item, Arc::clone(&self.operation), self.state.name())
            .await;
        if let Err(error) = &outcome {
            report_failure(context, command, error);
        }
        outcome
    }
}

#[async_trait]
impl Kernel for LocalKernel {
    fn name(&self) -> String {
        self.state.name()
    }

    fn kernel_info(&self) -> KernelInfo {
        self.state.info.read().clone()
    }

    fn uri(&self) -> KernelUri {
        self.state.uri()
    }

    fn set_uri(&self, uri: KernelUri) {
        self.state.info.write().uri = uri;
    }

    fn supports_command(&self, command_type: &str) -> bool {
        self.state.info.read().supports(command_type)
    }

    async fn send(&self, mut command: KernelCommand) -> Result<KernelCommandResult> {
        adopt_ambient_parent(&mut command);
        let Established { context, owned } = InvocationContext::establish(&command);
        let _guard = SendGuard::new(&context, &command, owned);
        if owned && context.is_root() {
            self.forward_root_events(&context);
        }

        let uri = self.uri();
        if let Err(error) = command.routing_slip.stamp_as_arrived(&uri) {
            report_failure(&context, &command, &error);
            return Ok(finish(context, owned, command).await);
        }

        if let Err(error) = self.invoke(&command, &context).await {
            debug!(kernel = %self.name(), command = %command.id, %error, "command did not succeed");
        }
        stamp_completion(&mut command, &uri);
        Ok(finish(context, owned, command).await)
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.state.events.subscribe()
    }

    fn cancel(&self) {
        self.scheduler.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{EventPayload, FormattedValue, SubmitCode};
    use std::time::Duration;

    fn echo_kernel(name: &str) -> LocalKernel {
        let kernel = LocalKernel::new(name).unwrap();
        kernel.register_handler(SubmitCode::TYPE, |command, context| async move {
            let code = command.code().unwrap_or_default().to_string();
            context.publish(KernelEvent::return_value(&command, FormattedValue::plain_text(code)));
            Ok(())
        });
        kernel
    }

    #[tokio::test]
    async fn test_send_publishes_events_and_succeeds() {
        let kernel = echo_kernel("csharp");
        let result = kernel.send(KernelCommand::submit_code("1 + 1")).await.unwrap();

        assert!(result.succeeded());
        let values: Vec<_> = result.events_of_type("ReturnValueProduced").collect();
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].routing_slip.to_uri_array(),
            vec![KernelUri::parse("kernel://local/csharp").unwrap()]
        );
        assert_eq!(
            result.command.routing_slip.to_uri_array(),
            vec![KernelUri::parse("kernel://local/csharp").unwrap()]
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails_command() {
        let kernel = LocalKernel::new("empty").unwrap();
        let result = kernel.send(KernelCommand::submit_code("x")).await.unwrap();

        assert!(!result.succeeded());
        assert_eq!(
            result.failure_message(),
            Some("Command SubmitCode is not supported by kernel empty")
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_command_failed() {
        let kernel = LocalKernel::new("broken").unwrap();
        kernel.register_handler(SubmitCode::TYPE, |_command, _context| async move {
            Err(anyhow::anyhow!("compilation error"))
        });

        let result = kernel.send(KernelCommand::submit_code("x")).await.unwrap();
        assert_eq!(result.failure_message(), Some("compilation error"));
    }

    #[tokio::test]
    async fn test_request_kernel_info_answers_by_default() {
        let kernel = echo_kernel("fsharp").with_language("F#", "8.0");
        let result = kernel.send(KernelCommand::request_kernel_info()).await.unwrap();

        assert!(result.succeeded());
        let info = result
            .events
            .iter()
            .find_map(|event| match &event.payload {
                EventPayload::KernelInfoProduced(produced) => Some(produced.kernel_info.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.local_name, "fsharp");
        assert_eq!(info.language_name.as_deref(), Some("F#"));
        assert!(info.supports(SubmitCode::TYPE));
    }

    #[tokio::test]
    async fn test_nested_send_to_same_kernel_runs_inline() {
        let kernel = Arc::new(echo_kernel("csharp"));
        let inner = Arc::clone(&kernel);
        kernel.register_handler("Outer", move |command, _context| {
            let inner = Arc::clone(&inner);
            async move {
                let nested = inner.send(KernelCommand::submit_code("nested")).await?;
                assert_eq!(nested.command.parent_id.as_ref(), Some(&command.id));
                Ok(())
            }
        });

        let outer = KernelCommand::custom("Outer", serde_json::json!({}));
        let result = tokio::time::timeout(Duration::from_secs(5), kernel.send(outer))
            .await
            .expect("nested send deadlocked")
            .unwrap();

        assert!(result.succeeded());
        // the nested command's return value surfaces in the outer context
        assert_eq!(result.events_of_type("ReturnValueProduced").count(), 1);
    }

    #[tokio::test]
    async fn test_handler_may_recover_from_failed_nested_command() {
        let broken = Arc::new(LocalKernel::new("broken").unwrap());
        broken.register_handler(SubmitCode::TYPE, |_command, _context| async move {
            Err(anyhow::anyhow!("division by zero"))
        });
        let kernel = LocalKernel::new("csharp").unwrap();
        let target = Arc::clone(&broken);
        kernel.register_handler("Outer", move |_command, _context| {
            let target = Arc::clone(&target);
            async move {
                let nested = target.send(KernelCommand::submit_code("1 / 0")).await?;
                assert_eq!(nested.failure_message(), Some("division by zero"));
                Ok(())
            }
        });

        let result = kernel
            .send(KernelCommand::custom("Outer", serde_json::json!({})))
            .await
            .unwrap();

        assert!(result.succeeded());
        let error = result.events_of_type("ErrorProduced").next().unwrap();
        match &error.payload {
            EventPayload::ErrorProduced(produced) => assert_eq!(produced.message, "division by zero"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abandoned_nested_send_does_not_hang_parent() {
        let slow = Arc::new(LocalKernel::new("slow").unwrap());
        slow.register_handler(SubmitCode::TYPE, |_command, _context| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        });
        let kernel = LocalKernel::new("csharp").unwrap();
        let target = Arc::clone(&slow);
        kernel.register_handler("Outer", move |_command, _context| {
            let target = Arc::clone(&target);
            async move {
                let abandoned = tokio::time::timeout(
                    Duration::from_millis(10),
                    target.send(KernelCommand::submit_code("long")),
                )
                .await;
                assert!(abandoned.is_err());
                Ok(())
            }
        });

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            kernel.send(KernelCommand::custom("Outer", serde_json::json!({}))),
        )
        .await
        .expect("parent kept waiting on an abandoned child")
        .unwrap();

        assert!(result.succeeded());
        let error = result.events_of_type("ErrorProduced").next().unwrap();
        match &error.payload {
            EventPayload::ErrorProduced(produced) => assert_eq!(produced.message, "Command cancelled."),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deferred_command_runs_before_next_command() {
        let kernel = echo_kernel("csharp");
        let mut events = kernel.subscribe();
        kernel.defer_command(KernelCommand::submit_code("setup"));

        let result = kernel.send(KernelCommand::submit_code("main")).await.unwrap();
        assert!(result.succeeded());

        let first = events.recv().await.unwrap();
        match &first.payload {
            EventPayload::ReturnValueProduced(value) => {
                assert_eq!(value.formatted_values[0].value, "setup");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_root_events() {
        let kernel = echo_kernel("csharp");
        let mut events = kernel.subscribe();

        kernel.send(KernelCommand::submit_code("42")).await.unwrap();

        let value = events.recv().await.unwrap();
        assert_eq!(value.event_type(), "ReturnValueProduced");
        let terminal = events.recv().await.unwrap();
        assert_eq!(terminal.event_type(), "CommandSucceeded");
    }

    #[tokio::test]
    async fn test_cancelled_kernel_fails_new_commands() {
        let kernel = echo_kernel("csharp");
        kernel.cancel();

        let result = kernel.send(KernelCommand::submit_code("x")).await.unwrap();
        assert_eq!(result.failure_message(), Some("Command cancelled."));
    }
}
