//! Kernel standing in for a kernel across a transport
//!
//! Commands are forwarded one at a time. Events coming back for the
//! forwarded command (or commands it spawned remotely) are republished in
//! the local invocation context, and the command's routing slip is
//! continued with the remote kernels it passed through.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use super::{
    adopt_ambient_parent, finish, is_kernel_info_request, report_failure, stamp_completion,
    Kernel, KernelCommandResult, ScheduledCommand, SendGuard, EVENT_BROADCAST_CAPACITY,
};
use crate::contract::{
    EventPayload, KernelCommand, KernelEvent, KernelInfo, KernelUri, RequestKernelInfo,
    SubmitCode, TransportError, WireMessage,
};
use crate::error::{MeshError, Result};
use crate::invocation::{Established, InvocationContext};
use crate::routing_slip::CommandRoutingSlip;
use crate::scheduler::{operation, KernelScheduler, Operation};
use crate::transport::Connector;

struct ProxyState {
    info: RwLock<KernelInfo>,
    connector: Arc<Connector>,
    events: broadcast::Sender<KernelEvent>,
}

impl ProxyState {
    fn name(&self) -> String {
        self.info.read().local_name.clone()
    }

    fn uri(&self) -> KernelUri {
        self.info.read().uri.clone()
    }

    fn remote_uri(&self) -> Option<KernelUri> {
        self.info.read().remote_uri.clone()
    }

    /// Take language and command support from the remote kernel's info
    fn adopt_remote_info(&self, remote: &KernelInfo) -> KernelInfo {
        let mut info = self.info.write();
        info.language_name = remote.language_name.clone();
        info.language_version = remote.language_version.clone();
        info.display_name = remote.display_name.clone();
        for command_type in &remote.supported_kernel_commands {
            info.add_supported_command(command_type);
        }
        info.clone()
    }

    async fn forward(&self, item: ScheduledCommand) -> Result<CommandRoutingSlip> {
        let ScheduledCommand {
            mut command,
            context,
            ..
        } = item;
        let local_uri = self.uri();
        let remote_uri = self.remote_uri().ok_or_else(|| MeshError::Internal {
            message: format!("proxy {} has no remote uri", self.name()),
        })?;
        context.enter_kernel(&local_uri);

        if is_kernel_info_request(&command) && command.routing_slip.contains(&remote_uri) {
            trace!(command = %command.id, "kernel info request already visited the remote kernel");
            return Ok(command.routing_slip);
        }
        if command.origin_uri.is_none() {
            command.origin_uri = Some(local_uri.clone());
        }
        let destination = &*command
            .destination_uri
            .get_or_insert_with(|| remote_uri.clone());
        if destination != &local_uri && !self.connector.can_reach(destination) {
            return Err(MeshError::NoSuitableKernel {
                target: destination.to_string(),
            });
        }

        // subscribe first so no reply can slip past
        let mut inbound = self.connector.subscribe();
        debug!(proxy = %self.name(), command = %command.id, remote = %remote_uri, "forwarding command");
        self.connector.send(WireMessage::Command(command.clone())).await?;

        let cancellation = context.cancellation_token();
        loop {
            let received = tokio::select! {
                _ = cancellation.cancelled() => return Err(MeshError::Cancelled),
                received = inbound.recv() => received,
            };
            let event = match received {
                Ok(WireMessage::Event(event)) => event,
                Ok(WireMessage::Command(_)) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(proxy = %self.name(), skipped, "proxy fell behind its connection");
                    continue;
                }
                Err(RecvError::Closed) => {
                    return Err(TransportError::Disconnected {
                        reason: "connection closed while waiting for the remote kernel".to_string(),
                    }
                    .into());
                }
            };

            let Some(remote_command) = &event.command else {
                continue;
            };
            if !remote_command.token.is_self_or_descendant_of(&command.token) {
                continue;
            }
            if remote_command
                .origin_uri
                .as_ref()
                .is_some_and(|origin| origin != &local_uri)
            {
                continue;
            }

            let is_forwarded = remote_command.id == command.id;
            if is_forwarded {
                if let Err(error) = command.routing_slip.append(&remote_command.routing_slip) {
                    warn!(command = %command.id, %error, "remote routing slip diverged");
                }
            }

            match &event.payload {
                EventPayload::CommandSucceeded(_) if is_forwarded => return Ok(command.routing_slip),
                EventPayload::CommandFailed(failed) if is_forwarded => {
                    context.fail(&command, failed.message.clone());
                    return Ok(command.routing_slip);
                }
                // terminal events of remote sub-commands stay remote
                _ if event.is_terminal() => continue,
                EventPayload::KernelInfoProduced(produced) if produced.kernel_info.uri == remote_uri => {
                    let info = self.adopt_remote_info(&produced.kernel_info);
                    let mut local_event = KernelEvent::kernel_info_produced(&command, info);
                    if let Err(error) = local_event.routing_slip.continue_with(&event.routing_slip) {
                        warn!(command = %command.id, %error, "kernel info routing slip diverged");
                    }
                    context.publish(local_event);
                }
                _ => {
                    if event.routing_slip.contains(&local_uri) {
                        trace!(event = event.event_type(), "event already passed through this proxy");
                        continue;
                    }
                    context.publish(event);
                }
            }
        }
    }
}

/// Local stand-in for a remote kernel
pub struct ProxyKernel {
    state: Arc<ProxyState>,
    scheduler: KernelScheduler<ScheduledCommand, CommandRoutingSlip>,
    operation: Operation<ScheduledCommand, CommandRoutingSlip>,
}

impl ProxyKernel {
    /// Proxy named `local_name` for the kernel at `remote_uri`
    pub fn new(local_name: impl Into<String>, remote_uri: KernelUri, connector: Arc<Connector>) -> Result<Self> {
        let local_name = local_name.into();
        let mut info = KernelInfo::new(local_name.clone(), KernelUri::local(&local_name)?);
        info.is_proxy = true;
        info.remote_uri = Some(remote_uri.clone());
        info.add_supported_command(RequestKernelInfo::TYPE);
        info.add_supported_command(SubmitCode::TYPE);
        connector.add_remote_uri(remote_uri);

        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let state = Arc::new(ProxyState {
            info: RwLock::new(info),
            connector,
            events,
        });
        let forward_state = Arc::clone(&state);
        let operation = operation(move |item: ScheduledCommand| {
            let state = Arc::clone(&forward_state);
            async move { state.forward(item).await }
        });

        Ok(Self {
            state,
            scheduler: KernelScheduler::new(),
            operation,
        })
    }

    pub fn remote_uri(&self) -> Option<KernelUri> {
        self.state.remote_uri()
    }

    /// Accept a runtime-defined command type and teach the codec its tag
    pub fn register_command_type(&self, command_type: &str) {
        self.state.info.write().add_supported_command(command_type);
        self.state.connector.codec().register_command_type(command_type);
    }

    fn forward_root_events(&self, context: &InvocationContext) {
        let sender = self.state.events.clone();
        context.on_event(move |event| {
            let _ = sender.send(event.clone());
        });
    }
}

#[async_trait]
impl Kernel for ProxyKernel {
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

        let item = ScheduledCommand {
            command: command.clone(),
            context: context.clone(),
            complete_on_finish: false,
        };
        match self
            .scheduler
            .schedule(item, Arc::clone(&self.operation), self.name())
            .await
        {
            Ok(routing_slip) => command.routing_slip = routing_slip,
            Err(error) => report_failure(&context, &command, &error),
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
    use crate::contract::{FormattedValue, TransportConfig, WireCodec};
    use crate::transport::connected_pair;
    use std::time::Duration;

    fn uri(raw: &str) -> KernelUri {
        KernelUri::parse(raw).unwrap()
    }

    fn connectors() -> (Arc<Connector>, Arc<Connector>) {
        let codec = Arc::new(WireCodec::new());
        let config = TransportConfig::default();
        let (local, remote) = connected_pair(&config, Arc::clone(&codec));
        (
            Connector::new(local, Arc::clone(&codec), &config),
            Connector::new(remote, codec, &config),
        )
    }

    /// Answer the next forwarded command the way a remote kernel would
    fn answer_next<F>(remote: Arc<Connector>, reply: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(KernelCommand) -> Vec<KernelEvent> + Send + 'static,
    {
        let mut inbound = remote.subscribe();
        tokio::spawn(async move {
            loop {
                if let Ok(WireMessage::Command(command)) = inbound.recv().await {
                    for event in reply(command) {
                        remote.send(WireMessage::Event(event)).await.unwrap();
                    }
                    return;
                }
            }
        })
    }

    #[tokio::test]
    async fn test_forwards_and_replays_remote_events() {
        let (local, remote) = connectors();
        let proxy = ProxyKernel::new("csharp-proxy", uri("kernel://remote/csharp"), local).unwrap();
        let remote_uri = uri("kernel://remote/csharp");

        let responder = answer_next(Arc::clone(&remote), move |mut command| {
            assert_eq!(command.destination_uri.as_ref(), Some(&remote_uri));
            command.routing_slip.stamp_as_arrived(&remote_uri).unwrap();
            let mut value = KernelEvent::return_value(&command, FormattedValue::plain_text("2"));
            value.routing_slip.stamp(&remote_uri).unwrap();
            command.routing_slip.stamp(&remote_uri).unwrap();
            let mut succeeded = KernelEvent::succeeded(&command);
            succeeded.routing_slip.stamp(&remote_uri).unwrap();
            vec![value, succeeded]
        });

        let result = tokio::time::timeout(Duration::from_secs(5), proxy.send(KernelCommand::submit_code("1 + 1")))
            .await
            .unwrap()
            .unwrap();
        responder.await.unwrap();

        assert!(result.succeeded());
        assert_eq!(
            result.command.routing_slip.to_uri_array(),
            vec![uri("kernel://local/csharp-proxy"), uri("kernel://remote/csharp")]
        );
        let value = result.events_of_type("ReturnValueProduced").next().unwrap();
        assert_eq!(
            value.routing_slip.to_uri_array(),
            vec![uri("kernel://remote/csharp"), uri("kernel://local/csharp-proxy")]
        );
    }

    #[tokio::test]
    async fn test_remote_failure_fails_local_command() {
        let (local, remote) = connectors();
        let proxy = ProxyKernel::new("python", uri("kernel://remote/python"), local).unwrap();

        let responder = answer_next(Arc::clone(&remote), |command| {
            vec![KernelEvent::failed(&command, "NameError: x")]
        });

        let result = proxy.send(KernelCommand::submit_code("x")).await.unwrap();
        responder.await.unwrap();

        assert_eq!(result.failure_message(), Some("NameError: x"));
    }

    #[tokio::test]
    async fn test_events_for_other_commands_are_ignored() {
        let (local, remote) = connectors();
        let proxy = ProxyKernel::new("python", uri("kernel://remote/python"), local).unwrap();

        let responder = answer_next(Arc::clone(&remote), |command| {
            let stranger = KernelCommand::submit_code("other");
            vec![
                KernelEvent::standard_output(&stranger, "noise"),
                KernelEvent::succeeded(&command),
            ]
        });

        let result = proxy.send(KernelCommand::submit_code("x")).await.unwrap();
        responder.await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.events_of_type("StandardOutputValueProduced").count(), 0);
    }

    #[tokio::test]
    async fn test_kernel_info_refreshes_proxy() {
        let (local, remote) = connectors();
        let proxy = ProxyKernel::new("python", uri("kernel://remote/python"), local).unwrap();

        let responder = answer_next(Arc::clone(&remote), |command| {
            let mut info = KernelInfo::new("python", uri("kernel://remote/python"));
            info.language_name = Some("Python".into());
            info.supported_kernel_commands = vec!["SubmitCode".into(), "RequestCompletions".into()];
            vec![
                KernelEvent::kernel_info_produced(&command, info),
                KernelEvent::succeeded(&command),
            ]
        });

        let result = proxy.send(KernelCommand::request_kernel_info()).await.unwrap();
        responder.await.unwrap();

        assert!(result.succeeded());
        let info = proxy.kernel_info();
        assert_eq!(info.language_name.as_deref(), Some("Python"));
        assert!(info.supports("RequestCompletions"));
        assert!(info.is_proxy);
        let produced = result.events_of_type("KernelInfoProduced").next().unwrap();
        match &produced.payload {
            EventPayload::KernelInfoProduced(produced) => {
                assert_eq!(produced.kernel_info.uri, uri("kernel://local/python"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_not_forwarded() {
        let (local, remote) = connectors();
        let proxy = ProxyKernel::new("python", uri("kernel://remote/python"), local).unwrap();
        let mut inbound = remote.subscribe();

        let command = KernelCommand::submit_code("x").with_destination(uri("kernel://elsewhere/x"));
        let result = tokio::time::timeout(Duration::from_secs(5), proxy.send(command))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            result.failure_message(),
            Some("No kernel found for kernel://elsewhere/x")
        );
        assert!(matches!(
            inbound.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_command() {
        let (local, remote) = connectors();
        let proxy = ProxyKernel::new("python", uri("kernel://remote/python"), local).unwrap();

        let mut inbound = remote.subscribe();
        let closer = tokio::spawn(async move {
            let _ = inbound.recv().await;
            remote.close().await.unwrap();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), proxy.send(KernelCommand::submit_code("x")))
            .await
            .unwrap()
            .unwrap();
        closer.await.unwrap();

        assert!(!result.succeeded());
        assert!(result.failure_message().unwrap().contains("disconnected"));
    }
}
