//! Serving a composite kernel over a connector

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::composite::CompositeKernel;
use super::proxy::ProxyKernel;
use super::Kernel;
use crate::contract::{
    EventPayload, KernelCommand, KernelEvent, KernelInfo, KernelReady, KernelUri, WireMessage,
};
use crate::error::{MeshError, Result};
use crate::scheduler::{operation, KernelScheduler, Operation};
use crate::transport::Connector;

const HOST_SCOPE: &str = "host";

/// Exposes a composite to the peer on the other end of a connector
pub struct KernelHost {
    composite: Arc<CompositeKernel>,
    connector: Arc<Connector>,
    uri: KernelUri,
    scheduler: KernelScheduler<KernelCommand, ()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KernelHost {
    /// Attach `composite` at `uri`; its children move below that uri
    pub fn new(composite: Arc<CompositeKernel>, connector: Arc<Connector>, uri: KernelUri) -> Result<Self> {
        composite.set_host_uri(uri.clone())?;
        Ok(Self {
            composite,
            connector,
            uri,
            scheduler: KernelScheduler::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn uri(&self) -> &KernelUri {
        &self.uri
    }

    pub fn composite(&self) -> &Arc<CompositeKernel> {
        &self.composite
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Start serving and announce the kernels to the peer
    pub async fn connect(&self) -> Result<()> {
        let outbound = self.spawn_event_forwarder();
        let inbound = self.spawn_command_dispatcher();
        self.tasks.lock().extend([outbound, inbound]);

        let mut ready = KernelEvent::unsolicited(EventPayload::KernelReady(KernelReady {
            kernel_infos: self.kernel_infos(),
        }));
        ready.routing_slip.stamp(&self.uri)?;
        self.connector.send(WireMessage::Event(ready)).await?;
        info!(host = %self.uri, "kernel host connected");
        Ok(())
    }

    fn spawn_event_forwarder(&self) -> JoinHandle<()> {
        let mut events = self.composite.subscribe();
        let connector = Arc::clone(&self.connector);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(error) = connector.send(WireMessage::Event(event)).await {
                            warn!(%error, "failed to send event to peer");
                            if matches!(error, MeshError::Transport(ref transport) if transport.is_fatal()) {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "host event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_command_dispatcher(&self) -> JoinHandle<()> {
        let mut inbound = self.connector.subscribe();
        let scheduler = self.scheduler.clone();
        let dispatch = dispatch_operation(Arc::clone(&self.composite));
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(WireMessage::Command(command)) => {
                        debug!(command = %command.id, command_type = command.command_type(), "command received from peer");
                        let id = command.id.clone();
                        let handle = scheduler.schedule(command, Arc::clone(&dispatch), HOST_SCOPE);
                        tokio::spawn(async move {
                            if let Err(error) = handle.await {
                                warn!(command = %id, %error, "inbound command was not dispatched");
                            }
                        });
                    }
                    Ok(WireMessage::Event(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "host command dispatcher lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("peer connection closed");
                        break;
                    }
                }
            }
        })
    }

    /// Add a proxy for `remote_uri` reachable through this host's connector
    pub async fn connect_proxy_kernel(
        &self,
        local_name: &str,
        remote_uri: KernelUri,
        aliases: &[&str],
    ) -> Result<Arc<ProxyKernel>> {
        let proxy = Arc::new(ProxyKernel::new(local_name, remote_uri, Arc::clone(&self.connector))?);
        self.composite.add(proxy.clone(), aliases)?;

        let refresh = proxy.send(KernelCommand::request_kernel_info()).await?;
        if let Some(message) = refresh.failure_message() {
            warn!(proxy = local_name, reason = message, "remote kernel info unavailable");
        }
        Ok(proxy)
    }

    /// The composite followed by its non-proxy children
    pub fn kernel_infos(&self) -> Vec<KernelInfo> {
        std::iter::once(self.composite.kernel_info())
            .chain(
                self.composite
                    .child_kernels()
                    .iter()
                    .map(|kernel| kernel.kernel_info())
                    .filter(|info| !info.is_proxy),
            )
            .collect()
    }
}

fn dispatch_operation(composite: Arc<CompositeKernel>) -> Operation<KernelCommand, ()> {
    operation(move |command: KernelCommand| {
        let composite = Arc::clone(&composite);
        async move {
            composite.send(command).await?;
            Ok(())
        }
    })
}

impl Drop for KernelHost {
    fn drop(&mut self) {
        self.scheduler.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
