//! Connections between kernel trees
//!
//! A [`Connector`] owns one transport endpoint. A pump task reads inbound
//! batches and fans them out to every subscriber (proxies waiting on
//! results, a host waiting on commands); senders share the outbound half.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::contract::{
    KernelUri, TransportConfig, TransportEndpoint, TransportError, TransportReceiver,
    TransportSender, WireCodec, WireMessage,
};
use crate::error::Result;

pub mod in_memory;
pub mod stream;

pub use in_memory::connected_pair;

/// One side of a connection, shared by the proxies and host using it
pub struct Connector {
    sender: Box<dyn TransportSender>,
    /// Kept only to mint new subscriptions; the pump holds the sender
    template: Mutex<broadcast::Receiver<WireMessage>>,
    codec: Arc<WireCodec>,
    remote_uris: RwLock<Vec<KernelUri>>,
    send_timeout: Duration,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Start pumping `endpoint`; needs a tokio runtime
    pub fn new(endpoint: TransportEndpoint, codec: Arc<WireCodec>, config: &TransportConfig) -> Arc<Self> {
        let TransportEndpoint { sender, receiver } = endpoint;
        let capabilities = sender.capabilities();
        if !capabilities.is_suitable_for_routing() {
            warn!(
                ?capabilities,
                "transport does not guarantee ordered delivery, routing slips may diverge"
            );
        }

        let (inbound, template) = broadcast::channel(config.buffer_size.max(1));
        let pump = tokio::spawn(pump(receiver, inbound));

        Arc::new(Self {
            sender,
            template: Mutex::new(template),
            codec,
            remote_uris: RwLock::new(Vec::new()),
            send_timeout: Duration::from_millis(config.timeout_ms),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Inbound messages from now on; closes when the connection ends
    pub fn subscribe(&self) -> broadcast::Receiver<WireMessage> {
        self.template.lock().resubscribe()
    }

    pub async fn send(&self, message: WireMessage) -> Result<()> {
        match tokio::time::timeout(self.send_timeout, self.sender.send(&message)).await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(TransportError::Timeout {
                operation: "send".to_string(),
                duration_ms: self.send_timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    pub fn codec(&self) -> &Arc<WireCodec> {
        &self.codec
    }

    /// Record a remote kernel reachable through this connection
    pub fn add_remote_uri(&self, uri: KernelUri) {
        let mut remote_uris = self.remote_uris.write();
        if !remote_uris.contains(&uri) {
            remote_uris.push(uri);
        }
    }

    /// True if `uri` is, or lives under, a registered remote kernel
    pub fn can_reach(&self, uri: &KernelUri) -> bool {
        self.remote_uris
            .read()
            .iter()
            .any(|remote| remote == uri || uri.is_within(remote))
    }

    pub fn is_connected(&self) -> bool {
        self.pump
            .lock()
            .as_ref()
            .is_some_and(|pump| !pump.is_finished())
    }

    pub async fn close(&self) -> Result<()> {
        self.sender.close().await?;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        Ok(())
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn pump(mut receiver: Box<dyn TransportReceiver>, inbound: broadcast::Sender<WireMessage>) {
    loop {
        match receiver.next_batch().await {
            Ok(batch) if batch.is_empty() => {
                debug!("transport closed by remote side");
                break;
            }
            Ok(batch) => {
                for message in batch {
                    if inbound.send(message).is_err() {
                        trace!("inbound message with no subscriber dropped");
                    }
                }
            }
            Err(error) if error.is_fatal() => {
                warn!(%error, "transport disconnected");
                break;
            }
            Err(error) => {
                error!(%error, "dropping undecodable inbound message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::KernelCommand;

    fn connectors() -> (Arc<Connector>, Arc<Connector>) {
        let codec = Arc::new(WireCodec::new());
        let config = TransportConfig::default();
        let (left, right) = connected_pair(&config, Arc::clone(&codec));
        (
            Connector::new(left, Arc::clone(&codec), &config),
            Connector::new(right, codec, &config),
        )
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_inbound_messages() {
        let (local, remote) = connectors();
        let mut first = remote.subscribe();
        let mut second = remote.subscribe();

        let command = KernelCommand::submit_code("1");
        local.send(WireMessage::Command(command.clone())).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), WireMessage::Command(command.clone()));
        assert_eq!(second.recv().await.unwrap(), WireMessage::Command(command));
    }

    #[tokio::test]
    async fn test_close_ends_remote_subscriptions() {
        let (local, remote) = connectors();
        let mut inbound = remote.subscribe();

        local.close().await.unwrap();

        assert!(matches!(
            inbound.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while remote.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_can_reach_registered_remote_tree() {
        let (local, _remote) = connectors();
        local.add_remote_uri(KernelUri::parse("kernel://remote/").unwrap());

        assert!(local.can_reach(&KernelUri::parse("kernel://remote/csharp").unwrap()));
        assert!(!local.can_reach(&KernelUri::parse("kernel://other/csharp").unwrap()));
    }
}
