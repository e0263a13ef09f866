//! In-memory transport
//!
//! For kernel trees living in one process. Messages are encoded to their
//! wire form and passed over bounded mpsc channels, so both ends exercise
//! the same codec path as an out-of-process connection.
//! Preserves FIFO ordering per direction.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::contract::{
    DeliveryGuarantee, OrderingGuarantee, TransportCapabilities, TransportConfig,
    TransportEndpoint, TransportError, TransportReceiver, TransportSender, WireCodec, WireMessage,
};

/// Sending half of an in-memory connection
pub struct InMemorySender {
    /// Taken on close
    tx: Mutex<Option<mpsc::Sender<String>>>,
    codec: Arc<WireCodec>,
}

/// Receiving half of an in-memory connection
pub struct InMemoryReceiver {
    rx: mpsc::Receiver<String>,
    codec: Arc<WireCodec>,
    /// Raw messages received but not yet decoded
    pending: VecDeque<String>,
    batch_size: usize,
    closed: bool,
}

/// Create two endpoints wired to each other
///
/// # Example
/// ```rust,ignore
/// let codec = Arc::new(WireCodec::new());
/// let (local, remote) = connected_pair(&TransportConfig::default(), codec);
/// ```
pub fn connected_pair(config: &TransportConfig, codec: Arc<WireCodec>) -> (TransportEndpoint, TransportEndpoint) {
    let buffer_size = config.buffer_size.max(1);
    let (tx1, rx1) = mpsc::channel(buffer_size);
    let (tx2, rx2) = mpsc::channel(buffer_size);

    let first = endpoint(tx2, rx1, config, Arc::clone(&codec));
    let second = endpoint(tx1, rx2, config, codec);
    (first, second)
}

fn endpoint(
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
    config: &TransportConfig,
    codec: Arc<WireCodec>,
) -> TransportEndpoint {
    TransportEndpoint::new(
        Box::new(InMemorySender {
            tx: Mutex::new(Some(tx)),
            codec: Arc::clone(&codec),
        }),
        Box::new(InMemoryReceiver {
            rx,
            codec,
            pending: VecDeque::new(),
            batch_size: config.batch_size.max(1),
            closed: false,
        }),
    )
}

impl InMemorySender {
    async fn send_raw(&self, raw: String) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(TransportError::Disconnected {
                reason: "Transport closed".to_string(),
            });
        };
        tx.send(raw).await.map_err(|_| TransportError::Disconnected {
            reason: "Receiver dropped".to_string(),
        })
    }
}

#[async_trait]
impl TransportSender for InMemorySender {
    async fn send(&self, message: &WireMessage) -> Result<(), TransportError> {
        let raw = self
            .codec
            .encode(message)
            .map_err(|error| TransportError::Serialization {
                error: error.to_string(),
            })?;
        self.send_raw(raw).await
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // dropping the sender closes the peer's receiver
        self.tx.lock().take();
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            delivery_guarantee: DeliveryGuarantee::ExactlyOnce,
            ordering_guarantee: OrderingGuarantee::Fifo,
        }
    }
}

#[async_trait]
impl TransportReceiver for InMemoryReceiver {
    async fn next_batch(&mut self) -> Result<Vec<WireMessage>, TransportError> {
        if self.pending.is_empty() {
            if self.closed {
                return Ok(Vec::new());
            }
            match self.rx.recv().await {
                Some(raw) => self.pending.push_back(raw),
                None => {
                    self.closed = true;
                    return Ok(Vec::new());
                }
            }
            while self.pending.len() < self.batch_size {
                match self.rx.try_recv() {
                    Ok(raw) => self.pending.push_back(raw),
                    Err(_) => break,
                }
            }
        }

        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            let Some(raw) = self.pending.pop_front() else {
                break;
            };
            match self.codec.decode(&raw) {
                Ok(message) => batch.push(message),
                Err(error) if batch.is_empty() => {
                    return Err(TransportError::Serialization {
                        error: error.to_string(),
                    });
                }
                Err(_) => {
                    // deliver what decoded; the bad message errors next call
                    self.pending.push_front(raw);
                    break;
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::KernelCommand;

    fn pair(batch_size: usize) -> (TransportEndpoint, TransportEndpoint) {
        let config = TransportConfig {
            batch_size,
            ..TransportConfig::default()
        };
        connected_pair(&config, Arc::new(WireCodec::new()))
    }

    #[tokio::test]
    async fn test_basic_send_receive() {
        let (local, mut remote) = pair(100);
        let command = KernelCommand::submit_code("1 + 1").with_target("csharp");

        local
            .sender
            .send(&WireMessage::Command(command.clone()))
            .await
            .unwrap();

        let batch = remote.receiver.next_batch().await.unwrap();
        assert_eq!(batch, vec![WireMessage::Command(command)]);
    }

    #[tokio::test]
    async fn test_batching_and_fifo_ordering() {
        let (local, mut remote) = pair(3);
        let commands: Vec<KernelCommand> = (0..5)
            .map(|i| KernelCommand::submit_code(format!("msg{i}")))
            .collect();
        for command in &commands {
            local
                .sender
                .send(&WireMessage::Command(command.clone()))
                .await
                .unwrap();
        }

        let first = remote.receiver.next_batch().await.unwrap();
        let second = remote.receiver.next_batch().await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);

        let received: Vec<String> = first
            .iter()
            .chain(second.iter())
            .map(|message| match message {
                WireMessage::Command(command) => command.code().unwrap_or_default().to_string(),
                WireMessage::Event(_) => String::new(),
            })
            .collect();
        assert_eq!(received, vec!["msg0", "msg1", "msg2", "msg3", "msg4"]);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_reported_and_skipped() {
        let codec = Arc::new(WireCodec::new());
        let (tx, rx) = mpsc::channel(10);
        let sender = InMemorySender {
            tx: Mutex::new(Some(tx)),
            codec: Arc::clone(&codec),
        };
        let mut receiver = InMemoryReceiver {
            rx,
            codec,
            pending: VecDeque::new(),
            batch_size: 10,
            closed: false,
        };

        let good = KernelCommand::submit_code("ok");
        sender.send_raw("{\"not\":\"an envelope\"}".to_string()).await.unwrap();
        sender.send(&WireMessage::Command(good.clone())).await.unwrap();

        assert!(matches!(
            receiver.next_batch().await,
            Err(TransportError::Serialization { .. })
        ));
        assert_eq!(receiver.next_batch().await.unwrap(), vec![WireMessage::Command(good)]);
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (local, mut remote) = pair(100);
        local.sender.close().await.unwrap();

        assert!(remote.receiver.next_batch().await.unwrap().is_empty());
        assert!(local
            .sender
            .send(&WireMessage::Command(KernelCommand::request_kernel_info()))
            .await
            .is_err());
    }
}
