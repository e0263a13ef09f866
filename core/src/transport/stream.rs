//! Line-delimited JSON transport over byte streams
//!
//! Each message is one JSON envelope followed by `\n`. Works over any
//! `AsyncRead`/`AsyncWrite` pair: stdio of a child process, a socket, or a
//! `tokio::io::duplex` pipe in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;

use crate::contract::{
    DeliveryGuarantee, OrderingGuarantee, TransportCapabilities, TransportEndpoint,
    TransportError, TransportReceiver, TransportSender, WireCodec, WireMessage,
};

pub struct StreamSender<W> {
    writer: Mutex<W>,
    codec: Arc<WireCodec>,
}

pub struct StreamReceiver<R> {
    lines: Lines<BufReader<R>>,
    codec: Arc<WireCodec>,
}

/// Endpoint reading messages from `reader` and writing them to `writer`
pub fn endpoint<R, W>(reader: R, writer: W, codec: Arc<WireCodec>) -> TransportEndpoint
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    TransportEndpoint::new(
        Box::new(StreamSender {
            writer: Mutex::new(writer),
            codec: Arc::clone(&codec),
        }),
        Box::new(StreamReceiver {
            lines: BufReader::new(reader).lines(),
            codec,
        }),
    )
}

/// Endpoint over this process's stdin and stdout
pub fn stdio(codec: Arc<WireCodec>) -> TransportEndpoint {
    endpoint(tokio::io::stdin(), tokio::io::stdout(), codec)
}

fn send_failed(error: std::io::Error) -> TransportError {
    if matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    ) {
        TransportError::Disconnected {
            reason: error.to_string(),
        }
    } else {
        TransportError::SendFailed {
            error: error.to_string(),
        }
    }
}

#[async_trait]
impl<W> TransportSender for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: &WireMessage) -> Result<(), TransportError> {
        let mut line = self
            .codec
            .encode(message)
            .map_err(|error| TransportError::Serialization {
                error: error.to_string(),
            })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await.map_err(send_failed)?;
        writer.flush().await.map_err(send_failed)
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.writer.lock().await.flush().await.map_err(send_failed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer.lock().await.shutdown().await.map_err(send_failed)
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            delivery_guarantee: DeliveryGuarantee::ExactlyOnce,
            ordering_guarantee: OrderingGuarantee::Fifo,
        }
    }
}

#[async_trait]
impl<R> TransportReceiver for StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn next_batch(&mut self) -> Result<Vec<WireMessage>, TransportError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|error| TransportError::ReceiveFailed {
                    error: error.to_string(),
                })?;
            let Some(line) = line else {
                return Ok(Vec::new());
            };
            if line.trim().is_empty() {
                continue;
            }
            return self
                .codec
                .decode(&line)
                .map(|message| vec![message])
                .map_err(|error| TransportError::Serialization {
                    error: error.to_string(),
                });
        }
    }
}
