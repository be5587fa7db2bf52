//! Duplex connections the transport sends on, and the adapters that feed
//! their inbound messages into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::queue::Queue;

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Outbound half of a message-oriented duplex connection.
pub trait DuplexConnection: Send + Sync + 'static {
    /// Sends one opaque message. Fails once the connection is closed.
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), ConnectionError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Entry point for messages received on the connection.
#[derive(Debug, Clone)]
pub struct Inbound {
    received: Queue<Bytes>,
}

impl Inbound {
    pub(crate) fn new(received: Queue<Bytes>) -> Self {
        Self { received }
    }

    pub async fn deliver(&self, message: Bytes) {
        self.received.push(message).await;
    }

    /// No more messages will arrive; the receive loop ends once it has
    /// processed what is already queued.
    pub fn close(&self) {
        self.received.finish();
    }
}

/// In-process connection. Messages sent on one end come out of the
/// `MemoryReceiver` of the other.
#[derive(Debug)]
pub struct MemoryConnection {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

#[derive(Debug)]
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// One end of a `memory_pair`.
#[derive(Debug)]
pub struct MemoryLink {
    pub connection: Arc<MemoryConnection>,
    pub receiver: MemoryReceiver,
}

pub fn memory_pair() -> (MemoryLink, MemoryLink) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryLink {
            connection: Arc::new(MemoryConnection {
                tx: Mutex::new(Some(a_tx)),
            }),
            receiver: MemoryReceiver { rx: b_rx },
        },
        MemoryLink {
            connection: Arc::new(MemoryConnection {
                tx: Mutex::new(Some(b_tx)),
            }),
            receiver: MemoryReceiver { rx: a_rx },
        },
    )
}

impl DuplexConnection for MemoryConnection {
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), ConnectionError>> {
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        };
        futures::future::ready(sent).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.tx.lock().take();
        futures::future::ready(()).boxed()
    }
}

impl MemoryReceiver {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Forwards every message into `inbound`, closing it when the peer closes.
    pub fn attach(mut self, inbound: Inbound) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = self.rx.recv().await {
                inbound.deliver(message).await;
            }
            debug!("memory peer closed");
            inbound.close();
        })
    }
}

/// Length-prefixed framing over any async byte stream.
pub struct FramedConnection<S> {
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    closed: AtomicBool,
}

pub struct FramedReader<S> {
    reader: ReadHalf<S>,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> (Arc<Self>, FramedReader<S>) {
        let (reader, writer) = tokio::io::split(stream);
        (
            Arc::new(Self {
                writer: tokio::sync::Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
            }),
            FramedReader { reader },
        )
    }
}

impl<S> DuplexConnection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(ConnectionError::Closed);
            }
            if message.len() > MAX_FRAME_SIZE {
                return Err(ConnectionError::FrameTooLarge(message.len()));
            }

            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(ConnectionError::Closed)?;
            writer.write_u32(message.len() as u32).await?;
            writer.write_all(&message).await?;
            writer.flush().await?;
            trace!(len = message.len(), "frame sent");
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            self.closed.store(true, Ordering::Release);
            if let Some(mut writer) = self.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        }
        .boxed()
    }
}

impl<S> FramedReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Reads frames into `inbound` until EOF or a read error, then closes it.
    pub fn attach(self, inbound: Inbound) -> JoinHandle<Result<(), ConnectionError>> {
        tokio::spawn(async move {
            let result = self.read_frames(&inbound).await;
            inbound.close();
            result
        })
    }

    async fn read_frames(mut self, inbound: &Inbound) -> Result<(), ConnectionError> {
        loop {
            let len = match self.reader.read_u32().await {
                Ok(len) => len as usize,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("peer closed stream");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            if len > MAX_FRAME_SIZE {
                return Err(ConnectionError::FrameTooLarge(len));
            }

            let mut frame = vec![0u8; len];
            self.reader.read_exact(&mut frame).await?;
            trace!(len, "frame received");
            inbound.deliver(Bytes::from(frame)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_messages_arrive_whole_and_in_order() {
        let (a, b) = tokio::io::duplex(64);
        let (left, _left_reader) = FramedConnection::new(a);
        let (_right, right_reader) = FramedConnection::new(b);
        let received = Queue::new("framed");
        let reading = right_reader.attach(Inbound::new(received.clone()));

        left.send(Bytes::from_static(b"first")).await.unwrap();
        // Larger than the pipe buffer, so it goes across in pieces.
        left.send(Bytes::from(vec![7u8; 200])).await.unwrap();
        left.close().await;

        reading.await.unwrap().unwrap();
        assert_eq!(received.pop().await, Some(Bytes::from_static(b"first")));
        assert_eq!(received.pop().await.map(|frame| frame.len()), Some(200));
        assert!(received.is_finished());

        assert!(matches!(
            left.send(Bytes::from_static(b"late")).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut raw, b) = tokio::io::duplex(64);
        let (_conn, reader) = FramedConnection::new(b);
        let received: Queue<Bytes> = Queue::new("oversized");
        let reading = reader.attach(Inbound::new(received.clone()));

        raw.write_u32(u32::MAX).await.unwrap();
        assert!(matches!(
            reading.await.unwrap(),
            Err(ConnectionError::FrameTooLarge(_))
        ));
        assert!(received.is_finished());
    }

    #[tokio::test]
    async fn memory_link_closes_both_ways() {
        let (a, b) = memory_pair();
        a.connection.send(Bytes::from_static(b"hi")).await.unwrap();

        let received = Queue::new("memory");
        let forwarding = b.receiver.attach(Inbound::new(received.clone()));
        a.connection.close().await;
        forwarding.await.unwrap();

        assert_eq!(received.pop().await, Some(Bytes::from_static(b"hi")));
        assert!(received.is_finished());
        assert!(a.connection.send(Bytes::new()).await.is_err());
    }
}
