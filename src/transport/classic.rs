//! Bluetooth Classic transport.
//!
//! The platform supplies an RFCOMM-style byte stream; frames travel over it
//! unchanged. A reader task turns the read half into [`LinkEvent`]s and the
//! write half becomes the handler's [`MessageSink`].
//!
//! # Example
//!
//! ```ignore
//! use pebblewire::transport::{ClassicConnector, TransportConnector};
//!
//! let mut connector = ClassicConnector::new(platform);
//! connector.connect().await?;
//! let streams = connector.negotiate().await?;
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    DisconnectNotifier, DisconnectSignal, LinkEvent, LinkStreams, MessageSink, TransportConnector,
    TransportKind,
};
use crate::config::DEFAULT_READ_CHUNK_SIZE;
use crate::error::{DisconnectReason, PebblewireError, Result};

/// Inbound events buffered between the reader task and the handler.
const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Host-provided access to a Classic socket.
#[async_trait]
pub trait ClassicPlatform: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open the socket to the watch.
    async fn open(&self) -> std::io::Result<Self::Stream>;
}

/// Connector for a Bluetooth Classic watch.
pub struct ClassicConnector<P: ClassicPlatform> {
    platform: P,
    stream: Option<P::Stream>,
    reader_task: Option<JoinHandle<()>>,
    notifier: DisconnectNotifier,
    read_chunk_size: usize,
}

impl<P: ClassicPlatform> ClassicConnector<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            stream: None,
            reader_task: None,
            notifier: DisconnectNotifier::new(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }

    /// Bytes requested per socket read.
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    fn fail(&self, reason: DisconnectReason) -> PebblewireError {
        self.notifier.notify(reason.clone());
        PebblewireError::TransportFailure(reason)
    }
}

#[async_trait]
impl<P: ClassicPlatform> TransportConnector for ClassicConnector<P> {
    fn kind(&self) -> TransportKind {
        TransportKind::Classic
    }

    async fn connect(&mut self) -> Result<()> {
        tracing::debug!("opening classic socket");
        match self.platform.open().await {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("classic connect failed: {}", e);
                Err(self.fail(DisconnectReason::ClassicConnectionFailed(e.to_string())))
            }
        }
    }

    async fn negotiate(&mut self) -> Result<LinkStreams> {
        let stream = match self.stream.take() {
            Some(s) => s,
            None => {
                return Err(self.fail(DisconnectReason::ClassicConnectionFailed(
                    "negotiate called before connect".to_string(),
                )))
            }
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        self.reader_task = Some(tokio::spawn(read_loop(
            read_half,
            tx,
            self.notifier.clone(),
            self.read_chunk_size,
        )));

        Ok(LinkStreams {
            inbound: rx,
            outbound: Box::new(StreamSink { writer: write_half }),
        })
    }

    async fn disconnect(&mut self) {
        if self.notifier.notify(DisconnectReason::LocalDisconnect) {
            tracing::debug!("classic link disconnected locally");
        }
        self.stream = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }

    fn disconnected(&self) -> DisconnectSignal {
        self.notifier.signal()
    }
}

impl<P: ClassicPlatform> Drop for ClassicConnector<P> {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Pump socket reads into link events until EOF or error.
async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    tx: mpsc::Sender<LinkEvent>,
    notifier: DisconnectNotifier,
    chunk_size: usize,
) where
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break DisconnectReason::RemoteClosed,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(LinkEvent::Data(chunk)).await.is_err() {
                    // Handler is gone; nothing left to deliver to.
                    break DisconnectReason::LocalDisconnect;
                }
            }
            Err(e) => break DisconnectReason::TransportError(e.to_string()),
        }
    };
    tracing::debug!("classic read loop ended: {}", reason);
    notifier.notify(reason.clone());
    let _ = tx.send(LinkEvent::Closed(reason)).await;
}

/// Write half of the socket as a frame sink.
struct StreamSink<W> {
    writer: W,
}

#[async_trait]
impl<W> MessageSink for StreamSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let write = async {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await
        };
        write.await.map_err(|e| {
            PebblewireError::TransportFailure(DisconnectReason::TransportError(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    struct DuplexPlatform {
        stream: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl ClassicPlatform for DuplexPlatform {
        type Stream = DuplexStream;

        async fn open(&self) -> std::io::Result<DuplexStream> {
            self.stream.lock().unwrap().take().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "no watch in range")
            })
        }
    }

    fn connector() -> (ClassicConnector<DuplexPlatform>, DuplexStream) {
        let (phone, watch) = duplex(1024);
        let platform = DuplexPlatform {
            stream: Mutex::new(Some(phone)),
        };
        (ClassicConnector::new(platform), watch)
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut connector, mut watch) = connector();
        connector.connect().await.unwrap();
        let mut streams = connector.negotiate().await.unwrap();

        streams
            .outbound
            .send(Bytes::from_static(b"\x00\x01\x07\xd1\x00"))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        watch.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x01\x07\xd1\x00");

        watch.write_all(b"hi").await.unwrap();
        assert_eq!(
            streams.inbound.recv().await,
            Some(LinkEvent::Data(Bytes::from_static(b"hi")))
        );
    }

    #[tokio::test]
    async fn test_remote_close_is_reported() {
        let (mut connector, watch) = connector();
        let mut signal = connector.disconnected();
        connector.connect().await.unwrap();
        let mut streams = connector.negotiate().await.unwrap();

        drop(watch);

        assert_eq!(
            streams.inbound.recv().await,
            Some(LinkEvent::Closed(DisconnectReason::RemoteClosed))
        );
        assert_eq!(signal.wait().await, DisconnectReason::RemoteClosed);
    }

    #[tokio::test]
    async fn test_open_failure_is_classic_connection_failed() {
        let platform = DuplexPlatform {
            stream: Mutex::new(None),
        };
        let mut connector = ClassicConnector::new(platform);
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(
            err,
            PebblewireError::TransportFailure(DisconnectReason::ClassicConnectionFailed(_))
        ));
        assert!(matches!(
            connector.disconnected().current(),
            Some(DisconnectReason::ClassicConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_local_disconnect_reason_sticks() {
        let (mut connector, _watch) = connector();
        connector.connect().await.unwrap();
        let _streams = connector.negotiate().await.unwrap();

        connector.disconnect().await;
        connector.disconnect().await;
        assert_eq!(
            connector.disconnected().current(),
            Some(DisconnectReason::LocalDisconnect)
        );
    }
}
