use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CloseCode;

/// Length-prefixed framing for raw message bytes, independent of any
/// particular envelope type. The socket abstraction carries opaque
/// payloads; it's the caller's job to decode them into a `ClientEnvelope`
/// or `ServerEnvelope` via `battleship_engine_protocol::codec`.
#[derive(Debug, Default)]
struct RawFrameCodec;

const HEADER_LEN: usize = 2;

impl Decoder for RawFrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, std::io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for RawFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        dst.reserve(HEADER_LEN + item.len());
        dst.extend_from_slice(&(item.len() as u16).to_be_bytes());
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Transport contract the engine is built against: accept happens before
/// a [`Socket`] exists, everything else (close, send, receive) is here.
/// `recv` yields one complete message per call and returns `None` once the
/// peer has closed the connection, standing in for the spec's
/// `recv_bytes_iter`.
#[async_trait]
pub trait Socket: Send + Sync {
    async fn send(&self, bytes: Bytes) -> std::io::Result<()>;
    async fn recv(&self) -> Option<Bytes>;
    async fn close(&self, code: CloseCode, reason: &str);
    fn is_open(&self) -> bool;
}

/// In-memory duplex pipe implementing [`Socket`], for the engine's own
/// test harness. Two instances, each constructed with the other's sender
/// half, behave like the two ends of a real connection without any
/// network I/O.
pub struct FakeSocket {
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    open: std::sync::atomic::AtomicBool,
}

impl FakeSocket {
    /// Builds a connected pair: messages sent on one side arrive via
    /// `recv` on the other.
    pub fn pair(capacity: usize) -> (FakeSocket, FakeSocket) {
        let (tx_a, rx_a) = mpsc::channel(capacity);
        let (tx_b, rx_b) = mpsc::channel(capacity);
        (
            FakeSocket {
                outbound: tx_b,
                inbound: Mutex::new(rx_a),
                open: std::sync::atomic::AtomicBool::new(true),
            },
            FakeSocket {
                outbound: tx_a,
                inbound: Mutex::new(rx_b),
                open: std::sync::atomic::AtomicBool::new(true),
            },
        )
    }
}

#[async_trait]
impl Socket for FakeSocket {
    async fn send(&self, bytes: Bytes) -> std::io::Result<()> {
        if !self.is_open() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "socket closed",
            ));
        }
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
    }

    async fn recv(&self) -> Option<Bytes> {
        if !self.is_open() {
            return None;
        }
        self.inbound.lock().await.recv().await
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        if !self.open.swap(false, std::sync::atomic::Ordering::SeqCst) {
            log::debug!("double-close suppressed ({code:?}: {reason})");
            return;
        }
        log::debug!("fake socket closed: {code:?} {reason}");
    }

    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// QUIC-backed implementation over a single bidirectional stream pair
/// accepted from a `quinn::Connection`.
pub mod quic {
    use super::*;
    use futures::StreamExt;
    use quinn::{RecvStream, SendStream};
    use tokio_util::codec::{FramedRead, FramedWrite};

    pub struct QuicSocket {
        writer: Mutex<FramedWrite<SendStream, RawFrameCodec>>,
        reader: Mutex<FramedRead<RecvStream, RawFrameCodec>>,
        open: std::sync::atomic::AtomicBool,
    }

    impl QuicSocket {
        pub fn new(send: SendStream, recv: RecvStream) -> Self {
            QuicSocket {
                writer: Mutex::new(FramedWrite::new(send, RawFrameCodec)),
                reader: Mutex::new(FramedRead::new(recv, RawFrameCodec)),
                open: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Socket for QuicSocket {
        async fn send(&self, bytes: Bytes) -> std::io::Result<()> {
            use futures::SinkExt;
            self.writer.lock().await.send(bytes).await
        }

        async fn recv(&self) -> Option<Bytes> {
            if !self.is_open() {
                return None;
            }
            match self.reader.lock().await.next().await {
                Some(Ok(bytes)) => Some(bytes),
                Some(Err(e)) => {
                    log::warn!("frame read error, treating as closed: {e}");
                    None
                }
                None => None,
            }
        }

        async fn close(&self, code: CloseCode, reason: &str) {
            if !self.open.swap(false, std::sync::atomic::Ordering::SeqCst) {
                log::debug!("double-close suppressed ({code:?}: {reason})");
                return;
            }
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.get_mut().finish().await {
                log::debug!("stream finish on close failed (already gone?): {e}");
            }
        }

        fn is_open(&self) -> bool {
            self.open.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}
