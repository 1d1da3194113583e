use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_serial::SerialStream;

use crate::error::{Error, Result};
use crate::trace::{TraceBuffer, TraceDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Serial,
}

enum ConnWriter {
    Tcp(OwnedWriteHalf),
    Udp { socket: Arc<UdpSocket>, peer: SocketAddr },
    Serial(WriteHalf<SerialStream>),
}

enum ConnReader {
    Tcp(OwnedReadHalf),
    /// Datagrams routed here by the manager's demux loop.
    Udp(mpsc::Receiver<Bytes>),
    Serial(ReadHalf<SerialStream>),
}

/// One byte-oriented duplex channel to a peer. Single-writer (the writer
/// mutex serializes outbound frames) and single-reader (one pump task owns
/// `receive`).
pub struct Connection {
    name: String,
    kind: TransportKind,
    on_master: bool,
    peer: Option<SocketAddr>,
    writer: Mutex<ConnWriter>,
    reader: Mutex<ConnReader>,
    closed: AtomicBool,
    trace: Arc<TraceBuffer>,
}

impl Connection {
    pub fn tcp(
        name: impl Into<String>,
        stream: TcpStream,
        on_master: bool,
        trace_capacity: usize,
    ) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Arc::new(Self {
            name: name.into(),
            kind: TransportKind::Tcp,
            on_master,
            peer,
            writer: Mutex::new(ConnWriter::Tcp(write_half)),
            reader: Mutex::new(ConnReader::Tcp(read_half)),
            closed: AtomicBool::new(false),
            trace: Arc::new(TraceBuffer::new(trace_capacity)),
        })
    }

    pub fn udp(
        name: impl Into<String>,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbound: mpsc::Receiver<Bytes>,
        on_master: bool,
        trace_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: TransportKind::Udp,
            on_master,
            peer: Some(peer),
            writer: Mutex::new(ConnWriter::Udp { socket, peer }),
            reader: Mutex::new(ConnReader::Udp(inbound)),
            closed: AtomicBool::new(false),
            trace: Arc::new(TraceBuffer::new(trace_capacity)),
        })
    }

    pub fn serial(
        name: impl Into<String>,
        stream: SerialStream,
        on_master: bool,
        trace_capacity: usize,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        Arc::new(Self {
            name: name.into(),
            kind: TransportKind::Serial,
            on_master,
            peer: None,
            writer: Mutex::new(ConnWriter::Serial(write_half)),
            reader: Mutex::new(ConnReader::Serial(read_half)),
            closed: AtomicBool::new(false),
            trace: Arc::new(TraceBuffer::new(trace_capacity)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_on_master(&self) -> bool {
        self.on_master
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn trace(&self) -> &Arc<TraceBuffer> {
        &self.trace
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedChannel);
        }
        let mut writer = self.writer.lock().await;
        match &mut *writer {
            ConnWriter::Tcp(half) => {
                half.write_all(bytes).await?;
                half.flush().await?;
            }
            ConnWriter::Udp { socket, peer } => {
                // One TPDU per datagram.
                socket.send_to(bytes, *peer).await?;
            }
            ConnWriter::Serial(half) => {
                half.write_all(bytes).await?;
                half.flush().await?;
            }
        }
        self.trace.record(TraceDirection::Tx, bytes);
        Ok(())
    }

    /// Append available bytes to `buf`. Returns `ClosedChannel` on EOF or
    /// after `close`.
    pub async fn receive(&self, buf: &mut BytesMut) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ClosedChannel);
        }
        let mut reader = self.reader.lock().await;
        let read = match &mut *reader {
            ConnReader::Tcp(half) => half.read_buf(buf).await?,
            ConnReader::Udp(rx) => match rx.recv().await {
                Some(datagram) => {
                    buf.extend_from_slice(&datagram);
                    datagram.len()
                }
                None => 0,
            },
            ConnReader::Serial(half) => half.read_buf(buf).await?,
        };
        if read == 0 {
            return Err(Error::ClosedChannel);
        }
        let start = buf.len() - read;
        self.trace.record(TraceDirection::Rx, &buf[start..]);
        Ok(read)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        match &mut *writer {
            ConnWriter::Tcp(half) => {
                let _ = half.shutdown().await;
            }
            ConnWriter::Serial(half) => {
                let _ = half.shutdown().await;
            }
            ConnWriter::Udp { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = Connection::tcp("test", stream, true, 16);
        conn.trace().enable();
        conn.send(b"ping").await.unwrap();

        let mut buf = BytesMut::new();
        let n = conn.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(conn.trace().snapshot().len(), 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_connection_rejects_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = Connection::tcp("test", stream, true, 16);
        conn.close().await;
        assert!(matches!(
            conn.send(b"x").await,
            Err(Error::ClosedChannel)
        ));
        let mut buf = BytesMut::new();
        assert!(matches!(
            conn.receive(&mut buf).await,
            Err(Error::ClosedChannel)
        ));
    }

    #[tokio::test]
    async fn udp_connection_routes_datagrams() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(4);
        let conn = Connection::udp("udp-test", socket, peer_addr, rx, false, 16);

        conn.send(b"out").await.unwrap();
        let mut recv_buf = [0u8; 8];
        let (n, _) = peer_socket.recv_from(&mut recv_buf).await.unwrap();
        assert_eq!(&recv_buf[..n], b"out");

        tx.send(Bytes::from_static(b"in")).await.unwrap();
        drop(tx);
        let mut buf = BytesMut::new();
        conn.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"in");
        assert!(matches!(
            conn.receive(&mut buf).await,
            Err(Error::ClosedChannel)
        ));
    }
}
