use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::network::codec::{encode_line, encode_packages, LineCodec, PackageCodec};
use crate::network::frame::Data;
use crate::network::send_executor::{OutboundSender, TransferListener};
use crate::{AppError, AppResult, Shutdown};

/// How bytes are framed on a connection's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// `[type][length][end][chunk]` packages
    Package,
    /// `\f` / `\n` delimited UTF-8 text
    Line,
}

/// A message waiting to be written to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Data(Data),
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Outbound::Text(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Outbound::Text(text.to_string())
    }
}

impl From<Data> for Outbound {
    fn from(data: Data) -> Self {
        Outbound::Data(data)
    }
}

/// The send side of one accepted socket.
///
/// The read half lives in the connection task as a [`FrameReader`]; this part
/// is shared through `Arc` with the registry, its writer task and every
/// request created on the connection. Sends go through `outbound`, the queue
/// only that writer drains.
pub struct Connection {
    index: u32,
    ip: String,
    wire: WireMode,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    outbound: OutboundSender,
    closed: AtomicBool,
    // set before the close broadcast goes out
    shut_down: AtomicBool,
    notify_close: broadcast::Sender<()>,
    write_timeout: Duration,
    transfer_listener: Arc<dyn TransferListener>,
}

impl Connection {
    pub fn new(
        index: u32,
        ip: String,
        wire: WireMode,
        writer: OwnedWriteHalf,
        outbound: OutboundSender,
        write_timeout: Duration,
        transfer_listener: Arc<dyn TransferListener>,
    ) -> Connection {
        let (notify_close, _) = broadcast::channel(1);
        Connection {
            index,
            ip,
            wire,
            writer: Mutex::new(Some(BufWriter::new(writer))),
            outbound,
            closed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            notify_close,
            write_timeout,
            transfer_listener,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn wire(&self) -> WireMode {
        self.wire
    }

    pub(crate) fn outbound(&self) -> &OutboundSender {
        &self.outbound
    }

    /// True once a close was requested, even if queued messages are still
    /// being flushed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses further sends. Returns false if the connection was already closing.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Fires once the socket has been shut down from the send side, including
    /// when that happened before this call.
    pub fn close_notified(&self) -> Shutdown {
        let mut notified = Shutdown::subscribe(&self.notify_close);
        if self.shut_down.load(Ordering::Acquire) {
            notified.fire();
        }
        notified
    }

    /// Encodes and writes one message, bounded by the write timeout.
    pub async fn write(&self, message: &Outbound) -> AppResult<usize> {
        let mut buffer = BytesMut::new();
        match (self.wire, message) {
            (WireMode::Package, Outbound::Data(data)) => encode_packages(data, &mut buffer),
            (WireMode::Package, Outbound::Text(text)) => {
                encode_packages(&Data::text(text.as_str()), &mut buffer)
            }
            (WireMode::Line, Outbound::Text(text)) => encode_line(text.as_bytes(), &mut buffer),
            (WireMode::Line, Outbound::Data(data)) => {
                encode_line(String::from_utf8_lossy(data.payload()).as_bytes(), &mut buffer)
            }
        }

        let transferred = match message {
            Outbound::Data(data) if self.wire == WireMode::Package => Some(data),
            _ => None,
        };
        if let Some(data) = transferred {
            self.transfer_listener.before_transfer(self.index, data);
        }

        let result = self.write_buffer(&buffer).await;

        if let Some(data) = transferred {
            self.transfer_listener
                .after_transfer(self.index, data, &result);
        }
        result.map_err(|e| {
            AppError::DetailedIoError(format!("write to connection {}: {e}", self.index))
        })
    }

    async fn write_buffer(&self, buffer: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(io::Error::new(ErrorKind::NotConnected, "connection closed"));
        };
        let write = async {
            writer.write_all(buffer).await?;
            writer.flush().await?;
            Ok(buffer.len())
        };
        match time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(ErrorKind::TimedOut, "write timed out")),
        }
    }

    /// Shuts down the write half and wakes the connection task.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.mark_closed();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // the peer may already be gone
            if let Err(e) = time::timeout(self.write_timeout, writer.shutdown()).await {
                debug!("connection {} shutdown timed out: {e}", self.index);
            }
            trace!("connection {} write half closed", self.index);
        }
        self.shut_down.store(true, Ordering::Release);
        let _ = self.notify_close.send(());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("ip", &self.ip)
            .field("wire", &self.wire)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One unit decoded from the read half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// `[type:2][payload]`, not yet checked against the known types
    Frame(Bytes),
    Line(String),
}

#[derive(Debug)]
enum InboundCodec {
    Package(PackageCodec),
    Line(LineCodec),
}

/// The read half of a connection plus its decode buffer.
#[derive(Debug)]
pub struct FrameReader {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    codec: InboundCodec,
}

impl FrameReader {
    pub fn new(reader: OwnedReadHalf, wire: WireMode, max_frame_size: usize) -> FrameReader {
        let codec = match wire {
            WireMode::Package => InboundCodec::Package(PackageCodec::with_max_frame_size(
                max_frame_size,
            )),
            WireMode::Line => InboundCodec::Line(LineCodec::with_max_length(max_frame_size)),
        };
        FrameReader {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            codec,
        }
    }

    fn parse(&mut self) -> AppResult<Option<Inbound>> {
        match &mut self.codec {
            InboundCodec::Package(codec) => {
                Ok(codec.decode(&mut self.buffer)?.map(Inbound::Frame))
            }
            InboundCodec::Line(codec) => Ok(codec.decode(&mut self.buffer)?.map(Inbound::Line)),
        }
    }

    /// Reads the next complete unit.
    ///
    /// `None` means the peer closed the connection cleanly. A close in the
    /// middle of a unit is reported as a reset. Cancel safe: partial input
    /// stays buffered for the next call.
    pub async fn read_unit(&mut self) -> AppResult<Option<Inbound>> {
        loop {
            if let Some(unit) = self.parse()? {
                return Ok(Some(unit));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::network::send_executor::{outbound_queue, NoopTransferListener};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn connection(writer: OwnedWriteHalf, wire: WireMode) -> Connection {
        Connection::new(
            0,
            "127.0.0.1".to_string(),
            wire,
            writer,
            outbound_queue().0,
            Duration::from_secs(1),
            Arc::new(NoopTransferListener),
        )
    }

    #[tokio::test]
    async fn test_close_before_subscribe_still_notifies() {
        let (server, _client) = socket_pair().await;
        let (_reader, writer) = server.into_split();
        let connection = connection(writer, WireMode::Line);

        connection.close().await;
        assert!(connection.is_closed());
        let mut notified = connection.close_notified();
        assert!(notified.is_shutdown());
        notified.recv().await;

        let err = connection.write(&Outbound::from("late")).await.unwrap_err();
        assert!(matches!(err, AppError::DetailedIoError(_)));
    }

    #[tokio::test]
    async fn test_text_on_package_wire_becomes_text_frame() {
        let (server, client) = socket_pair().await;
        let (_reader, writer) = server.into_split();
        let connection = connection(writer, WireMode::Package);
        let written = connection.write(&Outbound::from("hi")).await.unwrap();
        assert_eq!(written, 5 + 2);

        let (client_reader, _client_writer) = client.into_split();
        let mut reader = FrameReader::new(client_reader, WireMode::Package, usize::MAX);
        let Some(Inbound::Frame(frame)) = reader.read_unit().await.unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(Data::decode(&frame).unwrap(), Data::text("hi"));
    }

    #[tokio::test]
    async fn test_reader_eof_mid_line_is_reset() {
        let (server, mut client) = socket_pair().await;
        let (reader, _writer) = server.into_split();
        let mut reader = FrameReader::new(reader, WireMode::Line, 1024);

        client.write_all(b"one\nhalf").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        assert_eq!(
            reader.read_unit().await.unwrap(),
            Some(Inbound::Line("one".to_string()))
        );
        let err = reader.read_unit().await.unwrap_err();
        assert!(matches!(err, AppError::IoError(ref e) if e.kind() == ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_reader_clean_eof() {
        let (server, client) = socket_pair().await;
        let (reader, _writer) = server.into_split();
        let mut reader = FrameReader::new(reader, WireMode::Line, 1024);
        drop(client);
        assert_eq!(reader.read_unit().await.unwrap(), None);
    }
}
