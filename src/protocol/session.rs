use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::packet::{HEADER_SIZE, Header, Packet, PacketType, Payload};
use crate::error::ProtocolError;

/// Default time a single frame may take to arrive or leave
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One framed connection
///
/// Sending and receiving take `&self`, so a session can be shared between the
/// task handling it and the shutdown notifier. The writer is dropped on the
/// first failure or on close; afterwards every send reports
/// [`ProtocolError::Closed`] without touching the stream.
pub struct Session {
    id: u64,
    reader: Mutex<Reader>,
    writer: Mutex<Option<Writer>>,
    open: AtomicBool,
    io_timeout: Duration,
}

impl Session {
    pub fn new<S>(stream: S, io_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Some(Box::new(writer))),
            open: AtomicBool::new(true),
            io_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub async fn send_init(&self, payload: impl Into<Payload>) -> Result<(), ProtocolError> {
        self.send(&Packet::new(PacketType::Init, payload)).await
    }

    pub async fn send_debug(&self, payload: impl Into<Payload>) -> Result<(), ProtocolError> {
        self.send(&Packet::new(PacketType::Debug, payload)).await
    }

    pub async fn send_data(&self, payload: impl Into<Payload>) -> Result<(), ProtocolError> {
        self.send(&Packet::new(PacketType::Data, payload)).await
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), ProtocolError> {
        let frame = packet.encode()?;
        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, &frame).await
    }

    /// Send a final packet and close, without letting another sender in between
    ///
    /// Returns [`ProtocolError::Closed`] if the session was already closed, in
    /// which case nothing is written. A packet too large to encode leaves the
    /// session open so a smaller final packet can still be sent.
    pub async fn finish(&self, packet: &Packet) -> Result<(), ProtocolError> {
        let frame = packet.encode()?;
        let mut writer = self.writer.lock().await;
        let result = self.write_locked(&mut writer, &frame).await;
        Self::shutdown_locked(&mut writer).await;
        self.open.store(false, Ordering::Release);
        result
    }

    /// Idempotent
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        Self::shutdown_locked(&mut writer).await;
        self.open.store(false, Ordering::Release);
    }

    async fn write_locked(
        &self,
        writer: &mut Option<Writer>,
        frame: &[u8],
    ) -> Result<(), ProtocolError> {
        let Some(stream) = writer.as_mut() else {
            return Err(ProtocolError::Closed);
        };

        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };

        let result = match tokio::time::timeout(self.io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::Io(e)),
            Err(_) => Err(ProtocolError::Timeout(self.io_timeout)),
        };

        if result.is_err() {
            log::debug!("Session {} write failed, closing", self.id);
            *writer = None;
            self.open.store(false, Ordering::Release);
        }
        result
    }

    async fn shutdown_locked(writer: &mut Option<Writer>) {
        if let Some(mut stream) = writer.take() {
            let _ = stream.shutdown().await;
        }
    }

    /// Receive one packet
    ///
    /// `Ok(None)` means the peer closed the connection cleanly before sending
    /// a header byte, or the session is already closed. EOF inside a frame is
    /// [`ProtocolError::ShortRead`].
    pub async fn try_receive(&self) -> Result<Option<Packet>, ProtocolError> {
        if !self.is_open() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        let result = match tokio::time::timeout(self.io_timeout, read_frame(&mut reader)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(self.io_timeout)),
        };

        match &result {
            Ok(None)
            | Err(ProtocolError::Io(_))
            | Err(ProtocolError::ShortRead { .. })
            | Err(ProtocolError::Timeout(_))
            | Err(ProtocolError::InvalidHeader(_)) => {
                self.open.store(false, Ordering::Release);
            }
            _ => {}
        }
        result
    }

    /// Like [`Session::try_receive`], but every failure reads as a `NONE` packet
    pub async fn receive(&self) -> Packet {
        match self.try_receive().await {
            Ok(Some(packet)) => packet,
            Ok(None) => Packet::none(),
            Err(e) => {
                log::warn!("Session {} receive failed: {e}", self.id);
                Packet::none()
            }
        }
    }

    /// Receive a packet of the given type and return its payload
    pub async fn expect(&self, expected: PacketType) -> Result<Payload, ProtocolError> {
        match self.try_receive().await? {
            Some(packet) if packet.packet_type == expected => Ok(packet.payload),
            Some(packet) => Err(ProtocolError::UnexpectedPacket {
                expected: expected.name(),
                got: packet.packet_type.name(),
            }),
            None => Err(ProtocolError::Closed),
        }
    }
}

async fn read_frame(reader: &mut Reader) -> Result<Option<Packet>, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    let received = read_full(reader, &mut header).await?;
    if received == 0 {
        return Ok(None);
    }
    if received < HEADER_SIZE {
        return Err(ProtocolError::ShortRead {
            received,
            expected: HEADER_SIZE,
        });
    }

    let header = Header::decode(&header)?;
    let mut payload = vec![0u8; header.size];
    let received = read_full(reader, &mut payload).await?;
    if received < header.size {
        return Err(ProtocolError::ShortRead {
            received,
            expected: header.size,
        });
    }

    Ok(Some(Packet {
        packet_type: header.packet_type,
        payload: Payload::decode(header.payload_type, payload)?,
    }))
}

/// Fill `buf` until it is full or the stream ends; returns the bytes read
async fn read_full(reader: &mut Reader, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
