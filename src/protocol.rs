//! Peer Protocol
//!
//! Wire messages of the trlog synchronization protocol and their framing.
//! Each message maps 1:1 to a peer-to-peer bus event.
//!
//! Frame format: `[length: u32][checksum: u32][flags: u8][body]`, little
//! endian, checksum over the body as sent. The body is a bincode message,
//! LZ4-compressed when it is larger than [`COMPRESS_THRESHOLD`].

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Event, TrlogData, TrlogState, TrlogSync};
use crate::trlog::{Position, TrLogEntry};

/// Bodies above this size are compressed
pub const COMPRESS_THRESHOLD: usize = 4096;

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Body is LZ4-compressed
const FLAG_COMPRESSED: u8 = 0x01;

/// Peer-to-peer messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// `p2p_trlog_sync`: request for the receiver's top position
    TrlogSync { trlog: Uuid, from: Uuid, to: Uuid },

    /// `p2p_trlog_state`: the sender's top position
    TrlogState {
        trlog: Uuid,
        from: Uuid,
        to: Uuid,
        top: Position,
    },

    /// `p2p_trlog_data`: one transfer batch
    TrlogData {
        trlog: Uuid,
        from: Uuid,
        to: Uuid,
        count: u64,
        entries: Vec<TrLogEntry>,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize and validate message bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let message: Message = bincode::deserialize(bytes)
            .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::TrlogSync { .. } => "p2p_trlog_sync",
            Message::TrlogState { .. } => "p2p_trlog_state",
            Message::TrlogData { .. } => "p2p_trlog_data",
        }
    }

    /// Destination node
    pub fn to(&self) -> Uuid {
        match self {
            Message::TrlogSync { to, .. }
            | Message::TrlogState { to, .. }
            | Message::TrlogData { to, .. } => *to,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Message::TrlogData { count, entries, .. } = self {
            if *count != entries.len() as u64 {
                return Err(Error::Protocol(format!(
                    "data message announces {} entries, carries {}",
                    count,
                    entries.len()
                )));
            }
            if entries.windows(2).any(|w| w[0].pos >= w[1].pos) {
                return Err(Error::Protocol("data message entries out of order".into()));
            }
        }
        Ok(())
    }

    /// Wire message for a peer-to-peer event, `None` for local events
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::TrlogSync(m) => Some(Message::TrlogSync {
                trlog: m.trlog,
                from: m.from,
                to: m.to,
            }),
            Event::TrlogState(m) => Some(Message::TrlogState {
                trlog: m.trlog,
                from: m.from,
                to: m.to,
                top: m.top,
            }),
            Event::TrlogData(m) => Some(Message::TrlogData {
                trlog: m.trlog,
                from: m.from,
                to: m.to,
                count: m.entries.len() as u64,
                entries: m.entries.clone(),
            }),
            Event::Topology(_) | Event::TrlogChanged { .. } => None,
        }
    }

    /// Bus event delivered for a received message
    pub fn into_event(self) -> Event {
        match self {
            Message::TrlogSync { trlog, from, to } => Event::TrlogSync(TrlogSync { trlog, from, to }),
            Message::TrlogState { trlog, from, to, top } => {
                Event::TrlogState(TrlogState { trlog, from, to, top })
            }
            Message::TrlogData { trlog, from, to, entries, .. } => {
                Event::TrlogData(TrlogData { trlog, from, to, entries })
            }
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
    /// Body flags
    pub flags: u8,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 9;

    pub fn new(body: &[u8], flags: u8) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
            flags,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[8] = self.flags;
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3, flags] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
            flags,
        }
    }
}

/// Encode a message into one frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let serialized = message.serialize()?;

    let (body, flags) = if serialized.len() > COMPRESS_THRESHOLD {
        (lz4_flex::compress_prepend_size(&serialized), FLAG_COMPRESSED)
    } else {
        (serialized, 0)
    };

    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "{} frame of {} bytes exceeds limit",
            message.type_name(),
            body.len()
        )));
    }

    let header = FrameHeader::new(&body, flags);
    let mut frame = Vec::with_capacity(FrameHeader::SIZE + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body checked against its header
pub fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<Message> {
    if crc32fast::hash(body) != header.checksum {
        return Err(Error::Protocol("message checksum mismatch".into()));
    }

    if header.is_compressed() {
        let declared = match body.get(..4) {
            Some(&[s0, s1, s2, s3]) => u32::from_le_bytes([s0, s1, s2, s3]) as usize,
            _ => return Err(Error::Protocol("truncated compressed body".into())),
        };
        if declared > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "decompressed size {} exceeds limit",
                declared
            )));
        }
        let serialized = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| Error::Protocol(format!("decompression failed: {}", e)))?;
        Message::deserialize(&serialized)
    } else {
        Message::deserialize(body)
    }
}

/// Decode one complete frame
pub fn decode_frame(frame: &[u8]) -> Result<Message> {
    if frame.len() < FrameHeader::SIZE {
        return Err(Error::Protocol("truncated frame header".into()));
    }
    let (head, body) = frame.split_at(FrameHeader::SIZE);
    let head: &[u8; FrameHeader::SIZE] = head
        .try_into()
        .map_err(|_| Error::Protocol("truncated frame header".into()))?;
    let header = FrameHeader::from_bytes(head);
    if body.len() != header.length as usize {
        return Err(Error::Protocol(format!(
            "frame length {} does not match body of {} bytes",
            header.length,
            body.len()
        )));
    }
    decode_body(&header, body)
}

/// Read a framed message from a reader
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    decode_body(&header, &body)
}

/// Write a framed message to a writer
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Frame codec for [`tokio_util::codec::Framed`] transports.
///
/// A frame that fails its checksum or does not decode is consumed before
/// the error is returned, so the next frame on the stream is still readable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let mut head = [0u8; FrameHeader::SIZE];
        head.copy_from_slice(&src[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(&head);
        let length = header.length as usize;

        if length > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", length)));
        }

        if src.len() < FrameHeader::SIZE + length {
            src.reserve(FrameHeader::SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let body = src.split_to(length);
        decode_body(&header, &body).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let frame = encode_frame(&message)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
