use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::error::PeerError;

/// Largest request a peer may ask us to serve.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Frames above this size are rejected before the body is read.
/// Covers a PIECE carrying `MAX_REQUEST_LEN` bytes and the bitfield of any sane torrent.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

/// The (index, begin, length) triple carried by REQUEST and CANCEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Self::KeepAlive => return None,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have(_) => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Piece { .. } => MessageId::Piece,
            Self::Cancel(_) => MessageId::Cancel,
        })
    }

    /// Short name for logs; PIECE payloads are too large to print.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeepAlive => "keep-alive",
            Self::Choke => "choke",
            Self::Unchoke => "unchoke",
            Self::Interested => "interested",
            Self::NotInterested => "not-interested",
            Self::Have(_) => "have",
            Self::Bitfield(_) => "bitfield",
            Self::Request(_) => "request",
            Self::Piece { .. } => "piece",
            Self::Cancel(_) => "cancel",
        }
    }

    /// Encodes the full frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0, 0, 0, 0];
        };

        let mut buf = vec![0u8; 4];
        buf.push(id as u8);
        match self {
            Self::Have(index) => buf.extend_from_slice(&index.to_be_bytes()),
            Self::Bitfield(bitfield) => buf.extend_from_slice(&bitfield.bits),
            Self::Request(block) | Self::Cancel(block) => {
                buf.extend_from_slice(&block.index.to_be_bytes());
                buf.extend_from_slice(&block.begin.to_be_bytes());
                buf.extend_from_slice(&block.length.to_be_bytes());
            }
            Self::Piece {
                index,
                begin,
                block,
            } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
            }
            _ => {}
        }

        let len = (buf.len() - 4) as u32;
        buf[..4].copy_from_slice(&len.to_be_bytes());
        buf
    }

    /// Decodes one complete frame, length prefix included.
    pub fn deserialize(buf: &[u8]) -> Result<Self, PeerError> {
        if buf.len() < 4 {
            return Err(PeerError::Protocol(format!(
                "frame of {} bytes has no length prefix",
                buf.len()
            )));
        }
        let len = read_u32(&buf[0..4]) as usize;
        if buf.len() - 4 != len {
            return Err(PeerError::Protocol(format!(
                "length prefix says {len} bytes but frame carries {}",
                buf.len() - 4
            )));
        }
        Self::decode_body(&buf[4..])
    }

    /// Decodes the bytes that follow the length prefix.
    pub fn decode_body(body: &[u8]) -> Result<Self, PeerError> {
        let Some((&id, payload)) = body.split_first() else {
            return Ok(Self::KeepAlive);
        };
        let id = MessageId::try_from(id)?;

        let expect_len = |expected: usize| {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(PeerError::Protocol(format!(
                    "{id:?} payload is {} bytes, expected {expected}",
                    payload.len()
                )))
            }
        };

        let message = match id {
            MessageId::Choke => expect_len(0).map(|_| Self::Choke)?,
            MessageId::Unchoke => expect_len(0).map(|_| Self::Unchoke)?,
            MessageId::Interested => expect_len(0).map(|_| Self::Interested)?,
            MessageId::NotInterested => expect_len(0).map(|_| Self::NotInterested)?,
            MessageId::Have => {
                expect_len(4)?;
                Self::Have(read_u32(payload))
            }
            MessageId::Bitfield => Self::Bitfield(Bitfield {
                bits: payload.to_vec(),
            }),
            MessageId::Request | MessageId::Cancel => {
                expect_len(12)?;
                let block = BlockInfo::new(
                    read_u32(&payload[0..4]),
                    read_u32(&payload[4..8]),
                    read_u32(&payload[8..12]),
                );
                if id == MessageId::Request {
                    Self::Request(block)
                } else {
                    Self::Cancel(block)
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(PeerError::Protocol(format!(
                        "piece payload is {} bytes, expected at least 8",
                        payload.len()
                    )));
                }
                Self::Piece {
                    index: read_u32(&payload[0..4]),
                    begin: read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                }
            }
        };
        Ok(message)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Reads one length-prefixed message.
///
/// End of stream before a prefix is `ConnectionClosed`; a frame cut short is a protocol error.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, PeerError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PeerError::ConnectionClosed
        } else {
            PeerError::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(PeerError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PeerError::Protocol(format!("frame truncated, expected {len} bytes"))
        } else {
            PeerError::Io(e)
        }
    })?;

    Message::decode_body(&body)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), PeerError> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Piece availability, packed most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    pub bits: Vec<u8>, // raw bytes
}

impl Bitfield {
    pub fn has_piece(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = 7 - (index % 8); // MSB first
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        let bit = 7 - (index % 8);
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << bit;
        }
    }

    pub fn from_piece_count(count: usize) -> Self {
        let num_bytes = count.div_ceil(8);
        Bitfield {
            bits: vec![0; num_bytes],
        }
    }

    /// Number of set bits among the first `count` pieces.
    pub fn count(&self, count: usize) -> usize {
        (0..count).filter(|&i| self.has_piece(i)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }
}

impl From<Bitfield> for Message {
    fn from(b: Bitfield) -> Self {
        Message::Bitfield(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_message_id_try_from_valid() {
        assert_matches!(MessageId::try_from(0), Ok(MessageId::Choke));
        assert_matches!(MessageId::try_from(4), Ok(MessageId::Have));
        assert_matches!(MessageId::try_from(8), Ok(MessageId::Cancel));
    }

    #[test]
    fn test_message_id_try_from_invalid() {
        assert_matches!(MessageId::try_from(9), Err(PeerError::UnknownMessageId(9)));
        assert_matches!(
            MessageId::try_from(255),
            Err(PeerError::UnknownMessageId(255))
        );
    }

    #[test]
    fn test_message_id_values() {
        assert_eq!(MessageId::Choke as u8, 0);
        assert_eq!(MessageId::Unchoke as u8, 1);
        assert_eq!(MessageId::Interested as u8, 2);
        assert_eq!(MessageId::NotInterested as u8, 3);
        assert_eq!(MessageId::Have as u8, 4);
        assert_eq!(MessageId::Bitfield as u8, 5);
        assert_eq!(MessageId::Request as u8, 6);
        assert_eq!(MessageId::Piece as u8, 7);
        assert_eq!(MessageId::Cancel as u8, 8);
    }

    #[test]
    fn test_keep_alive_is_zero_length() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_matches!(Message::deserialize(&[0, 0, 0, 0]), Ok(Message::KeepAlive));
    }

    #[test]
    fn test_message_serialize_no_payload() {
        let serialized = Message::Choke.serialize();

        assert_eq!(serialized.len(), 5); // 4 bytes length + 1 byte ID
        assert_eq!(serialized[0..4], [0, 0, 0, 1]);
        assert_eq!(serialized[4], 0);
    }

    #[test]
    fn test_message_serialize_have() {
        let serialized = Message::Have(0x12345678).serialize();

        assert_eq!(serialized.len(), 9);
        assert_eq!(serialized[0..4], [0, 0, 0, 5]);
        assert_eq!(serialized[4], 4);
        assert_eq!(serialized[5..9], [0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_message_serialize_request() {
        let serialized = Message::Request(BlockInfo::new(1, 16384, 3616)).serialize();

        assert_eq!(serialized.len(), 17);
        assert_eq!(serialized[0..4], [0, 0, 0, 13]);
        assert_eq!(serialized[4], 6);
        assert_eq!(serialized[5..9], [0, 0, 0, 1]);
        assert_eq!(serialized[9..13], [0, 0, 0x40, 0]);
        assert_eq!(serialized[13..17], [0, 0, 0x0E, 0x20]);
    }

    #[test]
    fn test_message_serialize_piece() {
        let serialized = Message::Piece {
            index: 2,
            begin: 0,
            block: vec![9; 10],
        }
        .serialize();

        assert_eq!(serialized.len(), 4 + 9 + 10);
        assert_eq!(serialized[0..4], [0, 0, 0, 19]);
        assert_eq!(serialized[4], 7);
        assert_eq!(&serialized[13..], &[9; 10]);
    }

    #[test]
    fn test_message_roundtrip() {
        let messages = [
            Message::Unchoke,
            Message::NotInterested,
            Message::Bitfield(Bitfield {
                bits: vec![0xDE, 0xAD],
            }),
            Message::Cancel(BlockInfo::new(3, 0, 16384)),
            Message::Piece {
                index: 7,
                begin: 32768,
                block: vec![0x42; 1000],
            },
        ];
        for original in messages {
            let decoded = Message::deserialize(&original.serialize()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_message_deserialize_too_short() {
        assert_matches!(Message::deserialize(&[0, 0, 0]), Err(PeerError::Protocol(_)));
    }

    #[test]
    fn test_message_deserialize_invalid_message_id() {
        assert_matches!(
            Message::deserialize(&[0, 0, 0, 1, 99]),
            Err(PeerError::UnknownMessageId(99))
        );
    }

    #[test]
    fn test_message_deserialize_incomplete_payload() {
        // says length=5 but only has 2 bytes after the prefix
        assert_matches!(
            Message::deserialize(&[0, 0, 0, 5, 4, 0x12]),
            Err(PeerError::Protocol(_))
        );
    }

    #[test]
    fn test_message_deserialize_wrong_payload_length() {
        assert_matches!(
            Message::deserialize(&[0, 0, 0, 3, 4, 0, 1]),
            Err(PeerError::Protocol(_))
        );
        assert_matches!(
            Message::deserialize(&[0, 0, 0, 2, 1, 0]),
            Err(PeerError::Protocol(_))
        );
        assert_matches!(
            Message::deserialize(&[0, 0, 0, 5, 7, 0, 0, 0, 1]),
            Err(PeerError::Protocol(_))
        );
    }

    #[tokio::test]
    async fn test_read_message_stream() {
        let mut bytes = Message::Interested.serialize();
        bytes.extend(Message::KeepAlive.serialize());
        bytes.extend(Message::Have(3).serialize());
        let mut reader = bytes.as_slice();

        assert_eq!(read_message(&mut reader).await.unwrap(), Message::Interested);
        assert_eq!(read_message(&mut reader).await.unwrap(), Message::KeepAlive);
        assert_eq!(read_message(&mut reader).await.unwrap(), Message::Have(3));
        assert_matches!(
            read_message(&mut reader).await,
            Err(PeerError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_read_message_truncated_frame() {
        let bytes = Message::Have(3).serialize();
        let mut reader = &bytes[..7];
        assert_matches!(read_message(&mut reader).await, Err(PeerError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_frame() {
        let bytes = (MAX_FRAME_LEN + 1).to_be_bytes();
        let mut reader = &bytes[..];
        assert_matches!(read_message(&mut reader).await, Err(PeerError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_write_message() {
        let mut out = Vec::new();
        write_message(&mut out, &Message::Have(1)).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 5, 4, 0, 0, 0, 1]);
    }

    #[test]
    fn test_bitfield_has_piece_basic() {
        let bitfield = Bitfield {
            bits: vec![0b10000000, 0b00000001], // First bit and last bit of second byte set
        };

        assert!(bitfield.has_piece(0));
        assert!(!bitfield.has_piece(1));
        assert!(!bitfield.has_piece(7));
        assert!(!bitfield.has_piece(8));
        assert!(bitfield.has_piece(15));
    }

    #[test]
    fn test_bitfield_has_piece_out_of_bounds() {
        let bitfield = Bitfield { bits: vec![0xFF] };

        assert!(!bitfield.has_piece(8));
        assert!(!bitfield.has_piece(100));
    }

    #[test]
    fn test_bitfield_set_piece() {
        let mut bitfield = Bitfield {
            bits: vec![0x00, 0x00],
        };

        bitfield.set_piece(0);
        assert_eq!(bitfield.bits[0], 0b10000000);

        bitfield.set_piece(7);
        assert_eq!(bitfield.bits[0], 0b10000001);

        bitfield.set_piece(8);
        assert_eq!(bitfield.bits[1], 0b10000000);
        assert_eq!(bitfield.count(16), 3);
    }

    #[test]
    fn test_bitfield_set_piece_out_of_bounds() {
        let mut bitfield = Bitfield { bits: vec![0x00] };

        // Should not panic when setting out of bounds
        bitfield.set_piece(8);
        bitfield.set_piece(100);
        assert_eq!(bitfield.bits[0], 0x00);
        assert!(bitfield.is_empty());
    }

    #[test]
    fn test_bitfield_from_piece_count() {
        assert_eq!(Bitfield::from_piece_count(7).bits.len(), 1);
        assert_eq!(Bitfield::from_piece_count(8).bits.len(), 1);
        assert_eq!(Bitfield::from_piece_count(9).bits.len(), 2);
        assert_eq!(Bitfield::from_piece_count(0).bits.len(), 0);
    }

    #[test]
    fn test_bitfield_to_message() {
        let bitfield = Bitfield {
            bits: vec![0xAB, 0xCD],
        };
        let message: Message = bitfield.clone().into();

        assert_eq!(message, Message::Bitfield(bitfield));
        assert_eq!(message.serialize(), vec![0, 0, 0, 3, 5, 0xAB, 0xCD]);
    }
}
