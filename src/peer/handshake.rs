use tokio::io::{AsyncRead, AsyncReadExt};

use crate::peer::error::PeerError;

pub const PSTR: &str = "BitTorrent protocol";
pub const PSTR_LEN: u8 = PSTR.len() as u8; // always 19
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PSTR_LEN;
        buf[1..20].copy_from_slice(PSTR.as_bytes());
        // buf[20..28] is already zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);

        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, PeerError> {
        if buf.len() != HANDSHAKE_LEN || buf[0] != PSTR_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if &buf[1..20] != PSTR.as_bytes() {
            return Err(PeerError::InvalidHandshake);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }

    /// Reads exactly one handshake; a peer hanging up early is an invalid handshake.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, PeerError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PeerError::InvalidHandshake
            } else {
                PeerError::Io(e)
            }
        })?;
        Self::deserialize(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn raw_handshake(info_hash: [u8; 20], peer_id: [u8; 20]) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PSTR_LEN;
        buf[1..20].copy_from_slice(PSTR.as_bytes());
        buf[28..48].copy_from_slice(&info_hash);
        buf[48..68].copy_from_slice(&peer_id);
        buf
    }

    #[test]
    fn test_handshake_serialize() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let serialized = Handshake::new(info_hash, peer_id).serialize();

        assert_eq!(serialized.len(), 68);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &info_hash);
        assert_eq!(&serialized[48..68], &peer_id);
    }

    #[test]
    fn test_handshake_deserialize_valid() {
        let buf = raw_handshake([3u8; 20], [4u8; 20]);
        let handshake = Handshake::deserialize(&buf).unwrap();

        assert_eq!(handshake.info_hash, [3u8; 20]);
        assert_eq!(handshake.peer_id, [4u8; 20]);
    }

    #[test]
    fn test_handshake_deserialize_invalid_length() {
        assert_matches!(
            Handshake::deserialize(&[0u8; 67]),
            Err(PeerError::InvalidHandshake)
        );
        assert_matches!(
            Handshake::deserialize(&[0u8; 69]),
            Err(PeerError::InvalidHandshake)
        );
    }

    #[test]
    fn test_handshake_deserialize_invalid_pstr() {
        let mut buf = raw_handshake([0; 20], [0; 20]);
        buf[1..20].copy_from_slice(b"Invalid protocol!!X");
        assert_matches!(Handshake::deserialize(&buf), Err(PeerError::InvalidHandshake));

        let mut buf = raw_handshake([0; 20], [0; 20]);
        buf[0] = PSTR_LEN + 1;
        assert_matches!(Handshake::deserialize(&buf), Err(PeerError::InvalidHandshake));
    }

    #[test]
    fn test_handshake_ignores_reserved_bytes() {
        let mut buf = raw_handshake([17u8; 20], [18u8; 20]);
        buf[20..28].fill(0xFF);

        let handshake = Handshake::deserialize(&buf).unwrap();
        assert_eq!(handshake.info_hash, [17u8; 20]);
        assert_eq!(handshake.peer_id, [18u8; 20]);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let original = Handshake::new([7u8; 20], [8u8; 20]);
        assert_eq!(Handshake::deserialize(&original.serialize()).unwrap(), original);
    }

    #[tokio::test]
    async fn test_read_from_short_stream() {
        let buf = raw_handshake([1; 20], [2; 20]);
        let mut reader = &buf[..40];
        assert_matches!(
            Handshake::read_from(&mut reader).await,
            Err(PeerError::InvalidHandshake)
        );

        let mut reader = &buf[..];
        assert_eq!(
            Handshake::read_from(&mut reader).await.unwrap(),
            Handshake::new([1; 20], [2; 20])
        );
    }
}
