use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{
    bencode_parser::{Value, parse_one},
    peer::PeerIdentity,
    tracker::error::TrackerError,
};

/// A successful announce.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Announce {
    pub peers: Vec<PeerIdentity>,
    /// Absent when the tracker did not send a usable interval.
    pub interval: Option<Duration>,
}

/// Compact form: 4 address bytes then a big-endian port, per peer.
pub(crate) fn extract_peers(bytes: &[u8]) -> Option<Vec<PeerIdentity>> {
    let peer_size: usize = 6;
    if bytes.len() % peer_size != 0 {
        return None;
    }
    let peers = bytes
        .chunks_exact(peer_size)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerIdentity::new(SocketAddr::new(IpAddr::V4(ip), port), None)
        })
        .collect();

    Some(peers)
}

/// Dictionary form. Entries missing an address or port are skipped.
fn peer_from_dict(entry: &Value) -> Option<PeerIdentity> {
    let ip: IpAddr = entry.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(entry.get(b"port")?.as_integer()?).ok()?;
    let peer_id = entry
        .get(b"peer id")
        .and_then(Value::as_bytes)
        .and_then(|id| <[u8; 20]>::try_from(id).ok());
    Some(PeerIdentity::new(SocketAddr::new(ip, port), peer_id))
}

pub fn parse_announce(bytes: &[u8]) -> Result<Announce, TrackerError> {
    let root = parse_one(bytes)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("not a dictionary"));
    }
    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason.as_str().unwrap_or("<binary reason>");
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = root
        .get(b"interval")
        .and_then(Value::as_integer)
        .filter(|&secs| secs > 0)
        .map(|secs| Duration::from_secs(secs as u64));

    let peers = match root.get(b"peers") {
        Some(Value::List(entries)) => entries.iter().filter_map(peer_from_dict).collect(),
        Some(Value::Bytes(compact)) => {
            extract_peers(compact).ok_or(TrackerError::InvalidResponse("compact peers length"))?
        }
        Some(_) => return Err(TrackerError::InvalidResponse("peers")),
        None => Vec::new(),
    };

    Ok(Announce { peers, interval })
}
