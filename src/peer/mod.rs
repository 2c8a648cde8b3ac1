use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use rand::Rng;

pub mod error;
pub mod handshake;
pub mod message;
pub mod session;

pub use error::PeerError;
pub use handshake::Handshake;
pub use message::{Bitfield, BlockInfo, Message};
pub use session::{PeerSession, SessionContext, SessionHandle, SessionState, SessionTimeouts};

/// Azureus-style prefix for our peer id.
pub const CLIENT_PREFIX: &[u8; 8] = b"-RS0001-";

/// A remote endpoint. Tracker compact responses carry no peer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
}

impl PeerIdentity {
    pub fn new(addr: SocketAddr, peer_id: Option<[u8; 20]>) -> Self {
        Self { addr, peer_id }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Same peer if the addresses match or both sides report the same id.
    pub fn same_peer(&self, other: &PeerIdentity) -> bool {
        self.addr == other.addr
            || matches!((self.peer_id, other.peer_id), (Some(a), Some(b)) if a == b)
    }
}

impl From<SocketAddr> for PeerIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr, None)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// `-RS0001-` followed by twelve random digits.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = b'0' + rng.gen_range(0..10u8);
    }
    id
}
