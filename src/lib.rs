pub mod bencode_parser;
pub mod peer;
pub mod policy;
pub mod store;
pub mod swarm;
pub mod torrent;
pub mod tracker;

#[cfg(test)]
mod testutil;

// Re-export commonly used types and functions for easier access
pub use bencode_parser::{Value, encode, parse, parse_one};
pub use peer::{PeerIdentity, generate_peer_id};
pub use policy::{FixedPolicy, RandomPolicy, SwarmPolicy};
pub use store::{PieceStore, StoreError};
pub use swarm::{SwarmConfig, SwarmCoordinator, SwarmError};
pub use torrent::{TorrentMetadata, parse_torrent_bytes, parse_torrent_file};
pub use tracker::{HttpTracker, Tracker, TrackerEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_bencode() {
        let data = b"d3:cow3:moo4:spam4:eggse";
        let parsed = parse_one(data).unwrap();

        assert_eq!(parsed.get(b"cow").and_then(Value::as_str), Some("moo"));
        assert_eq!(parsed.get(b"spam").and_then(Value::as_str), Some("eggs"));
        assert_eq!(encode(&parsed), data.to_vec());
    }
}
