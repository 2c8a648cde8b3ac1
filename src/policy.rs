use rand::{Rng, thread_rng};

use crate::peer::PeerIdentity;

/// Decisions the swarm leaves to chance by default.
pub trait SwarmPolicy: Send + Sync {
    /// Whether to unchoke a peer that just declared interest.
    fn should_unchoke(&self, peer: &PeerIdentity) -> bool;

    /// Index into `candidates` of the next peer to connect to.
    fn pick_peer(&self, candidates: &[PeerIdentity]) -> Option<usize>;

    /// Where a session starts scanning for a needed piece.
    fn piece_hint(&self, piece_count: usize) -> usize;
}

#[derive(Debug, Clone, Copy)]
pub struct RandomPolicy {
    unchoke_probability: f64,
}

impl RandomPolicy {
    pub fn new(unchoke_probability: f64) -> Self {
        let unchoke_probability = if unchoke_probability.is_finite() {
            unchoke_probability.clamp(0.0, 1.0)
        } else {
            0.5
        };
        Self {
            unchoke_probability,
        }
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl SwarmPolicy for RandomPolicy {
    fn should_unchoke(&self, _peer: &PeerIdentity) -> bool {
        thread_rng().gen_bool(self.unchoke_probability)
    }

    fn pick_peer(&self, candidates: &[PeerIdentity]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(thread_rng().gen_range(0..candidates.len()))
    }

    fn piece_hint(&self, piece_count: usize) -> usize {
        if piece_count == 0 {
            return 0;
        }
        thread_rng().gen_range(0..piece_count)
    }
}

/// Deterministic choices: always the first candidate, always piece 0.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy {
    pub unchoke: bool,
}

impl SwarmPolicy for FixedPolicy {
    fn should_unchoke(&self, _peer: &PeerIdentity) -> bool {
        self.unchoke
    }

    fn pick_peer(&self, candidates: &[PeerIdentity]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }

    fn piece_hint(&self, _piece_count: usize) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: u16) -> Vec<PeerIdentity> {
        (0..n)
            .map(|i| PeerIdentity::from(std::net::SocketAddr::from(([10, 0, 0, 1], 6881 + i))))
            .collect()
    }

    #[test]
    fn test_random_policy_bounds() {
        let policy = RandomPolicy::default();
        let candidates = peers(5);
        for _ in 0..100 {
            assert!(policy.pick_peer(&candidates).unwrap() < 5);
            assert!(policy.piece_hint(7) < 7);
        }
        assert_eq!(policy.pick_peer(&[]), None);
        assert_eq!(policy.piece_hint(0), 0);
    }

    #[test]
    fn test_random_policy_extremes() {
        let peer = &peers(1)[0];
        assert!(RandomPolicy::new(1.0).should_unchoke(peer));
        assert!(!RandomPolicy::new(0.0).should_unchoke(peer));
        assert!(RandomPolicy::new(7.0).should_unchoke(peer));
        assert!(!RandomPolicy::new(f64::NAN).unchoke_probability.is_nan());
    }

    #[test]
    fn test_fixed_policy() {
        let policy = FixedPolicy { unchoke: true };
        assert_eq!(policy.pick_peer(&peers(3)), Some(0));
        assert_eq!(policy.pick_peer(&[]), None);
        assert_eq!(policy.piece_hint(10), 0);
        assert!(policy.should_unchoke(&peers(1)[0]));
    }
}
