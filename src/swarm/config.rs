use std::{net::Ipv4Addr, ops::RangeInclusive, time::Duration};

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{peer::SessionTimeouts, swarm::error::SwarmError};

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub max_download_sessions: usize,
    pub max_upload_sessions: usize,
    /// Period of the session monitor.
    pub monitor_tick: Duration,
    /// Monitor ticks per rotation window.
    pub rotation_ticks: u32,
    /// Used until the tracker supplies an interval.
    pub default_poll_interval: Duration,
    /// How long a stopping session or loop may take before it is aborted.
    pub join_timeout: Duration,
    /// How long a peer that failed or closed is skipped.
    pub peer_retry_backoff: Duration,
    pub session: SessionTimeouts,
    pub listen_ports: RangeInclusive<u16>,
    pub unchoke_probability: f64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_download_sessions: 3,
            max_upload_sessions: 3,
            monitor_tick: Duration::from_secs(3),
            rotation_ticks: 10,
            default_poll_interval: Duration::from_secs(60),
            join_timeout: Duration::from_secs(5),
            peer_retry_backoff: Duration::from_secs(30),
            session: SessionTimeouts::default(),
            listen_ports: 6881..=6889,
            unchoke_probability: 0.5,
        }
    }
}

impl SwarmConfig {
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.max_download_sessions == 0 && self.max_upload_sessions == 0 {
            return Err(SwarmError::Config(
                "at least one download or upload session is required".into(),
            ));
        }
        if self.rotation_ticks == 0 {
            return Err(SwarmError::Config("rotation_ticks must be positive".into()));
        }
        if self.monitor_tick.is_zero() || self.default_poll_interval.is_zero() {
            return Err(SwarmError::Config("intervals must be positive".into()));
        }
        if self.listen_ports.is_empty() {
            return Err(SwarmError::Config(format!(
                "empty port range {}..={}",
                self.listen_ports.start(),
                self.listen_ports.end()
            )));
        }
        if !(0.0..=1.0).contains(&self.unchoke_probability) {
            return Err(SwarmError::Config(format!(
                "unchoke probability {} is not in [0, 1]",
                self.unchoke_probability
            )));
        }
        Ok(())
    }

    /// Binds the first free port of `listen_ports` on all interfaces.
    pub async fn bind_listener(&self) -> Result<TcpListener, SwarmError> {
        for port in self.listen_ports.clone() {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(listener) => {
                    info!(port, "listening for peers");
                    return Ok(listener);
                }
                Err(e) => debug!(port, error = %e, "port unavailable"),
            }
        }
        Err(SwarmError::NoListenPort {
            first: *self.listen_ports.start(),
            last: *self.listen_ports.end(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_download_sessions, 3);
        assert_eq!(config.monitor_tick * config.rotation_ticks, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = SwarmConfig {
            rotation_ticks: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(SwarmError::Config(_)));

        let config = SwarmConfig {
            unchoke_probability: 1.5,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(SwarmError::Config(_)));

        #[allow(clippy::reversed_empty_ranges)]
        let config = SwarmConfig {
            listen_ports: 6889..=6881,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(SwarmError::Config(_)));
    }

    #[tokio::test]
    async fn test_bind_skips_taken_ports() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = SwarmConfig {
            listen_ports: port..=port,
            ..Default::default()
        };
        assert_matches!(
            config.bind_listener().await,
            Err(SwarmError::NoListenPort { first, last }) if first == port && last == port
        );
    }
}
