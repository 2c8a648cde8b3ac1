use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use tracing::debug;
use url::{ParseError, Url};

use crate::torrent::TorrentMetadata;

pub mod error;
pub mod response;

pub use error::TrackerError;
pub use response::{Announce, parse_announce};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("rs_swarm/", env!("CARGO_PKG_VERSION")))
        .timeout(TRACKER_TIMEOUT)
        .build()
        .unwrap_or_default()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Completed,
    Stopped,
}

impl TrackerEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

/// Transfer totals reported with every announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

#[async_trait]
pub trait Tracker: Send + Sync {
    /// `None` is a regular periodic announce.
    async fn announce(
        &self,
        event: Option<TrackerEvent>,
        stats: TransferStats,
    ) -> Result<Announce, TrackerError>;
}

/// Announces over HTTP(S) to the torrent's announce URL.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    announce: String,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

impl HttpTracker {
    pub fn new(meta: &TorrentMetadata, peer_id: [u8; 20], port: u16) -> Self {
        Self {
            announce: meta.announce.clone(),
            info_hash: meta.info_hash,
            peer_id,
            port,
        }
    }

    fn build_tracker_url(
        &self,
        event: Option<TrackerEvent>,
        stats: TransferStats,
    ) -> Result<String, ParseError> {
        let mut base = Url::parse(&self.announce)?;

        let mut query = base.query().map(|q| format!("{q}&")).unwrap_or_default();
        query.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            encode_bytes(&self.info_hash),
            encode_bytes(&self.peer_id),
            self.port,
            stats.uploaded,
            stats.downloaded,
            stats.left
        ));
        if let Some(event) = event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        base.set_query(Some(&query));
        Ok(base.to_string())
    }
}

async fn contact_tracker(tracker_url: &str) -> Result<Vec<u8>, TrackerError> {
    let response = HTTP_CLIENT.get(tracker_url).send().await?;

    if !response.status().is_success() {
        return Err(TrackerError::Status(response.status().as_u16()));
    }

    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(
        &self,
        event: Option<TrackerEvent>,
        stats: TransferStats,
    ) -> Result<Announce, TrackerError> {
        let url = self.build_tracker_url(event, stats)?;
        debug!(event = ?event, "announcing to {}", self.announce);
        let body = contact_tracker(&url).await?;
        parse_announce(&body)
    }
}
