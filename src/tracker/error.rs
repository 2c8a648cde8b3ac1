use thiserror::Error;

use crate::bencode_parser::DecodeError;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker answered with status {0}")]
    Status(u16),

    #[error("tracker refused the announce: {0}")]
    Failure(String),

    #[error("invalid tracker response: {0}")]
    InvalidResponse(&'static str),

    #[error(transparent)]
    Bencode(#[from] DecodeError),

    #[error("invalid announce url: {0}")]
    Url(#[from] url::ParseError),
}
