use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no free listen port in {first}..={last}")]
    NoListenPort { first: u16, last: u16 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
