use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("piece index {0} out of range")]
    InvalidIndex(usize),

    #[error("piece {index} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error("download lists no files")]
    NoFiles,

    #[error("cannot write download: {0} pieces still missing")]
    Incomplete(usize),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),
}
