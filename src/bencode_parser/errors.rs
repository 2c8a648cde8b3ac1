use std::num::ParseIntError;

use nom::error::{ErrorKind, ParseError};
use thiserror::Error;

/// Parser-internal error, carrying the input slice where parsing stopped.
#[derive(Debug, Error)]
pub enum BencodeError<I> {
    #[error("integer has a leading zero or negative zero")]
    InvalidInteger(I),
    #[error("byte string length is not a valid number")]
    InvalidBytesLength(I),
    #[error("integer out of range: {1}")]
    ParseIntError(I, ParseIntError),
    #[error("unexpected input ({1:?})")]
    Nom(I, ErrorKind),
}

impl<I> BencodeError<I> {
    pub fn input(&self) -> &I {
        match self {
            Self::InvalidInteger(i)
            | Self::InvalidBytesLength(i)
            | Self::ParseIntError(i, _)
            | Self::Nom(i, _) => i,
        }
    }
}

impl<I> ParseError<I> for BencodeError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        Self::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

/// A bencode document could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed bencode at byte {offset}: {reason}")]
pub struct DecodeError {
    pub offset: usize,
    pub reason: String,
}

impl DecodeError {
    pub(crate) fn from_nom(source: &[u8], err: nom::Err<BencodeError<&[u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Self {
                offset: source.len(),
                reason: "unexpected end of input".to_string(),
            },
            nom::Err::Error(e) | nom::Err::Failure(e) => Self {
                offset: source.len() - e.input().len(),
                reason: e.to_string(),
            },
        }
    }
}
