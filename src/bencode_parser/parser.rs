use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::{opt, recognize},
    multi::{many_till, many0},
    sequence::{delimited, pair, preceded, terminated},
};
use std::collections::BTreeMap;

use crate::bencode_parser::errors::{BencodeError, DecodeError};

type BenResult<'a, O = Value> = IResult<&'a [u8], O, BencodeError<&'a [u8]>>;

/// A decoded bencode value. Dictionaries keep their keys sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Self>),
    Dictionary(BTreeMap<Vec<u8>, Self>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(entries) => Some(entries),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for missing keys and non-dictionaries.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

fn value(inp: &[u8]) -> BenResult<'_> {
    alt((byte_string_value, integer, list, dictionary)).parse(inp)
}

fn signed_digits(inp: &[u8]) -> BenResult<'_, &[u8]> {
    recognize(pair(opt(char('-')), digit1)).parse(inp)
}

fn integer(start_inp: &[u8]) -> BenResult<'_> {
    let (inp, digits) = delimited(char('i'), signed_digits, char('e')).parse(start_inp)?;
    let invalid = || nom::Err::Failure(BencodeError::InvalidInteger(start_inp));

    let text = std::str::from_utf8(digits).map_err(|_| invalid())?;
    if text.starts_with("-0") || (text.starts_with('0') && text.len() > 1) {
        return Err(invalid());
    }

    let value = text
        .parse::<i64>()
        .map_err(|e| nom::Err::Failure(BencodeError::ParseIntError(start_inp, e)))?;
    Ok((inp, Value::Integer(value)))
}

fn length_prefix(inp: &[u8]) -> BenResult<'_, &[u8]> {
    terminated(digit1, char(':')).parse(inp)
}

fn byte_string(start_inp: &[u8]) -> BenResult<'_, &[u8]> {
    let (inp, digits) = length_prefix(start_inp)?;
    let invalid = || nom::Err::Failure(BencodeError::InvalidBytesLength(start_inp));

    if digits.len() > 1 && digits[0] == b'0' {
        return Err(invalid());
    }
    let length = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid)?;

    take(length).parse(inp)
}

fn byte_string_value(inp: &[u8]) -> BenResult<'_> {
    let (inp, bytes) = byte_string(inp)?;
    Ok((inp, Value::Bytes(bytes.to_vec())))
}

fn list(inp: &[u8]) -> BenResult<'_> {
    let (inp, (items, _)) = preceded(char('l'), many_till(value, char('e'))).parse(inp)?;
    Ok((inp, Value::List(items)))
}

fn dictionary(inp: &[u8]) -> BenResult<'_> {
    let (inp, (entries, _)) =
        preceded(char('d'), many_till(pair(byte_string, value), char('e'))).parse(inp)?;

    let map = entries
        .into_iter()
        .map(|(key, value)| (key.to_vec(), value))
        .collect();
    Ok((inp, Value::Dictionary(map)))
}

/// Parses every top-level value in `source`.
///
/// # Errors
/// Returns `Err` if `source` is not a sequence of well-formed bencode values.
pub fn parse(source: &[u8]) -> Result<Vec<Value>, DecodeError> {
    let (rest, items) = many0(value)
        .parse(source)
        .map_err(|e| DecodeError::from_nom(source, e))?;

    if !rest.is_empty() {
        return Err(DecodeError {
            offset: source.len() - rest.len(),
            reason: "trailing data".to_string(),
        });
    }

    Ok(items)
}

/// Parses a document that must hold exactly one value.
pub fn parse_one(source: &[u8]) -> Result<Value, DecodeError> {
    let mut items = parse(source)?;
    if items.len() != 1 {
        return Err(DecodeError {
            offset: 0,
            reason: format!("expected one top-level value, found {}", items.len()),
        });
    }
    Ok(items.remove(0))
}

/// Raw bytes of the value stored under `key` in the dictionary `source`, exactly as
/// they appear in the input. Key order is left untouched, so hashes over the span
/// match the original document.
pub fn raw_dict_value<'a>(source: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>, DecodeError> {
    let (_, (entries, _)) =
        preceded(char('d'), many_till(pair(byte_string, recognize(value)), char('e')))
            .parse(source)
            .map_err(|e| DecodeError::from_nom(source, e))?;

    Ok(entries
        .into_iter()
        .find(|(entry_key, _)| *entry_key == key)
        .map(|(_, raw)| raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_raw_dict_value_keeps_original_bytes() {
        let source = b"d4:infod4:name1:a3:abci1eee3:zzz0:e";
        assert_eq!(
            raw_dict_value(source, b"info").unwrap(),
            Some(&b"d4:name1:a3:abci1ee"[..])
        );
        assert_eq!(raw_dict_value(source, b"missing").unwrap(), None);
        assert!(raw_dict_value(b"li1ee", b"info").is_err());
    }

    #[test]
    fn test_parse_simple_dictionary() {
        let parsed = parse_one(b"d3:cow3:moo4:spam4:eggse").unwrap();

        assert_eq!(parsed.get(b"cow").and_then(Value::as_bytes), Some(&b"moo"[..]));
        assert_eq!(parsed.get(b"spam").and_then(Value::as_str), Some("eggs"));
    }

    #[test]
    fn test_parse_nested() {
        let parsed = parse_one(b"d4:listli1ei-2e0:e3:numi42ee").unwrap();

        let list = parsed.get(b"list").and_then(Value::as_list).unwrap();
        assert_eq!(list[0], Value::Integer(1));
        assert_eq!(list[1], Value::Integer(-2));
        assert_eq!(list[2], Value::Bytes(vec![]));
        assert_eq!(parsed.get(b"num").and_then(Value::as_integer), Some(42));
    }

    #[test]
    fn test_parse_multiple_top_level_values() {
        let parsed = parse(b"i1e3:abc").unwrap();
        assert_eq!(parsed, vec![Value::Integer(1), Value::Bytes(b"abc".to_vec())]);
    }

    #[test]
    fn test_reject_leading_zero_integer() {
        assert_matches!(parse(b"i03e"), Err(DecodeError { offset: 0, .. }));
        assert!(parse(b"i-0e").is_err());
        assert_eq!(parse_one(b"i0e").unwrap(), Value::Integer(0));
    }

    #[test]
    fn test_reject_truncated_byte_string() {
        let err = parse(b"5:abc").unwrap_err();
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn test_reject_trailing_garbage() {
        let err = parse(b"i1ex").unwrap_err();
        assert_eq!(err.offset, 3);
        assert_eq!(err.reason, "trailing data");
    }

    #[test]
    fn test_parse_one_rejects_two_values() {
        assert!(parse_one(b"i1ei2e").is_err());
        assert!(parse_one(b"").is_err());
    }
}
