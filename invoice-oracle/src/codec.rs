//! Result payload codec.
//!
//! The DON returns raw bytes; how to read them is fixed when the request is
//! built. Numeric types are 32-byte big-endian words, booleans are ABI bools
//! (a word holding 0 or 1), strings are raw UTF-8 and bytes pass through.
//! An empty payload is a valid string or byte string but never a word.
//! Anything that does not match the declared shape exactly is rejected.

use ethers::types::{I256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const WORD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnType {
    Bool,
    Uint256,
    Int256,
    String,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Bool(bool),
    Uint(U256),
    Int(I256),
    String(String),
    Bytes(Vec<u8>),
}

impl DecodedValue {
    pub fn return_type(&self) -> ReturnType {
        match self {
            DecodedValue::Bool(_) => ReturnType::Bool,
            DecodedValue::Uint(_) => ReturnType::Uint256,
            DecodedValue::Int(_) => ReturnType::Int256,
            DecodedValue::String(_) => ReturnType::String,
            DecodedValue::Bytes(_) => ReturnType::Bytes,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload where a 32-byte word was expected")]
    Empty,
    #[error("expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("payload of {actual} bytes exceeds limit of {max}")]
    TooLong { max: usize, actual: usize },
    #[error("boolean word is not 0 or 1")]
    InvalidBool,
    #[error("result is not valid UTF-8")]
    InvalidUtf8,
}

pub fn encode(value: &DecodedValue) -> Vec<u8> {
    match value {
        DecodedValue::Bool(b) => word(U256::from(*b as u8)),
        DecodedValue::Uint(v) => word(*v),
        DecodedValue::Int(v) => word(v.into_raw()),
        DecodedValue::String(s) => s.as_bytes().to_vec(),
        DecodedValue::Bytes(b) => b.clone(),
    }
}

/// Decode `raw` as `ty`. Never pads, truncates or guesses.
pub fn decode(raw: &[u8], ty: ReturnType, max_len: usize) -> Result<DecodedValue, DecodeError> {
    if raw.len() > max_len {
        return Err(DecodeError::TooLong { max: max_len, actual: raw.len() });
    }

    match ty {
        ReturnType::Bool => {
            let value = read_word(raw)?;
            if value > U256::one() {
                return Err(DecodeError::InvalidBool);
            }
            Ok(DecodedValue::Bool(value == U256::one()))
        }
        ReturnType::Uint256 => Ok(DecodedValue::Uint(read_word(raw)?)),
        ReturnType::Int256 => Ok(DecodedValue::Int(I256::from_raw(read_word(raw)?))),
        ReturnType::String => std::str::from_utf8(raw)
            .map(|s| DecodedValue::String(s.to_string()))
            .map_err(|_| DecodeError::InvalidUtf8),
        ReturnType::Bytes => Ok(DecodedValue::Bytes(raw.to_vec())),
    }
}

fn word(value: U256) -> Vec<u8> {
    let mut out = vec![0u8; WORD];
    value.to_big_endian(&mut out);
    out
}

fn read_word(raw: &[u8]) -> Result<U256, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    if raw.len() != WORD {
        return Err(DecodeError::WrongLength { expected: WORD, actual: raw.len() });
    }
    Ok(U256::from_big_endian(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_words() {
        assert_eq!(decode(&word(U256::one()), ReturnType::Bool, 256), Ok(DecodedValue::Bool(true)));
        assert_eq!(decode(&word(U256::zero()), ReturnType::Bool, 256), Ok(DecodedValue::Bool(false)));
        assert_eq!(decode(&word(U256::from(2)), ReturnType::Bool, 256), Err(DecodeError::InvalidBool));
    }

    #[test]
    fn test_short_word_is_not_padded() {
        assert_eq!(
            decode(&[1u8], ReturnType::Bool, 256),
            Err(DecodeError::WrongLength { expected: 32, actual: 1 })
        );
        assert_eq!(
            decode(&[0u8; 33], ReturnType::Uint256, 256),
            Err(DecodeError::WrongLength { expected: 32, actual: 33 })
        );
    }

    #[test]
    fn test_negative_int() {
        let value = DecodedValue::Int(I256::from(-42));
        let raw = encode(&value);
        assert_eq!(raw[0], 0xFF);
        assert_eq!(decode(&raw, ReturnType::Int256, 256), Ok(value));
    }

    #[test]
    fn test_limits() {
        assert_eq!(decode(&[], ReturnType::Uint256, 256), Err(DecodeError::Empty));
        assert_eq!(decode(&[], ReturnType::Bytes, 256), Ok(DecodedValue::Bytes(Vec::new())));
        assert_eq!(decode(&[], ReturnType::String, 256), Ok(DecodedValue::String(String::new())));
        assert_eq!(
            decode(&[7u8; 300], ReturnType::Bytes, 256),
            Err(DecodeError::TooLong { max: 256, actual: 300 })
        );
        assert_eq!(decode(&[0xC3, 0x28], ReturnType::String, 256), Err(DecodeError::InvalidUtf8));
    }
}
