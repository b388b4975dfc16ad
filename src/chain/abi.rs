//! Just enough of the contract ABI for the calls and logs vaultsync deals
//! with: static arguments in, static words and address/uint arrays out.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, B256, U256, hex, keccak256};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("invalid signature '{0}'")]
    InvalidSignature(String),
    #[error("unsupported type '{0}'")]
    UnsupportedType(String),
    #[error("cannot encode '{value}' as {ty}")]
    Encode { ty: AbiType, value: String },
    #[error("expected {expected} arguments, got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("malformed return data: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiType {
    Address,
    Uint256,
    Bool,
    Bytes32,
    AddressArray,
    Uint256Array,
}

impl AbiType {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, AbiType::AddressArray | AbiType::Uint256Array)
    }

    fn canonical(&self) -> &'static str {
        match self {
            AbiType::Address => "address",
            AbiType::Uint256 => "uint256",
            AbiType::Bool => "bool",
            AbiType::Bytes32 => "bytes32",
            AbiType::AddressArray => "address[]",
            AbiType::Uint256Array => "uint256[]",
        }
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

impl FromStr for AbiType {
    type Err = AbiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "address" => Ok(AbiType::Address),
            "uint256" | "uint" => Ok(AbiType::Uint256),
            "bool" => Ok(AbiType::Bool),
            "bytes32" => Ok(AbiType::Bytes32),
            "address[]" => Ok(AbiType::AddressArray),
            "uint256[]" | "uint[]" => Ok(AbiType::Uint256Array),
            other => Err(AbiError::UnsupportedType(other.to_string())),
        }
    }
}

/// A function or event signature such as `deposit(uint256)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub inputs: Vec<AbiType>,
}

impl Signature {
    pub fn canonical(&self) -> String {
        let inputs: Vec<&str> = self.inputs.iter().map(AbiType::canonical).collect();
        format!("{}({})", self.name, inputs.join(","))
    }

    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.canonical().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// topic0 of the event with this signature.
    pub fn topic(&self) -> String {
        hex::encode_prefixed(keccak256(self.canonical().as_bytes()))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for Signature {
    type Err = AbiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AbiError::InvalidSignature(s.to_string());
        let (name, rest) = s.trim().split_once('(').ok_or_else(invalid)?;
        let args = rest.strip_suffix(')').ok_or_else(invalid)?;
        let valid_name = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit());
        if !valid_name {
            return Err(invalid());
        }
        let inputs = if args.trim().is_empty() {
            Vec::new()
        } else {
            // Parameter names are allowed and ignored: `deposit(uint256 amount)`.
            args.split(',')
                .map(|a| a.split_whitespace().next().unwrap_or_default().parse())
                .collect::<Result<Vec<AbiType>, _>>()?
        };
        Ok(Signature {
            name: name.to_string(),
            inputs,
        })
    }
}

pub fn is_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn encode_word(ty: AbiType, value: &str) -> Result<[u8; 32], AbiError> {
    let err = || AbiError::Encode {
        ty,
        value: value.to_string(),
    };
    let value = value.trim();
    let mut word = [0u8; 32];
    match ty {
        AbiType::Address => {
            let addr = Address::from_str(value).map_err(|_| err())?;
            word[12..].copy_from_slice(addr.as_slice());
        }
        AbiType::Uint256 => {
            let n = U256::from_str(value).map_err(|_| err())?;
            word = n.to_be_bytes::<32>();
        }
        AbiType::Bool => match value {
            "true" => word[31] = 1,
            "false" => {}
            _ => return Err(err()),
        },
        AbiType::Bytes32 => {
            let b = B256::from_str(value).map_err(|_| err())?;
            word.copy_from_slice(b.as_slice());
        }
        AbiType::AddressArray | AbiType::Uint256Array => return Err(err()),
    }
    Ok(word)
}

/// `0x`-prefixed calldata for calling `sig` with `args`.
pub fn encode_call(sig: &Signature, args: &[String]) -> Result<String, AbiError> {
    if sig.inputs.len() != args.len() {
        return Err(AbiError::Arity {
            expected: sig.inputs.len(),
            actual: args.len(),
        });
    }
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&sig.selector());
    for (ty, arg) in sig.inputs.iter().zip(args) {
        data.extend_from_slice(&encode_word(*ty, arg)?);
    }
    Ok(hex::encode_prefixed(data))
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], AbiError> {
    offset
        .checked_add(32)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| AbiError::Decode(format!("no word at offset {offset}")))
}

fn word_as_usize(word: &[u8]) -> Result<usize, AbiError> {
    let n = U256::from_be_slice(word);
    usize::try_from(n).map_err(|_| AbiError::Decode(format!("offset {n} out of range")))
}

fn decode_word(ty: AbiType, word: &[u8]) -> Result<Value, AbiError> {
    Ok(match ty {
        AbiType::Address => Value::String(hex::encode_prefixed(&word[12..])),
        AbiType::Uint256 => Value::String(U256::from_be_slice(word).to_string()),
        AbiType::Bool => match U256::from_be_slice(word) {
            n if n.is_zero() => Value::Bool(false),
            n if n == U256::from(1) => Value::Bool(true),
            n => return Err(AbiError::Decode(format!("{n} is not a bool"))),
        },
        AbiType::Bytes32 => Value::String(hex::encode_prefixed(word)),
        AbiType::AddressArray | AbiType::Uint256Array => {
            return Err(AbiError::Decode(format!("{ty} is not a static word")));
        }
    })
}

fn element_type(ty: AbiType) -> AbiType {
    match ty {
        AbiType::AddressArray => AbiType::Address,
        AbiType::Uint256Array => AbiType::Uint256,
        other => other,
    }
}

/// Decode `eth_call` return data. A single output decodes to its value,
/// several outputs to an array. Addresses come back lowercase, uints as
/// decimal strings.
pub fn decode_output(types: &[AbiType], hex_data: &str) -> Result<Value, AbiError> {
    let data = hex::decode(hex_data.trim()).map_err(|e| AbiError::Decode(e.to_string()))?;
    let mut values = Vec::with_capacity(types.len());
    for (i, ty) in types.iter().enumerate() {
        let head = word_at(&data, i * 32)?;
        if ty.is_dynamic() {
            let offset = word_as_usize(head)?;
            let len = word_as_usize(word_at(&data, offset)?)?;
            let items = (0..len)
                .map(|j| decode_word(element_type(*ty), word_at(&data, offset + 32 * (j + 1))?))
                .collect::<Result<Vec<_>, _>>()?;
            values.push(Value::Array(items));
        } else {
            values.push(decode_word(*ty, head)?);
        }
    }
    Ok(match values.len() {
        1 => values.remove(0),
        _ => Value::Array(values),
    })
}

/// The `index`-th 32-byte word of log data, `0x`-prefixed.
pub fn data_word(data: &str, index: usize) -> Option<String> {
    let hex_body = data.strip_prefix("0x").unwrap_or(data);
    let start = index.checked_mul(64)?;
    let end = start.checked_add(64)?;
    let word = hex_body.get(start..end)?;
    Some(format!("0x{}", word.to_ascii_lowercase()))
}

fn parse_word(word: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(word).ok()?;
    bytes.try_into().ok()
}

/// Interpret a topic or data word as an address (the low 20 bytes).
pub fn word_to_address(word: &str) -> Option<String> {
    let bytes = parse_word(word)?;
    if bytes[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(hex::encode_prefixed(&bytes[12..]))
}

pub fn word_to_decimal(word: &str) -> Option<String> {
    let bytes = parse_word(word)?;
    Some(U256::from_be_bytes(bytes).to_string())
}

/// Parse a `0x` quantity as returned by JSON-RPC (`eth_blockNumber`).
pub fn parse_quantity(s: &str) -> Option<u64> {
    let body = s.strip_prefix("0x")?;
    u64::from_str_radix(body, 16).ok()
}
