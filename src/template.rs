//! `$placeholder` templates used by entity, event and action configuration.
//!
//! | Placeholder            | Resolves to                                   |
//! |------------------------|-----------------------------------------------|
//! | `$identity`            | fingerprint identity                          |
//! | `$paramN`              | N-th fingerprint parameter                    |
//! | `$contract`            | contract the entity/event/action belongs to   |
//! | `$account`             | configured account address                    |
//! | `$topicN[.address|.uint]` | N-th log topic (raw, as address, as decimal) |
//! | `$dataN[.address|.uint]`  | N-th 32-byte word of log data              |
//! | `$payload.<field>`     | field of an action payload                    |
//!
//! Anything else is a literal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::abi;
use crate::chain::provider::LogEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordFormat {
    Raw,
    Address,
    Uint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    Literal(String),
    Identity,
    Param(usize),
    Contract,
    Account,
    Topic(usize, WordFormat),
    Data(usize, WordFormat),
    Payload(String),
}

/// Where a template is evaluated; decides which placeholders make sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Entity,
    Event,
    Action,
}

impl Template {
    pub fn allowed_in(&self, scope: Scope) -> bool {
        match self {
            Template::Literal(_) | Template::Contract | Template::Account => true,
            Template::Identity | Template::Param(_) => scope == Scope::Entity,
            Template::Topic(..) | Template::Data(..) => scope == Scope::Event,
            Template::Payload(_) => scope == Scope::Action,
        }
    }

    pub fn resolve(&self, b: &Bindings<'_>) -> Option<String> {
        match self {
            Template::Literal(s) => Some(s.clone()),
            Template::Identity => b.identity.map(str::to_string),
            Template::Param(i) => b.params.get(*i).cloned(),
            Template::Contract => b.contract.map(str::to_string),
            Template::Account => b.account.map(str::to_string),
            Template::Topic(i, fmt) => {
                let topic = b.log?.topics.get(*i)?;
                format_word(topic, *fmt)
            }
            Template::Data(i, fmt) => {
                let word = abi::data_word(&b.log?.data, *i)?;
                format_word(&word, *fmt)
            }
            Template::Payload(field) => match b.payload?.get(field)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(v) => Some(v.to_string()),
                _ => None,
            },
        }
    }
}

fn format_word(word: &str, fmt: WordFormat) -> Option<String> {
    match fmt {
        WordFormat::Raw => Some(word.to_ascii_lowercase()),
        WordFormat::Address => abi::word_to_address(word),
        WordFormat::Uint => abi::word_to_decimal(word),
    }
}

/// Values a template may draw from. Unset fields make their placeholders
/// resolve to `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bindings<'a> {
    pub identity: Option<&'a str>,
    pub params: &'a [String],
    pub contract: Option<&'a str>,
    pub account: Option<&'a str>,
    pub log: Option<&'a LogEvent>,
    pub payload: Option<&'a Value>,
}

fn parse_indexed(rest: &str) -> Result<(usize, WordFormat), String> {
    let (index, format) = match rest.split_once('.') {
        Some((i, "address")) => (i, WordFormat::Address),
        Some((i, "uint")) => (i, WordFormat::Uint),
        Some((_, other)) => return Err(format!("unknown word format '{other}'")),
        None => (rest, WordFormat::Raw),
    };
    let index = index
        .parse()
        .map_err(|_| format!("invalid index '{index}'"))?;
    Ok((index, format))
}

impl FromStr for Template {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(name) = s.strip_prefix('$') else {
            return Ok(Template::Literal(s.to_string()));
        };
        match name {
            "identity" => Ok(Template::Identity),
            "contract" => Ok(Template::Contract),
            "account" => Ok(Template::Account),
            _ => {
                if let Some(field) = name.strip_prefix("payload.") {
                    if field.is_empty() {
                        return Err("empty payload field".to_string());
                    }
                    return Ok(Template::Payload(field.to_string()));
                }
                if let Some(rest) = name.strip_prefix("param") {
                    let i = rest
                        .parse()
                        .map_err(|_| format!("invalid placeholder '{s}'"))?;
                    return Ok(Template::Param(i));
                }
                if let Some(rest) = name.strip_prefix("topic") {
                    let (i, f) = parse_indexed(rest).map_err(|e| format!("'{s}': {e}"))?;
                    return Ok(Template::Topic(i, f));
                }
                if let Some(rest) = name.strip_prefix("data") {
                    let (i, f) = parse_indexed(rest).map_err(|e| format!("'{s}': {e}"))?;
                    return Ok(Template::Data(i, f));
                }
                Err(format!("unknown placeholder '{s}'"))
            }
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = |fmt: &WordFormat| match fmt {
            WordFormat::Raw => "",
            WordFormat::Address => ".address",
            WordFormat::Uint => ".uint",
        };
        match self {
            Template::Literal(s) => f.write_str(s),
            Template::Identity => f.write_str("$identity"),
            Template::Param(i) => write!(f, "$param{i}"),
            Template::Contract => f.write_str("$contract"),
            Template::Account => f.write_str("$account"),
            Template::Topic(i, fmt) => write!(f, "$topic{i}{}", suffix(fmt)),
            Template::Data(i, fmt) => write!(f, "$data{i}{}", suffix(fmt)),
            Template::Payload(field) => write!(f, "$payload.{field}"),
        }
    }
}

impl Serialize for Template {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Accept YAML scalars like `7` or `true` as literals.
        let v = Value::deserialize(deserializer)?;
        let s = match v {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => return Err(serde::de::Error::custom(format!("invalid template {other}"))),
        };
        s.parse().map_err(serde::de::Error::custom)
    }
}
