use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of on-chain derived data. Staleness budgets are configured per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    UserPosition,
    PoolAggregate,
    RoundState,
    TokenBalance,
    YieldRate,
    ContractStatus,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::UserPosition,
        EntityKind::PoolAggregate,
        EntityKind::RoundState,
        EntityKind::TokenBalance,
        EntityKind::YieldRate,
        EntityKind::ContractStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::UserPosition => "user-position",
            EntityKind::PoolAggregate => "pool-aggregate",
            EntityKind::RoundState => "round-state",
            EntityKind::TokenBalance => "token-balance",
            EntityKind::YieldRate => "yield-rate",
            EntityKind::ContractStatus => "contract-status",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind '{s}'"))
    }
}

/// Semantic cache key: `kind:identity[:param,param,...]`.
///
/// Hex identities and parameters (`0x...`) are lowercased so that checksummed
/// and plain addresses land on the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    pub kind: EntityKind,
    pub identity: String,
    pub params: Vec<String>,
}

fn normalize(part: &str) -> String {
    let part = part.trim();
    if part.len() > 2 && part.as_bytes()[..2].eq_ignore_ascii_case(b"0x") {
        part.to_ascii_lowercase()
    } else {
        part.to_string()
    }
}

impl Fingerprint {
    pub fn new(kind: EntityKind, identity: impl AsRef<str>) -> Self {
        Self {
            kind,
            identity: normalize(identity.as_ref()),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl AsRef<str>) -> Self {
        self.params.push(normalize(param.as_ref()));
        self
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.identity)?;
        if !self.params.is_empty() {
            write!(f, ":{}", self.params.join(","))?;
        }
        Ok(())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind: EntityKind = parts.next().unwrap_or_default().parse()?;
        let identity = parts
            .next()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| format!("fingerprint '{s}' is missing an identity"))?;
        let mut fp = Fingerprint::new(kind, identity);
        if let Some(params) = parts.next() {
            for p in params.split(',').filter(|p| !p.is_empty()) {
                fp = fp.with_param(p);
            }
        }
        Ok(fp)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Exact(Fingerprint),
    /// Every entry of a kind; used when a signal cannot name identities.
    Kind(EntityKind),
}

impl Target {
    pub fn matches(&self, fp: &Fingerprint) -> bool {
        match self {
            Target::Exact(t) => t == fp,
            Target::Kind(k) => fp.kind == *k,
        }
    }
}

impl From<Fingerprint> for Target {
    fn from(fp: Fingerprint) -> Self {
        Target::Exact(fp)
    }
}

impl Serialize for Target {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Exact(fp) => fp.fmt(f),
            Target::Kind(k) => write!(f, "{k}:*"),
        }
    }
}
