use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::cache::EntityKind;
use crate::chain::abi::{self, AbiType, Signature};
use crate::retry::RetryPolicy;
use crate::template::{Scope, Template};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub transactions: TransactionsConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub events: Vec<EventConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_address(),
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Push transport for event subscriptions. Without it only block
    /// polling keeps the cache honest.
    pub ws_url: Option<String>,
    #[serde(default = "default_poll_interval", with = "duration_string")]
    pub poll_interval: Duration,
    #[serde(default = "default_request_timeout", with = "duration_string")]
    pub request_timeout: Duration,
    /// Account used for `$account` and as the sender of every write.
    pub account: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_stale_after", with = "duration_string")]
    pub default_stale_after: Duration,
    #[serde(default)]
    pub kinds: Vec<KindPolicy>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_after: default_stale_after(),
            kinds: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KindPolicy {
    pub kind: EntityKind,
    #[serde(default, with = "option_duration_string")]
    pub stale_after: Option<Duration>,
    #[serde(default = "default_true")]
    pub block_sensitive: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Signals for one fingerprint inside this window share one refetch.
    #[serde(default = "default_coalesce_window", with = "duration_string")]
    pub coalesce_window: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            coalesce_window: default_coalesce_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransactionsConfig {
    #[serde(default = "default_inclusion_timeout", with = "duration_string")]
    pub inclusion_timeout: Duration,
    #[serde(default = "default_receipt_poll_interval", with = "duration_string")]
    pub receipt_poll_interval: Duration,
    /// Upper bound on waiting for affected entries to reload after a
    /// confirmation.
    #[serde(default = "default_settle_timeout", with = "duration_string")]
    pub settle_timeout: Duration,
    /// How long a terminal record stays visible before the slot returns to
    /// idle.
    #[serde(default = "default_display_window", with = "duration_string")]
    pub display_window: Duration,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            inclusion_timeout: default_inclusion_timeout(),
            receipt_poll_interval: default_receipt_poll_interval(),
            settle_timeout: default_settle_timeout(),
            display_window: default_display_window(),
        }
    }
}

/// How to read an entity kind from the ledger.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntityConfig {
    pub kind: EntityKind,
    pub contract: Template,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Template>,
    pub returns: Vec<String>,
}

/// A `(fingerprint template)` an event or action points at. Without an
/// identity the whole kind is targeted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub kind: EntityKind,
    pub identity: Option<Template>,
    #[serde(default)]
    pub params: Vec<Template>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventConfig {
    pub contract: String,
    /// Event signature, e.g. `Deposit(address,uint256)`.
    pub event: String,
    pub invalidates: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionConfig {
    pub slot: String,
    pub contract: Template,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Template>,
    /// Native value sent with the transaction, in wei.
    pub value: Option<Template>,
    #[serde(default)]
    pub affects: Vec<TargetConfig>,
    #[serde(default)]
    pub preflight: Vec<PreflightCheck>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreflightCheck {
    /// Reported when the check fails, e.g. "pool is paused".
    pub description: String,
    pub contract: String,
    pub function: String,
    #[serde(default = "default_check_returns")]
    pub returns: String,
    pub expect: Expectation,
}

/// Condition a preflight read must satisfy. `non-empty` matches non-empty
/// arrays; any other value must compare equal.
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    NonEmpty,
    Equals(Value),
}

impl Expectation {
    pub fn is_met(&self, actual: &Value) -> bool {
        match self {
            Expectation::NonEmpty => match actual {
                Value::Array(items) => !items.is_empty(),
                Value::String(s) => !s.is_empty(),
                _ => false,
            },
            // uint256 decodes to a decimal string; compare numbers by text.
            Expectation::Equals(Value::Number(n)) => match actual {
                Value::String(s) => *s == n.to_string(),
                other => other == &Value::Number(n.clone()),
            },
            Expectation::Equals(expected) => expected == actual,
        }
    }
}

impl Serialize for Expectation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Expectation::NonEmpty => serializer.serialize_str("non-empty"),
            Expectation::Equals(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Expectation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Ok(match v {
            Value::String(s) if s == "non-empty" => Expectation::NonEmpty,
            other => Expectation::Equals(other),
        })
    }
}

pub fn parse_duration_string(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(rest) = s.strip_suffix("ms") {
        let ms: u64 = rest.trim().parse().context("invalid ms value")?;
        return Ok(Duration::from_millis(ms));
    }
    if let Some(rest) = s.strip_suffix('s') {
        let secs: u64 = rest.trim().parse().context("invalid seconds value")?;
        return Ok(Duration::from_secs(secs));
    }
    if let Some(rest) = s.strip_suffix('m') {
        let mins: u64 = rest.trim().parse().context("invalid minutes value")?;
        return Ok(Duration::from_secs(mins * 60));
    }
    if let Some(rest) = s.strip_suffix('h') {
        let hours: u64 = rest.trim().parse().context("invalid hours value")?;
        return Ok(Duration::from_secs(hours * 3600));
    }
    // Try parsing as raw seconds
    let secs: u64 = s
        .parse()
        .context("invalid duration format, use e.g. '3s', '250ms', '1h'")?;
    Ok(Duration::from_secs(secs))
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Secs(u64),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration> {
        match self {
            RawDuration::Text(s) => parse_duration_string(&s),
            RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

/// `#[serde(with = ...)]` helper for duration strings.
pub mod duration_string {
    use super::*;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(d))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(d)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

pub mod option_duration_string {
    use super::*;

    pub fn serialize<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&format_duration(d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(d)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_true() -> bool {
    true
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(12)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_stale_after() -> Duration {
    Duration::from_secs(30)
}
fn default_coalesce_window() -> Duration {
    Duration::from_millis(50)
}
fn default_inclusion_timeout() -> Duration {
    Duration::from_secs(180)
}
fn default_receipt_poll_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_settle_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_display_window() -> Duration {
    Duration::from_secs(5)
}
fn default_check_returns() -> String {
    "bool".to_string()
}

/// Interpolate ${VAR} and ${VAR:-default} patterns in a string with environment variable values.
fn interpolate_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let expr = &caps[1];
        if let Some((var_name, default_val)) = expr.split_once(":-") {
            std::env::var(var_name)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default_val.to_string())
        } else {
            std::env::var(expr).unwrap_or_default()
        }
    })
    .to_string()
}

fn ensure_templates(
    templates: &[&Template],
    scope: Scope,
    has_account: bool,
    owner: &str,
) -> Result<()> {
    for t in templates {
        anyhow::ensure!(
            t.allowed_in(scope),
            "{owner}: placeholder '{t}' is not available here"
        );
        anyhow::ensure!(
            has_account || **t != Template::Account,
            "{owner}: '$account' used but chain.account is not set"
        );
        if let Template::Literal(s) = t
            && s.starts_with("0x")
            && s.len() == 42
        {
            anyhow::ensure!(abi::is_address(s), "{owner}: malformed address '{s}'");
        }
    }
    Ok(())
}

fn target_templates(target: &TargetConfig) -> Vec<&Template> {
    target.identity.iter().chain(target.params.iter()).collect()
}

fn parse_types(types: &[String], owner: &str) -> Result<Vec<AbiType>> {
    types
        .iter()
        .map(|t| {
            t.parse::<AbiType>()
                .map_err(|e| anyhow::anyhow!("{owner}: {e}"))
        })
        .collect()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        // Interpolate env vars before parsing
        let interpolated = interpolate_env_vars(raw);

        let config: Config =
            serde_yaml::from_str(&interpolated).with_context(|| "failed to parse config YAML")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let chain = &self.chain;
        anyhow::ensure!(
            chain.rpc_url.starts_with("http://") || chain.rpc_url.starts_with("https://"),
            "chain '{}' rpc_url must be an http(s) URL",
            chain.name
        );
        if let Some(ws) = &chain.ws_url {
            anyhow::ensure!(
                ws.starts_with("ws://") || ws.starts_with("wss://"),
                "chain '{}' ws_url must be a ws(s) URL",
                chain.name
            );
        }
        if let Some(account) = &chain.account {
            anyhow::ensure!(abi::is_address(account), "malformed account address '{account}'");
        }
        let has_account = chain.account.is_some();

        let mut kinds = HashSet::new();
        for policy in &self.cache.kinds {
            if !kinds.insert(policy.kind) {
                anyhow::bail!("duplicate cache policy for kind '{}'", policy.kind);
            }
            if let Some(d) = policy.stale_after {
                anyhow::ensure!(!d.is_zero(), "stale_after for '{}' must be positive", policy.kind);
            }
        }

        let mut kinds = HashSet::new();
        for entity in &self.entities {
            let owner = format!("entity '{}'", entity.kind);
            if !kinds.insert(entity.kind) {
                anyhow::bail!("duplicate entity definition for kind '{}'", entity.kind);
            }
            let sig: Signature = entity
                .function
                .parse()
                .map_err(|e| anyhow::anyhow!("{owner}: {e}"))?;
            anyhow::ensure!(
                sig.inputs.len() == entity.args.len(),
                "{owner}: '{}' takes {} arguments, {} given",
                entity.function,
                sig.inputs.len(),
                entity.args.len()
            );
            anyhow::ensure!(!entity.returns.is_empty(), "{owner}: returns must not be empty");
            parse_types(&entity.returns, &owner)?;
            let templates: Vec<&Template> =
                std::iter::once(&entity.contract).chain(entity.args.iter()).collect();
            ensure_templates(&templates, Scope::Entity, has_account, &owner)?;
        }

        for event in &self.events {
            let owner = format!("event '{}'", event.event);
            anyhow::ensure!(
                abi::is_address(&event.contract),
                "{owner}: malformed contract address '{}'",
                event.contract
            );
            event
                .event
                .parse::<Signature>()
                .map_err(|e| anyhow::anyhow!("{owner}: {e}"))?;
            anyhow::ensure!(
                !event.invalidates.is_empty(),
                "{owner}: invalidates must not be empty"
            );
            for target in &event.invalidates {
                ensure_templates(&target_templates(target), Scope::Event, has_account, &owner)?;
            }
        }

        let mut slots = HashSet::new();
        for action in &self.actions {
            let owner = format!("action '{}'", action.slot);
            anyhow::ensure!(!action.slot.is_empty(), "action slot must not be empty");
            if !slots.insert(action.slot.as_str()) {
                anyhow::bail!("duplicate action slot '{}'", action.slot);
            }
            let sig: Signature = action
                .function
                .parse()
                .map_err(|e| anyhow::anyhow!("{owner}: {e}"))?;
            anyhow::ensure!(
                sig.inputs.len() == action.args.len(),
                "{owner}: '{}' takes {} arguments, {} given",
                action.function,
                sig.inputs.len(),
                action.args.len()
            );
            let mut templates: Vec<&Template> = std::iter::once(&action.contract)
                .chain(action.args.iter())
                .chain(action.value.iter())
                .collect();
            for target in &action.affects {
                templates.extend(target_templates(target));
            }
            ensure_templates(&templates, Scope::Action, has_account, &owner)?;

            for check in &action.preflight {
                anyhow::ensure!(
                    abi::is_address(&check.contract),
                    "{owner}: preflight '{}' has malformed contract '{}'",
                    check.description,
                    check.contract
                );
                let sig: Signature = check
                    .function
                    .parse()
                    .map_err(|e| anyhow::anyhow!("{owner}: {e}"))?;
                anyhow::ensure!(
                    sig.inputs.is_empty(),
                    "{owner}: preflight '{}' must call a function without arguments",
                    check.function
                );
                parse_types(std::slice::from_ref(&check.returns), &owner)?;
            }
        }

        Ok(())
    }

    pub fn action(&self, slot: &str) -> Option<&ActionConfig> {
        self.actions.iter().find(|a| a.slot == slot)
    }
}
