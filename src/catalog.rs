//! Entity catalog: how each fingerprint is read from the ledger.
//!
//! Every configured kind maps to one contract call whose target and
//! arguments are templates over the fingerprint. `contract-status` has a
//! built-in rule when not configured: identity is the contract, the first
//! parameter is a no-argument getter and the optional second parameter is
//! its return type (`bool` by default).

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::cache::{EntityKind, Fingerprint, LoadFuture, Loader};
use crate::chain::abi::{AbiType, Signature};
use crate::chain::{Query, ReadProvider};
use crate::config::EntityConfig;
use crate::error::ReadError;
use crate::template::{Bindings, Template};

struct EntityRule {
    contract: Template,
    function: Signature,
    args: Vec<Template>,
    outputs: Vec<AbiType>,
}

/// A fully resolved read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCall {
    pub target: String,
    pub query: Query,
    pub args: Vec<String>,
}

pub struct Catalog {
    rules: HashMap<EntityKind, EntityRule>,
    account: Option<String>,
}

impl Catalog {
    pub fn from_config(entities: &[EntityConfig], account: Option<String>) -> anyhow::Result<Self> {
        let mut rules = HashMap::new();
        for e in entities {
            let function: Signature = e
                .function
                .parse()
                .map_err(|err| anyhow::anyhow!("entity '{}': {err}", e.kind))?;
            let outputs = e
                .returns
                .iter()
                .map(|t| t.parse::<AbiType>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| anyhow::anyhow!("entity '{}': {err}", e.kind))?;
            rules.insert(
                e.kind,
                EntityRule {
                    contract: e.contract.clone(),
                    function,
                    args: e.args.clone(),
                    outputs,
                },
            );
        }
        Ok(Self { rules, account })
    }

    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<EntityKind> = self.rules.keys().copied().collect();
        if !kinds.contains(&EntityKind::ContractStatus) {
            kinds.push(EntityKind::ContractStatus);
        }
        kinds.sort();
        kinds
    }

    /// Fingerprint of a no-argument status getter, e.g. `paused()`.
    pub fn status_fingerprint(contract: &str, function: &str, returns: &str) -> Fingerprint {
        let fp = Fingerprint::new(EntityKind::ContractStatus, contract).with_param(function);
        if returns == "bool" {
            fp
        } else {
            fp.with_param(returns)
        }
    }

    pub fn resolve(&self, fp: &Fingerprint) -> Result<ResolvedCall, ReadError> {
        match self.rules.get(&fp.kind) {
            Some(rule) => self.resolve_rule(rule, fp),
            None if fp.kind == EntityKind::ContractStatus => resolve_status(fp),
            None => Err(ReadError::Permanent(format!(
                "no entity definition for kind '{}'",
                fp.kind
            ))),
        }
    }

    fn resolve_rule(&self, rule: &EntityRule, fp: &Fingerprint) -> Result<ResolvedCall, ReadError> {
        let bindings = Bindings {
            identity: Some(&fp.identity),
            params: &fp.params,
            account: self.account.as_deref(),
            ..Default::default()
        };
        let unresolved =
            |t: &Template| ReadError::Permanent(format!("{fp}: cannot resolve '{t}'"));
        let target = rule
            .contract
            .resolve(&bindings)
            .ok_or_else(|| unresolved(&rule.contract))?;
        let bindings = Bindings {
            contract: Some(&target),
            ..bindings
        };
        let args = rule
            .args
            .iter()
            .map(|a| a.resolve(&bindings).ok_or_else(|| unresolved(a)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedCall {
            target,
            query: Query {
                function: rule.function.clone(),
                outputs: rule.outputs.clone(),
            },
            args,
        })
    }

    /// A [`Loader`] reading through `provider`.
    pub fn loader(self: &Arc<Self>, provider: Arc<dyn ReadProvider>) -> Arc<dyn Loader> {
        Arc::new(CatalogLoader {
            catalog: self.clone(),
            provider,
        })
    }
}

fn resolve_status(fp: &Fingerprint) -> Result<ResolvedCall, ReadError> {
    let bad = |reason: &str| ReadError::Permanent(format!("{fp}: {reason}"));
    let function: Signature = fp
        .params
        .first()
        .ok_or_else(|| bad("missing getter"))?
        .parse()
        .map_err(|e| bad(&format!("{e}")))?;
    if !function.inputs.is_empty() {
        return Err(bad("status getters take no arguments"));
    }
    let output = match fp.params.get(1) {
        Some(t) => t.parse::<AbiType>().map_err(|e| bad(&format!("{e}")))?,
        None => AbiType::Bool,
    };
    Ok(ResolvedCall {
        target: fp.identity.clone(),
        query: Query {
            function,
            outputs: vec![output],
        },
        args: Vec::new(),
    })
}

struct CatalogLoader {
    catalog: Arc<Catalog>,
    provider: Arc<dyn ReadProvider>,
}

impl Loader for CatalogLoader {
    fn load(&self, fingerprint: &Fingerprint) -> LoadFuture {
        let catalog = self.catalog.clone();
        let provider = self.provider.clone();
        let fp = fingerprint.clone();
        async move {
            let call = catalog.resolve(&fp)?;
            provider.call(&call.target, &call.query, &call.args).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    const POOL: &str = "0x1111111111111111111111111111111111111111";
    const USER: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";

    fn entities() -> Vec<EntityConfig> {
        vec![
            EntityConfig {
                kind: EntityKind::UserPosition,
                contract: Template::Literal(POOL.into()),
                function: "balanceOf(address)".into(),
                args: vec![Template::Identity],
                returns: vec!["uint256".into()],
            },
            EntityConfig {
                kind: EntityKind::TokenBalance,
                contract: Template::Identity,
                function: "balanceOf(address)".into(),
                args: vec![Template::Param(0)],
                returns: vec!["uint256".into()],
            },
        ]
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String, Vec<String>)>>);

    #[async_trait]
    impl ReadProvider for Recorder {
        async fn call(&self, target: &str, query: &Query, args: &[String]) -> Result<Value, ReadError> {
            self.0
                .lock()
                .unwrap()
                .push((target.to_string(), query.function.canonical(), args.to_vec()));
            Ok(json!("100"))
        }

        async fn block_number(&self) -> Result<u64, ReadError> {
            Ok(1)
        }
    }

    #[test]
    fn test_resolve_configured_kind() {
        let catalog = Catalog::from_config(&entities(), None).unwrap();
        let call = catalog
            .resolve(&Fingerprint::new(EntityKind::UserPosition, USER))
            .unwrap();
        assert_eq!(call.target, POOL);
        assert_eq!(call.args, vec![USER.to_string()]);
        assert_eq!(call.query.outputs, vec![AbiType::Uint256]);
    }

    #[test]
    fn test_resolve_identity_as_contract_with_params() {
        let catalog = Catalog::from_config(&entities(), None).unwrap();
        let fp = Fingerprint::new(EntityKind::TokenBalance, POOL).with_param(USER);
        let call = catalog.resolve(&fp).unwrap();
        assert_eq!(call.target, POOL);
        assert_eq!(call.args, vec![USER.to_string()]);

        let missing_param = Fingerprint::new(EntityKind::TokenBalance, POOL);
        assert!(matches!(
            catalog.resolve(&missing_param),
            Err(ReadError::Permanent(_))
        ));
    }

    #[test]
    fn test_unknown_kind_is_permanent() {
        let catalog = Catalog::from_config(&entities(), None).unwrap();
        let err = catalog
            .resolve(&Fingerprint::new(EntityKind::RoundState, "7"))
            .unwrap_err();
        assert!(matches!(err, ReadError::Permanent(_)));
    }

    #[test]
    fn test_builtin_status_rule() {
        let catalog = Catalog::from_config(&[], None).unwrap();
        let fp = Catalog::status_fingerprint(POOL, "paused()", "bool");
        assert_eq!(fp.to_string(), format!("contract-status:{POOL}:paused()"));
        let call = catalog.resolve(&fp).unwrap();
        assert_eq!(call.target, POOL);
        assert_eq!(call.query.outputs, vec![AbiType::Bool]);

        let vaults = Catalog::status_fingerprint(POOL, "activeVaultsList()", "address[]");
        let call = catalog.resolve(&vaults).unwrap();
        assert_eq!(call.query.outputs, vec![AbiType::AddressArray]);
        assert!(catalog.kinds().contains(&EntityKind::ContractStatus));
    }

    #[tokio::test]
    async fn test_loader_calls_provider() {
        let catalog = Arc::new(Catalog::from_config(&entities(), None).unwrap());
        let provider = Arc::new(Recorder::default());
        let loader = catalog.loader(provider.clone());
        let value = loader
            .load(&Fingerprint::new(EntityKind::UserPosition, USER))
            .await
            .unwrap();
        assert_eq!(value, json!("100"));
        let calls = provider.0.lock().unwrap();
        assert_eq!(calls[0].0, POOL);
        assert_eq!(calls[0].1, "balanceOf(address)");
    }
}
