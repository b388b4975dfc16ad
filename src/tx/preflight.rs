use std::sync::Arc;

use serde::Serialize;

use crate::cache::{Loader, ReadCache};
use crate::catalog::Catalog;
use crate::config::PreflightCheck;

/// Outcome of one precondition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub description: String,
    pub passed: bool,
    pub detail: String,
}

/// Evaluates action preconditions through the read cache. Every check runs;
/// all failures are reported together.
#[derive(Clone)]
pub struct Preflight {
    cache: ReadCache,
    loader: Arc<dyn Loader>,
}

impl Preflight {
    pub fn new(cache: ReadCache, loader: Arc<dyn Loader>) -> Self {
        Self { cache, loader }
    }

    pub async fn run(&self, checks: &[PreflightCheck]) -> Vec<CheckResult> {
        let evaluations = checks.iter().map(|check| self.evaluate(check));
        futures_util::future::join_all(evaluations).await
    }

    /// Descriptions of the failed checks; empty when the action may proceed.
    pub async fn issues(&self, checks: &[PreflightCheck]) -> Vec<String> {
        self.run(checks)
            .await
            .into_iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: {}", r.description, r.detail))
            .collect()
    }

    async fn evaluate(&self, check: &PreflightCheck) -> CheckResult {
        let fp = Catalog::status_fingerprint(&check.contract, &check.function, &check.returns);
        let (passed, detail) = match self.cache.request(&fp, self.loader.clone()).await {
            Ok(value) if check.expect.is_met(&value) => (true, format!("{} = {value}", check.function)),
            Ok(value) => (false, format!("{} = {value}", check.function)),
            // A check that cannot be read counts as failed.
            Err(e) => (false, format!("status unknown ({e})")),
        };
        CheckResult {
            description: check.description.clone(),
            passed,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Fingerprint, LoadFuture};
    use crate::config::{CacheConfig, Expectation};
    use crate::error::ReadError;
    use crate::retry::RetryPolicy;
    use futures_util::FutureExt;
    use serde_json::{Value, json};
    use std::collections::HashMap;

    const POOL: &str = "0x1111111111111111111111111111111111111111";
    const AGGREGATOR: &str = "0x3333333333333333333333333333333333333333";

    fn checks() -> Vec<PreflightCheck> {
        vec![
            PreflightCheck {
                description: "pool is paused".into(),
                contract: POOL.into(),
                function: "paused()".into(),
                returns: "bool".into(),
                expect: Expectation::Equals(json!(false)),
            },
            PreflightCheck {
                description: "deposits are paused".into(),
                contract: AGGREGATOR.into(),
                function: "depositsPaused()".into(),
                returns: "bool".into(),
                expect: Expectation::Equals(json!(false)),
            },
            PreflightCheck {
                description: "no active vaults".into(),
                contract: AGGREGATOR.into(),
                function: "activeVaultsList()".into(),
                returns: "address[]".into(),
                expect: Expectation::NonEmpty,
            },
        ]
    }

    /// Answers status reads from a table keyed by fingerprint string.
    fn table(entries: Vec<(String, Result<Value, ReadError>)>) -> Preflight {
        let table: Arc<HashMap<String, Result<Value, ReadError>>> =
            Arc::new(entries.into_iter().collect());
        let loader = Arc::new(move |fp: &Fingerprint| -> LoadFuture {
            let result = table
                .get(&fp.to_string())
                .cloned()
                .unwrap_or_else(|| Err(ReadError::Permanent("unknown".into())));
            async move { result }.boxed()
        });
        let cache = ReadCache::new(&CacheConfig {
            retry: RetryPolicy::no_retry(),
            ..CacheConfig::default()
        });
        Preflight::new(cache, loader)
    }

    fn key(contract: &str, function: &str, returns: &str) -> String {
        Catalog::status_fingerprint(contract, function, returns).to_string()
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let preflight = table(vec![
            (key(POOL, "paused()", "bool"), Ok(json!(false))),
            (key(AGGREGATOR, "depositsPaused()", "bool"), Ok(json!(false))),
            (
                key(AGGREGATOR, "activeVaultsList()", "address[]"),
                Ok(json!(["0x4444444444444444444444444444444444444444"])),
            ),
        ]);
        assert!(preflight.issues(&checks()).await.is_empty());
    }

    #[tokio::test]
    async fn test_collects_every_failure() {
        let preflight = table(vec![
            (key(POOL, "paused()", "bool"), Ok(json!(true))),
            (key(AGGREGATOR, "depositsPaused()", "bool"), Ok(json!(false))),
            (key(AGGREGATOR, "activeVaultsList()", "address[]"), Ok(json!([]))),
        ]);
        let issues = preflight.issues(&checks()).await;
        assert_eq!(issues.len(), 2);
        assert!(issues[0].starts_with("pool is paused"));
        assert!(issues[1].starts_with("no active vaults"));
    }

    #[tokio::test]
    async fn test_unreadable_status_fails_the_check() {
        let preflight = table(vec![
            (key(POOL, "paused()", "bool"), Ok(json!(false))),
            (key(AGGREGATOR, "activeVaultsList()", "address[]"), Ok(json!(["0x44"]))),
        ]);
        let results = preflight.run(&checks()).await;
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!(results[1].detail.contains("status unknown"));
    }
}
