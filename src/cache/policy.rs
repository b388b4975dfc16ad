use std::time::Duration;

use crate::cache::fingerprint::EntityKind;
use crate::config::CacheConfig;

/// Staleness window for entries of `kind`. The first matching kind policy wins;
/// unconfigured kinds fall back to `default_stale_after`.
pub fn resolve_stale_after(config: &CacheConfig, kind: EntityKind) -> Duration {
    config
        .kinds
        .iter()
        .find(|p| p.kind == kind)
        .and_then(|p| p.stale_after)
        .unwrap_or(config.default_stale_after)
}

/// Whether block ticks should expire entries of `kind`. Unconfigured kinds
/// are block-sensitive.
pub fn is_block_sensitive(config: &CacheConfig, kind: EntityKind) -> bool {
    config
        .kinds
        .iter()
        .find(|p| p.kind == kind)
        .map(|p| p.block_sensitive)
        .unwrap_or(true)
}

/// All kinds that react to block ticks.
pub fn block_sensitive_kinds(config: &CacheConfig) -> Vec<EntityKind> {
    EntityKind::ALL
        .into_iter()
        .filter(|k| is_block_sensitive(config, *k))
        .collect()
}
