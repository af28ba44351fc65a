//! Tenant identity, tenant database resolution and the trace id to tenant
//! cache used by callbacks that only carry a trace id.

use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::config::ClickHouseConfig;

/// Placeholder substituted with the tenant id in database patterns.
pub const TENANT_ID_PLACEHOLDER: &str = "{TENANT_ID}";

/// Pattern used when neither an override nor a configured pattern matches.
pub const DEFAULT_TENANT_DATABASE_PATTERN: &str = "apo_tenant_{TENANT_ID}";

/// Identity of one tenant. Both fields take part in equality and hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    pub tenant_id: String,
    pub account_id: String,
}

impl TenantKey {
    pub fn new(tenant_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            account_id: account_id.into(),
        }
    }

    /// The distinguished key used when a request carries no tenant.
    pub fn none() -> Self {
        Self::default()
    }

    /// Resolve the tenant of a request. Missing tenant information maps to
    /// [`TenantKey::none`].
    pub fn from_request(tenant: Option<TenantKey>) -> Self {
        tenant.unwrap_or_default()
    }

    pub fn is_none(&self) -> bool {
        self.tenant_id.is_empty() && self.account_id.is_empty()
    }
}

/// Resolve the database holding a tenant's data.
///
/// The explicit map wins over the configured pattern, which wins over
/// [`DEFAULT_TENANT_DATABASE_PATTERN`].
pub fn tenant_database(tenant_id: &str, cfg: &ClickHouseConfig) -> String {
    if let Some(db) = cfg.tenant_db_map.get(tenant_id) {
        return db.clone();
    }

    if !cfg.tenant_db_pattern.is_empty() {
        return cfg.tenant_db_pattern.replace(TENANT_ID_PLACEHOLDER, tenant_id);
    }

    DEFAULT_TENANT_DATABASE_PATTERN.replace(TENANT_ID_PLACEHOLDER, tenant_id)
}

/// Bounded trace id to tenant map.
pub struct TraceTenantCache {
    cache: Cache<String, TenantKey>,
}

impl TraceTenantCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::new(capacity),
        }
    }

    pub fn store_tenant(&self, trace_id: &str, tenant: TenantKey) {
        self.cache.insert(trace_id.to_string(), tenant);
    }

    pub fn tenant_for_trace(&self, trace_id: &str) -> Option<TenantKey> {
        self.cache.get(trace_id)
    }

    /// Mark a trace as recently used without reading its tenant.
    pub fn touch(&self, trace_id: &str) {
        let _ = self.cache.get(trace_id);
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}
