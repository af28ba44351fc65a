use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;

use crate::config::ClickHouseConfig;
use crate::store::Store;
use crate::tenant::{tenant_database, TenantKey};

use super::EventCache;

/// One tenant's cache together with its resolved database.
pub struct TenantCache {
    pub tenant: TenantKey,
    pub database: String,
    pub cache: Arc<EventCache>,
}

/// Owns the tenant to cache mapping.
///
/// With multi-tenancy disabled every key maps to one shared cache written
/// to the configured database.
pub struct TenantRegistry {
    cfg: ClickHouseConfig,
    multi_tenant: bool,
    shared: Arc<EventCache>,
    tenants: DashMap<TenantKey, Arc<EventCache>>,
}

impl TenantRegistry {
    pub fn new(cfg: ClickHouseConfig, multi_tenant: bool) -> Self {
        Self {
            cfg,
            multi_tenant,
            shared: Arc::new(EventCache::new()),
            tenants: DashMap::new(),
        }
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.multi_tenant
    }

    /// Database that records of `tenant` are written to.
    pub fn database_for(&self, tenant: &TenantKey) -> String {
        if self.multi_tenant {
            tenant_database(&tenant.tenant_id, &self.cfg)
        } else {
            self.cfg.database.clone()
        }
    }

    /// Returns the tenant's cache, initialising its database on first use.
    ///
    /// Initialisation runs without any map lock held. When two callers race
    /// on a new key both may initialise (the DDL is idempotent) but only the
    /// first insert wins and every caller gets that instance.
    pub async fn get_or_create<S: Store>(&self, tenant: &TenantKey, store: &S) -> Result<Arc<EventCache>> {
        if !self.multi_tenant {
            return Ok(Arc::clone(&self.shared));
        }

        let existing = self.tenants.get(tenant).map(|c| Arc::clone(c.value()));
        if let Some(cache) = existing {
            return Ok(cache);
        }

        let database = self.database_for(tenant);
        store
            .init_database(&database)
            .await
            .with_context(|| format!("initializing database {database} for tenant {:?}", tenant.tenant_id))?;

        let cache = Arc::clone(
            self.tenants
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(EventCache::new()))
                .value(),
        );

        tracing::info!(
            tenant_id = %tenant.tenant_id,
            account_id = %tenant.account_id,
            database = %database,
            "tenant cache created"
        );

        Ok(cache)
    }

    /// Like [`get_or_create`](Self::get_or_create), but a tenant whose
    /// database cannot be initialised terminates the process. There is no
    /// partial-service mode for an unwritable tenant.
    pub async fn get_or_abort<S: Store>(&self, tenant: &TenantKey, store: &S) -> Arc<EventCache> {
        match self.get_or_create(tenant, store).await {
            Ok(cache) => cache,
            Err(e) => {
                tracing::error!(tenant_id = %tenant.tenant_id, error = ?e, "tenant initialization failed, exiting");
                std::process::exit(1);
            }
        }
    }

    /// Caches of every known tenant, for the flush and signal tasks.
    pub fn snapshot(&self) -> Vec<TenantCache> {
        if !self.multi_tenant {
            return vec![TenantCache {
                tenant: TenantKey::none(),
                database: self.cfg.database.clone(),
                cache: Arc::clone(&self.shared),
            }];
        }

        self.tenants
            .iter()
            .map(|entry| TenantCache {
                tenant: entry.key().clone(),
                database: self.database_for(entry.key()),
                cache: Arc::clone(entry.value()),
            })
            .collect()
    }

    pub fn tenant_count(&self) -> usize {
        if self.multi_tenant {
            self.tenants.len()
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JvmGc;
    use crate::store::MemoryStore;

    fn multi_registry() -> TenantRegistry {
        TenantRegistry::new(ClickHouseConfig::default(), true)
    }

    #[tokio::test]
    async fn test_single_tenant_shares_cache() {
        let registry = TenantRegistry::new(ClickHouseConfig::default(), false);
        let store = MemoryStore::new();

        let a = registry.get_or_create(&TenantKey::new("a", "1"), &store).await.unwrap();
        let b = registry.get_or_create(&TenantKey::none(), &store).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(store.initialized().is_empty());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].database, "apo");
    }

    #[tokio::test]
    async fn test_same_key_same_instance() {
        let registry = multi_registry();
        let store = MemoryStore::new();
        let key = TenantKey::new("acme", "7");

        let first = registry.get_or_create(&key, &store).await.unwrap();
        let second = registry.get_or_create(&key, &store).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.initialized(), vec!["apo_tenant_acme".to_string()]);
        assert_eq!(registry.tenant_count(), 1);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let registry = multi_registry();
        let store = MemoryStore::new();

        let a = registry.get_or_create(&TenantKey::new("a", "1"), &store).await.unwrap();
        let b = registry.get_or_create(&TenantKey::new("b", "1"), &store).await.unwrap();
        a.jvm_gcs.append(JvmGc::default());

        assert!(b.jvm_gcs.drain().is_empty());
        assert_eq!(a.jvm_gcs.drain().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_yields_one_cache() {
        let registry = Arc::new(multi_registry());
        let store = Arc::new(MemoryStore::new());
        let key = TenantKey::new("racy", "1");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let store = Arc::clone(&store);
                let key = key.clone();
                tokio::spawn(async move { registry.get_or_create(&key, store.as_ref()).await.unwrap() })
            })
            .collect();

        let mut caches = Vec::new();
        for task in tasks {
            caches.push(task.await.unwrap());
        }
        assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
        assert_eq!(registry.tenant_count(), 1);
    }

    #[tokio::test]
    async fn test_init_failure_propagates() {
        let registry = multi_registry();
        let store = MemoryStore::new();
        store.fail_init(true);

        let Err(err) = registry
            .get_or_create(&TenantKey::new("broken", "1"), &store)
            .await
        else {
            panic!("initialization failure must not yield a cache");
        };
        assert!(err.to_string().contains("apo_tenant_broken"));
        assert_eq!(registry.tenant_count(), 0);
    }

    #[test]
    fn test_database_for_uses_resolution() {
        let mut cfg = ClickHouseConfig::default();
        cfg.tenant_db_map.insert("vip".to_string(), "vip_db".to_string());
        let registry = TenantRegistry::new(cfg, true);
        assert_eq!(registry.database_for(&TenantKey::new("vip", "1")), "vip_db");
        assert_eq!(registry.database_for(&TenantKey::new("x", "1")), "apo_tenant_x");
    }
}
