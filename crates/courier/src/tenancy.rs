//! Routing of tenants to envelope stores.
//!
//! Reads go through an [`ArcSwap`] snapshot and never block. A miss takes the
//! population lock, re-checks the snapshot, asks the [`TenantSource`] and
//! publishes a new snapshot. Stores are shared per location, so many tenants
//! may resolve to the same store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::types::TenantId;

/// Maps a tenant to the connection string of its store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAssignment {
    pub tenant_id: TenantId,
    pub location: String,
}

impl TenantAssignment {
    pub fn new(tenant_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            tenant_id: TenantId::new(tenant_id),
            location: location.into(),
        }
    }
}

/// Where tenant assignments come from.
#[async_trait]
pub trait TenantSource: Send + Sync {
    async fn find_assignment(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<TenantAssignment>, DurableError>;

    async fn all_assignments(&self) -> Result<Vec<TenantAssignment>, DurableError>;
}

/// Builds the store for one location.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn build(&self, location: &str) -> Result<Arc<dyn MessageStore>, DurableError>;
}

/// Tenant assignments held in memory, e.g. from static configuration.
#[derive(Default)]
pub struct StaticTenantSource {
    assignments: parking_lot::RwLock<BTreeMap<TenantId, String>>,
}

impl StaticTenantSource {
    pub fn new(assignments: impl IntoIterator<Item = TenantAssignment>) -> Self {
        let source = Self::default();
        for assignment in assignments {
            source.assign(assignment);
        }
        source
    }

    pub fn assign(&self, assignment: TenantAssignment) {
        self.assignments
            .write()
            .insert(assignment.tenant_id, assignment.location);
    }

    pub fn remove(&self, tenant: &TenantId) {
        self.assignments.write().remove(tenant);
    }
}

#[async_trait]
impl TenantSource for StaticTenantSource {
    async fn find_assignment(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<TenantAssignment>, DurableError> {
        Ok(self
            .assignments
            .read()
            .get(tenant)
            .map(|location| TenantAssignment {
                tenant_id: tenant.clone(),
                location: location.clone(),
            }))
    }

    async fn all_assignments(&self) -> Result<Vec<TenantAssignment>, DurableError> {
        Ok(self
            .assignments
            .read()
            .iter()
            .map(|(tenant_id, location)| TenantAssignment {
                tenant_id: tenant_id.clone(),
                location: location.clone(),
            })
            .collect())
    }
}

#[derive(Clone, Default)]
struct TenantCache {
    tenants: HashMap<TenantId, Arc<dyn MessageStore>>,
    /// location -> store; ordered so `all_active_stores` is stable.
    locations: BTreeMap<String, Arc<dyn MessageStore>>,
}

pub struct TenantStoreRouter {
    main: Arc<dyn MessageStore>,
    source: Arc<dyn TenantSource>,
    factory: Arc<dyn StoreFactory>,
    cache: ArcSwap<TenantCache>,
    populate: tokio::sync::Mutex<()>,
}

impl TenantStoreRouter {
    pub fn new(
        main: Arc<dyn MessageStore>,
        source: Arc<dyn TenantSource>,
        factory: Arc<dyn StoreFactory>,
    ) -> Self {
        Self {
            main,
            source,
            factory,
            cache: ArcSwap::from_pointee(TenantCache::default()),
            populate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn main_store(&self) -> &Arc<dyn MessageStore> {
        &self.main
    }

    /// Envelopes without a tenant live in the main store.
    pub async fn store_for(
        &self,
        tenant: Option<&TenantId>,
    ) -> Result<Arc<dyn MessageStore>, DurableError> {
        match tenant {
            Some(tenant) => self.find_store(tenant).await,
            None => Ok(Arc::clone(&self.main)),
        }
    }

    /// Resolve a tenant's store, consulting the source on a cache miss.
    pub async fn find_store(&self, tenant: &TenantId) -> Result<Arc<dyn MessageStore>, DurableError> {
        if let Some(store) = self.cache.load().tenants.get(tenant) {
            return Ok(Arc::clone(store));
        }

        let _guard = self.populate.lock().await;
        let snapshot = self.cache.load_full();
        if let Some(store) = snapshot.tenants.get(tenant) {
            return Ok(Arc::clone(store));
        }

        let Some(assignment) = self.source.find_assignment(tenant).await? else {
            return Err(DurableError::UnknownTenant {
                tenant: tenant.clone(),
            });
        };
        let mut next = (*snapshot).clone();
        let store = self.store_at(&mut next, &assignment.location).await?;
        next.tenants.insert(tenant.clone(), Arc::clone(&store));
        self.cache.store(Arc::new(next));
        tracing::debug!(tenant = %tenant, store = %store.name(), "resolved tenant store");
        Ok(store)
    }

    /// Add the given assignments to the cache, building stores as needed.
    #[instrument(skip(self, assignments), fields(count = assignments.len()))]
    pub async fn seed_from_source(
        &self,
        assignments: &[TenantAssignment],
    ) -> Result<(), DurableError> {
        let _guard = self.populate.lock().await;
        let mut next = (*self.cache.load_full()).clone();
        for assignment in assignments {
            let store = self.store_at(&mut next, &assignment.location).await?;
            next.tenants.insert(assignment.tenant_id.clone(), store);
        }
        self.cache.store(Arc::new(next));
        Ok(())
    }

    /// Replace the tenant map with the source's current assignments.
    ///
    /// Stores for locations that are still assigned are reused; stores for
    /// locations no longer referenced are dropped from the cache.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), DurableError> {
        let assignments = self.source.all_assignments().await?;
        let _guard = self.populate.lock().await;
        let previous = self.cache.load_full();
        let mut next = TenantCache::default();
        for assignment in &assignments {
            if let Some(store) = previous.locations.get(&assignment.location) {
                next.locations
                    .insert(assignment.location.clone(), Arc::clone(store));
            }
            let store = self.store_at(&mut next, &assignment.location).await?;
            next.tenants.insert(assignment.tenant_id.clone(), store);
        }
        self.cache.store(Arc::new(next));
        Ok(())
    }

    /// The main store first, then each distinct tenant store.
    pub fn all_active_stores(&self) -> Vec<Arc<dyn MessageStore>> {
        let snapshot = self.cache.load();
        let mut stores = Vec::with_capacity(snapshot.locations.len() + 1);
        stores.push(Arc::clone(&self.main));
        for store in snapshot.locations.values() {
            if !Arc::ptr_eq(store, &self.main) {
                stores.push(Arc::clone(store));
            }
        }
        stores
    }

    /// Look a store up by its logical name, refreshing once on a miss.
    pub async fn store_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Arc<dyn MessageStore>>, DurableError> {
        if let Some(store) = self.find_by_name(name) {
            return Ok(Some(store));
        }
        self.refresh().await?;
        Ok(self.find_by_name(name))
    }

    fn find_by_name(&self, name: &str) -> Option<Arc<dyn MessageStore>> {
        self.all_active_stores()
            .into_iter()
            .find(|store| store.name() == name)
    }

    async fn store_at(
        &self,
        cache: &mut TenantCache,
        location: &str,
    ) -> Result<Arc<dyn MessageStore>, DurableError> {
        if let Some(store) = cache.locations.get(location) {
            return Ok(Arc::clone(store));
        }
        let store = self.factory.build(location).await?;
        cache
            .locations
            .insert(location.to_string(), Arc::clone(&store));
        tracing::info!(store = %store.name(), "opened tenant store");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilitySettings;
    use crate::storage::memory::MemoryEnvelopeStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl StoreFactory for CountingFactory {
        async fn build(&self, location: &str) -> Result<Arc<dyn MessageStore>, DurableError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new(MemoryEnvelopeStore::new(
                location,
                DurabilitySettings::default(),
            )?))
        }
    }

    fn router(
        assignments: Vec<TenantAssignment>,
    ) -> (Arc<TenantStoreRouter>, Arc<CountingFactory>, Arc<StaticTenantSource>) {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let source = Arc::new(StaticTenantSource::new(assignments));
        let main: Arc<dyn MessageStore> =
            Arc::new(MemoryEnvelopeStore::new("main", DurabilitySettings::default()).unwrap());
        let router = Arc::new(TenantStoreRouter::new(
            main,
            source.clone(),
            factory.clone(),
        ));
        (router, factory, source)
    }

    #[tokio::test]
    async fn concurrent_lookups_build_store_once() {
        let (router, factory, _) = router(vec![TenantAssignment::new("red", "db-red")]);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let router = Arc::clone(&router);
            handles.push(tokio::spawn(async move {
                router.find_store(&TenantId::new("red")).await.map(|s| s.name().to_string())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "db-red");
        }
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tenants_share_stores_per_location() {
        let (router, factory, _) = router(vec![
            TenantAssignment::new("red", "db-shared"),
            TenantAssignment::new("blue", "db-shared"),
            TenantAssignment::new("green", "db-green"),
        ]);
        let red = router.find_store(&TenantId::new("red")).await.unwrap();
        let blue = router.find_store(&TenantId::new("blue")).await.unwrap();
        assert!(Arc::ptr_eq(&red, &blue));
        router.find_store(&TenantId::new("green")).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);

        let names: Vec<String> = router
            .all_active_stores()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["main", "db-green", "db-shared"]);
    }

    #[tokio::test]
    async fn unknown_tenant_is_an_error() {
        let (router, _, _) = router(Vec::new());
        let err = router.find_store(&TenantId::new("nobody")).await.err().unwrap();
        assert!(matches!(err, DurableError::UnknownTenant { .. }));
    }

    #[tokio::test]
    async fn missing_tenant_is_found_after_source_update() {
        let (router, _, source) = router(Vec::new());
        assert!(router.find_store(&TenantId::new("late")).await.is_err());
        source.assign(TenantAssignment::new("late", "db-late"));
        let store = router.find_store(&TenantId::new("late")).await.unwrap();
        assert_eq!(store.name(), "db-late");
    }

    #[tokio::test]
    async fn no_tenant_routes_to_main() {
        let (router, _, _) = router(Vec::new());
        assert_eq!(router.store_for(None).await.unwrap().name(), "main");
    }

    #[tokio::test]
    async fn refresh_drops_unassigned_locations() {
        let (router, factory, source) = router(vec![
            TenantAssignment::new("red", "db-red"),
            TenantAssignment::new("blue", "db-blue"),
        ]);
        router.refresh().await.unwrap();
        assert_eq!(router.all_active_stores().len(), 3);

        source.remove(&TenantId::new("blue"));
        router.refresh().await.unwrap();
        assert_eq!(router.all_active_stores().len(), 2);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2, "db-red is reused");

        assert!(router.store_by_name("db-red").await.unwrap().is_some());
        assert!(router.store_by_name("db-blue").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seeding_populates_without_source_lookups() {
        let (router, _, _) = router(Vec::new());
        router
            .seed_from_source(&[TenantAssignment::new("red", "db-red")])
            .await
            .unwrap();
        assert_eq!(
            router.find_store(&TenantId::new("red")).await.unwrap().name(),
            "db-red"
        );
    }
}
