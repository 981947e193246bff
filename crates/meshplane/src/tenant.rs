use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::MeshError;
use crate::types::TenantId;

/// Per-tenant engine hosted by this process.
pub trait TenantEngine: Send + Sync {
    fn tenant_id(&self) -> &TenantId;
}

/// Finds the local engine for a tenant. `Ok(None)` means no engine is
/// registered; `Err` means the lookup itself failed.
#[async_trait]
pub trait TenantEngineLookup<E: ?Sized + Send + Sync>: Send + Sync {
    async fn engine(&self, tenant_id: &TenantId) -> Result<Option<Arc<E>>, MeshError>;
}

/// Concurrent map of tenant id to engine.
pub struct TenantEngineMap<E: ?Sized> {
    engines: DashMap<TenantId, Arc<E>>,
}

impl<E: ?Sized> TenantEngineMap<E> {
    pub fn new() -> Self {
        Self {
            engines: DashMap::new(),
        }
    }

    /// Register an engine, returning the one it replaced.
    pub fn insert(&self, tenant_id: TenantId, engine: Arc<E>) -> Option<Arc<E>> {
        self.engines.insert(tenant_id, engine)
    }

    pub fn remove(&self, tenant_id: &TenantId) -> Option<Arc<E>> {
        self.engines.remove(tenant_id).map(|(_, e)| e)
    }

    pub fn get(&self, tenant_id: &TenantId) -> Option<Arc<E>> {
        self.engines.get(tenant_id).map(|e| Arc::clone(e.value()))
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<_> = self.engines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl<E: ?Sized> Default for TenantEngineMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: ?Sized + Send + Sync> TenantEngineLookup<E> for TenantEngineMap<E> {
    async fn engine(&self, tenant_id: &TenantId) -> Result<Option<Arc<E>>, MeshError> {
        Ok(self.get(tenant_id))
    }
}

/// Resolves a tenant id to its local engine, distinguishing "not hosted
/// here" from "lookup failed". An engine serving a different tenant than
/// the one asked for is treated as a failed lookup.
pub struct TenantResolver<E: ?Sized + TenantEngine> {
    lookup: Arc<dyn TenantEngineLookup<E>>,
}

impl<E: ?Sized + TenantEngine> TenantResolver<E> {
    pub fn new(lookup: Arc<dyn TenantEngineLookup<E>>) -> Self {
        Self { lookup }
    }

    pub async fn resolve(&self, tenant_id: &TenantId) -> Result<Arc<E>, MeshError> {
        match self.lookup.engine(tenant_id).await {
            Ok(Some(engine)) if engine.tenant_id() == tenant_id => Ok(engine),
            Ok(Some(engine)) => Err(MeshError::ServiceUnavailable {
                reason: format!(
                    "tenant engine lookup for {tenant_id} returned the engine of {}",
                    engine.tenant_id()
                ),
                source: None,
            }),
            Ok(None) => Err(MeshError::TenantNotFound {
                tenant_id: tenant_id.clone(),
            }),
            Err(e) => Err(MeshError::ServiceUnavailable {
                reason: format!("tenant engine lookup failed for {tenant_id}"),
                source: Some(Box::new(e)),
            }),
        }
    }
}

impl<E: ?Sized + TenantEngine> Clone for TenantResolver<E> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
        }
    }
}

/// Tenant a piece of work runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }
}

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Run `f` with `context` as the ambient tenant. The context is visible only
/// inside `f` and is not inherited by tasks it spawns.
pub async fn with_tenant<F: Future>(context: TenantContext, f: F) -> F::Output {
    CURRENT_TENANT.scope(context, f).await
}

/// Ambient tenant of the current call, if any.
pub fn current_tenant() -> Option<TenantContext> {
    CURRENT_TENANT.try_with(Clone::clone).ok()
}
