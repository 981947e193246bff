use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::error::MeshError;
use crate::tenant::{with_tenant, TenantContext, TenantEngine, TenantResolver};
use crate::types::TenantId;

/// Request metadata key carrying the tenant id.
pub const TENANT_ID_HEADER: &str = "tenant-id";

/// Per-call metadata relevant to routing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    tenant_id: Option<TenantId>,
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
        }
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    /// Read the tenant id header. Missing, empty and non-ASCII values are all
    /// treated as absent.
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let tenant_id = metadata
            .get(TENANT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(TenantId::new);
        Self { tenant_id }
    }

    /// Tenant id placed in the request extensions by [`TenantInterceptor`],
    /// falling back to the raw header.
    pub fn from_request<T>(request: &tonic::Request<T>) -> Self {
        match request.extensions().get::<TenantId>() {
            Some(tenant_id) => Self::for_tenant(tenant_id.clone()),
            None => Self::from_metadata(request.metadata()),
        }
    }
}

/// Terminal response channel of one call. Consumed by the single `send`.
pub struct Responder<T> {
    tx: oneshot::Sender<Result<T, Status>>,
}

/// Receiving end paired with a [`Responder`].
pub struct ResponseReceiver<T> {
    rx: oneshot::Receiver<Result<T, Status>>,
}

impl<T> Responder<T> {
    pub fn channel() -> (Self, ResponseReceiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, ResponseReceiver { rx })
    }

    /// Deliver the terminal response. Returns `false` if the caller has
    /// gone away.
    pub fn send(self, response: Result<T, Status>) -> bool {
        self.tx.send(response).is_ok()
    }

    pub fn ok(self, value: T) -> bool {
        self.send(Ok(value))
    }

    pub fn error(self, status: Status) -> bool {
        self.send(Err(status))
    }
}

impl<T> ResponseReceiver<T> {
    /// Wait for the terminal response. A responder dropped without sending
    /// surfaces as an internal error.
    pub async fn recv(self) -> Result<T, Status> {
        match self.rx.await {
            Ok(response) => response,
            Err(_) => Err(Status::internal("call completed without a response")),
        }
    }
}

/// Entry point for tenant-scoped calls. Resolves the engine for the tenant
/// named in the call metadata and forwards the call to it with the tenant as
/// ambient context.
pub struct RequestRouter<E: ?Sized + TenantEngine> {
    resolver: TenantResolver<E>,
}

impl<E: ?Sized + TenantEngine> RequestRouter<E> {
    pub fn new(resolver: TenantResolver<E>) -> Self {
        Self { resolver }
    }

    /// Resolve the tenant engine for a call.
    pub async fn engine_for(
        &self,
        metadata: &CallMetadata,
        operation: &str,
    ) -> Result<(TenantContext, Arc<E>), MeshError> {
        let tenant_id = metadata
            .tenant_id()
            .cloned()
            .ok_or_else(|| MeshError::MissingTenantId {
                operation: operation.to_string(),
            })?;
        let engine = self.resolver.resolve(&tenant_id).await?;
        Ok((TenantContext::new(tenant_id), engine))
    }

    /// Forward `request` and `responder` to the engine. Resolution failures
    /// are written to the responder and the engine is not invoked.
    pub async fn route<Req, Resp, F, Fut>(
        &self,
        metadata: &CallMetadata,
        operation: &str,
        request: Req,
        responder: Responder<Resp>,
        forward: F,
    ) where
        F: FnOnce(Arc<E>, Req, Responder<Resp>) -> Fut,
        Fut: Future<Output = ()>,
    {
        match self.engine_for(metadata, operation).await {
            Ok((context, engine)) => {
                tracing::trace!(operation, tenant = %context.tenant_id, "forwarding call");
                with_tenant(context, forward(engine, request, responder)).await;
            }
            Err(e) => {
                tracing::warn!(operation, error = %e, "unable to route call");
                responder.error(e.into());
            }
        }
    }

    /// Unary convenience over [`RequestRouter::route`] for tonic handlers.
    pub async fn dispatch<Req, Resp, F, Fut>(
        &self,
        request: tonic::Request<Req>,
        operation: &str,
        call: F,
    ) -> Result<tonic::Response<Resp>, Status>
    where
        F: FnOnce(Arc<E>, Req) -> Fut,
        Fut: Future<Output = Result<Resp, MeshError>>,
    {
        let metadata = CallMetadata::from_request(&request);
        let (responder, response) = Responder::channel();
        self.route(
            &metadata,
            operation,
            request.into_inner(),
            responder,
            |engine, req, responder| async move {
                responder.send(call(engine, req).await.map_err(Status::from));
            },
        )
        .await;
        response.recv().await.map(tonic::Response::new)
    }
}

impl<E: ?Sized + TenantEngine> Clone for RequestRouter<E> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
        }
    }
}

/// Server interceptor copying the tenant id header into the request
/// extensions. With `required` set, calls without a tenant are rejected
/// before reaching any handler.
#[derive(Debug, Clone, Default)]
pub struct TenantInterceptor {
    required: bool,
}

impl TenantInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required() -> Self {
        Self { required: true }
    }
}

impl tonic::service::Interceptor for TenantInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        match CallMetadata::from_metadata(request.metadata()).tenant_id {
            Some(tenant_id) => {
                request.extensions_mut().insert(tenant_id);
                Ok(request)
            }
            None if self.required => Err(Status::unauthenticated(format!(
                "missing {TENANT_ID_HEADER} header"
            ))),
            None => Ok(request),
        }
    }
}
