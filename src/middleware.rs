use crate::error::AdmissionError;
use crate::key::RequestIdentity;
use crate::service::AdmissionService;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// What the admission check needs to know about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Caller identity.
    pub identity: RequestIdentity,
    /// Request path.
    pub endpoint: String,
    /// Units consumed.
    pub cost: u32,
}

impl AdmissionRequest {
    /// A cost-1 request.
    pub fn new(identity: RequestIdentity, endpoint: impl Into<String>) -> Self {
        Self { identity, endpoint: endpoint.into(), cost: 1 }
    }

    /// Override the cost.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

/// Pulls identity, path and cost out of a host request.
pub trait IdentityExtractor<Req>: Clone + Send + Sync + 'static {
    /// Describe `req` for admission.
    fn extract(&self, req: &Req) -> AdmissionRequest;
}

impl<Req, F> IdentityExtractor<Req> for F
where
    F: Fn(&Req) -> AdmissionRequest + Clone + Send + Sync + 'static,
{
    fn extract(&self, req: &Req) -> AdmissionRequest {
        self(req)
    }
}

/// A layer that runs every request through an [`AdmissionService`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer<X> {
    admission: AdmissionService,
    extractor: X,
}

impl<X> AdmissionLayer<X> {
    /// Create a new admission layer.
    pub fn new(admission: AdmissionService, extractor: X) -> Self {
        Self { admission, extractor }
    }
}

impl<S, X: Clone> Layer<S> for AdmissionLayer<X> {
    type Service = AdmissionMiddleware<S, X>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionMiddleware {
            inner: service,
            admission: self.admission.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service that rejects denied requests before they reach `S`.
///
/// Denies surface as [`AdmissionError::Rejected`] carrying the decision, so
/// the host can render status, headers and body from it.
#[derive(Clone, Debug)]
pub struct AdmissionMiddleware<S, X> {
    inner: S,
    admission: AdmissionService,
    extractor: X,
}

impl<S, X, Req> Service<Req> for AdmissionMiddleware<S, X>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    S::Response: Send + 'static,
    X: IdentityExtractor<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let request = self.extractor.extract(&req);
        let admission = self.admission.clone();
        // Take the service that was driven to readiness; leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = admission
                .evaluate_with_cost(&request.identity, &request.endpoint, request.cost)
                .await;
            if decision.is_denied() {
                return Err(AdmissionError::Rejected(decision));
            }
            inner.call(req).await.map_err(AdmissionError::Inner)
        })
    }
}
