//! Interceptors wrap the whole policy + handler chain.

use super::executor::RouteEndpoint;
use super::{RouteRequest, RouteResponse};
use crate::error::{AppError, ResolutionError};
use crate::inject::{Container, Injectable};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Run code around `next`. An interceptor may skip `next` entirely. It may only swallow
    /// an error from `next` once the response has been produced, and should record the
    /// suppression in the request context.
    async fn intercept(&self, req: &mut RouteRequest, res: &mut RouteResponse, next: Next<'_>) -> Result<(), AppError>;
}

/// The remainder of the chain. The policy + handler layer sits at its end.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    endpoint: &'a RouteEndpoint,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>], endpoint: &'a RouteEndpoint) -> Self {
        Next { chain, endpoint }
    }

    pub async fn run(self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.intercept(req, res, Next::new(rest, self.endpoint)).await,
            None => self.endpoint.execute(req, res).await,
        }
    }
}

/// Installed first on every route: logs failures and lets them through unless a response
/// already went out.
pub struct DefaultInterceptor;

#[async_trait]
impl Interceptor for DefaultInterceptor {
    async fn intercept(&self, req: &mut RouteRequest, res: &mut RouteResponse, next: Next<'_>) -> Result<(), AppError> {
        match next.run(req, res).await {
            Ok(()) => Ok(()),
            Err(e) if res.is_finalized() => {
                tracing::debug!(
                    request = req.context().request_index(),
                    method = %req.method,
                    path = %req.path,
                    error = %e,
                    "route error already answered"
                );
                req.context_mut().record_suppressed(&e);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    request = req.context().request_index(),
                    method = %req.method,
                    path = %req.path,
                    error = %e,
                    "route failed"
                );
                Err(e)
            }
        }
    }
}

/// Interceptor declaration: a type built through the container, or a ready instance.
#[derive(Clone)]
pub enum InterceptorRef {
    Type {
        name: &'static str,
        resolve: fn(&Container) -> Result<Arc<dyn Interceptor>, ResolutionError>,
    },
    Instance(Arc<dyn Interceptor>),
}

fn resolve_interceptor<I: Interceptor + Injectable>(container: &Container) -> Result<Arc<dyn Interceptor>, ResolutionError> {
    let interceptor: Arc<dyn Interceptor> = container.resolve::<I>()?;
    Ok(interceptor)
}

impl InterceptorRef {
    pub fn of<I: Interceptor + Injectable>() -> Self {
        InterceptorRef::Type {
            name: std::any::type_name::<I>(),
            resolve: resolve_interceptor::<I>,
        }
    }

    pub fn instance<I: Interceptor>(interceptor: I) -> Self {
        InterceptorRef::Instance(Arc::new(interceptor))
    }

    pub fn resolve(&self, container: &Container) -> Result<Arc<dyn Interceptor>, ResolutionError> {
        match self {
            InterceptorRef::Type { resolve, .. } => resolve(container),
            InterceptorRef::Instance(i) => Ok(Arc::clone(i)),
        }
    }
}

impl fmt::Debug for InterceptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptorRef::Type { name, .. } => write!(f, "Interceptor({})", name),
            InterceptorRef::Instance(_) => f.write_str("Interceptor(instance)"),
        }
    }
}
