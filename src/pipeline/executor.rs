//! Per-route execution: interceptors, then policies, then the controller handler.

use super::error_handler::{synthesize, RouteErrorHandler};
use super::interceptor::{Interceptor, Next};
use super::{RequestContext, RouteRequest, RouteResponse};
use crate::controller::{Controller, RouteDescriptor};
use crate::error::AppError;
use crate::policy::ResolvedPolicy;
use axum::http::StatusCode;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Request counters shared by every route of one application. Observability only.
#[derive(Debug, Default)]
pub struct PipelineStats {
    next_index: AtomicU64,
    in_flight: AtomicUsize,
}

impl PipelineStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn requests_seen(&self) -> u64 {
        self.next_index.load(Ordering::Relaxed)
    }
}

struct InFlight<'a>(&'a PipelineStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a PipelineStats) -> Self {
        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Policy,
    Handler,
}

/// Innermost layer: the route's policy chain and its handler.
pub struct RouteEndpoint {
    descriptor: RouteDescriptor,
    policies: Vec<ResolvedPolicy>,
    controller: Arc<dyn Controller>,
    error_handler: Arc<dyn RouteErrorHandler>,
}

impl RouteEndpoint {
    pub fn new(
        descriptor: RouteDescriptor,
        policies: Vec<ResolvedPolicy>,
        controller: Arc<dyn Controller>,
        error_handler: Arc<dyn RouteErrorHandler>,
    ) -> Self {
        RouteEndpoint {
            descriptor,
            policies,
            controller,
            error_handler,
        }
    }

    pub fn descriptor(&self) -> &RouteDescriptor {
        &self.descriptor
    }

    pub(crate) async fn execute(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        for resolved in &self.policies {
            match resolved.policy.handle(req, res).await {
                Ok(value) => req.context_mut().record_policy_result(resolved.id, value),
                Err(e) => {
                    tracing::debug!(policy = %resolved.id, route = %self.descriptor, error = %e, "policy failed");
                    return self.fail(Stage::Policy, e, req, res).await;
                }
            }
            if res.is_finalized() {
                tracing::debug!(policy = %resolved.id, route = %self.descriptor, "policy answered the request");
                return Ok(());
            }
        }

        if let Err(e) = self.controller.handle(&self.descriptor.handler, req, res).await {
            return self.fail(Stage::Handler, e, req, res).await;
        }

        if !res.is_finalized() {
            self.error_handler.handle_no_route_response(req, res).await;
            if !res.is_finalized() {
                tracing::warn!(route = %self.descriptor, "handler sent no response");
                synthesize(res, StatusCode::NOT_FOUND, "not_found");
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        stage: Stage,
        error: AppError,
        req: &mut RouteRequest,
        res: &mut RouteResponse,
    ) -> Result<(), AppError> {
        let verdict = self.error_handler.handle_route_error(&error, req, res).await;
        if !res.is_finalized() {
            synthesize(res, StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
        if stage == Stage::Policy && verdict == Some(false) {
            req.context_mut().record_suppressed(&error);
            return Ok(());
        }
        Err(error)
    }
}

/// Everything needed to serve one route: its interceptor chain and endpoint.
pub struct RoutePipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    endpoint: RouteEndpoint,
    stats: Arc<PipelineStats>,
}

impl RoutePipeline {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>, endpoint: RouteEndpoint, stats: Arc<PipelineStats>) -> Self {
        RoutePipeline {
            interceptors,
            endpoint,
            stats,
        }
    }

    pub fn descriptor(&self) -> &RouteDescriptor {
        self.endpoint.descriptor()
    }

    /// Run the chain. Errors come back after the error handler has seen them so outer
    /// callers (transactions) can react.
    pub async fn run(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        let index = self.stats.next_index.fetch_add(1, Ordering::Relaxed);
        let _in_flight = InFlight::enter(&self.stats);
        req.set_context(RequestContext::new(index, self.descriptor().handler.clone()));
        Next::new(&self.interceptors, &self.endpoint).run(req, res).await
    }

    /// Run the chain and always hand back a response.
    pub async fn serve(&self, mut req: RouteRequest) -> RouteResponse {
        let mut res = RouteResponse::new();
        if let Err(e) = self.run(&mut req, &mut res).await {
            if !res.is_finalized() {
                tracing::warn!(route = %self.descriptor(), error = %e, "unanswered route error");
                synthesize(&mut res, StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
            }
        }
        res
    }
}
