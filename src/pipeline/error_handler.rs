//! Error and no-response hooks invoked by the route executor.

use super::{RouteRequest, RouteResponse};
use crate::error::AppError;
use crate::response::error_body;
use async_trait::async_trait;
use axum::http::StatusCode;

/// Returning `Some(false)` from `handle_route_error` for a policy failure tells the
/// executor to swallow the error instead of re-raising it.
#[async_trait]
pub trait RouteErrorHandler: Send + Sync + 'static {
    async fn handle_route_error(
        &self,
        error: &AppError,
        req: &mut RouteRequest,
        res: &mut RouteResponse,
    ) -> Option<bool>;

    /// Called when a handler finished without producing a response.
    async fn handle_no_route_response(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Option<bool>;
}

/// Writes the error envelope with the status mapped from the error kind. Leaves
/// handler-less responses alone so the executor answers 404.
pub struct DefaultErrorHandler;

#[async_trait]
impl RouteErrorHandler for DefaultErrorHandler {
    async fn handle_route_error(
        &self,
        error: &AppError,
        _req: &mut RouteRequest,
        res: &mut RouteResponse,
    ) -> Option<bool> {
        if !res.is_finalized() {
            write_error(res, error);
        }
        None
    }

    async fn handle_no_route_response(&self, _req: &mut RouteRequest, _res: &mut RouteResponse) -> Option<bool> {
        None
    }
}

pub(crate) fn synthesize(res: &mut RouteResponse, status: StatusCode, code: &str) {
    let message = status.canonical_reason().unwrap_or("Error").to_string();
    res.status(status).json(error_body(code, message, None));
}

fn write_error(res: &mut RouteResponse, error: &AppError) {
    let (status, _) = error.status_and_code();
    let body = serde_json::to_value(error.body()).unwrap_or_default();
    res.status(status).json(body);
}

/// Discard whatever was written and answer with the error's envelope instead.
pub(crate) fn replace_with_error(res: &mut RouteResponse, error: &AppError) {
    res.reset();
    write_error(res, error);
}
