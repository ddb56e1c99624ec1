//! Route-level request/response pair and the per-request context.

use crate::policy::PolicyId;
use axum::http::{header::HeaderName, Extensions, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use std::collections::HashMap;

/// Per-request state. Owned by one request's execution, never shared.
#[derive(Debug, Default)]
pub struct RequestContext {
    request_index: u64,
    route_method: String,
    policy_results: Vec<(PolicyId, Value)>,
    suppressed: Vec<String>,
    extensions: Extensions,
}

impl RequestContext {
    pub fn new(request_index: u64, route_method: impl Into<String>) -> Self {
        RequestContext {
            request_index,
            route_method: route_method.into(),
            ..Default::default()
        }
    }

    /// Monotonic index assigned on arrival. Diagnostic only.
    pub fn request_index(&self) -> u64 {
        self.request_index
    }

    /// Name of the controller method serving this request.
    pub fn route_method(&self) -> &str {
        &self.route_method
    }

    pub fn record_policy_result(&mut self, id: PolicyId, value: Value) {
        self.policy_results.push((id, value));
    }

    /// Result of the policy at `index` in chain order.
    pub fn policy_result(&self, index: usize) -> Option<&Value> {
        self.policy_results.get(index).map(|(_, v)| v)
    }

    pub fn policy_result_of(&self, id: &PolicyId) -> Option<&Value> {
        self.policy_results
            .iter()
            .find(|(pid, _)| pid == id)
            .map(|(_, v)| v)
    }

    /// Result recorded by policy type `P`.
    pub fn policy_result_for<P: 'static>(&self) -> Option<&Value> {
        self.policy_result_of(&PolicyId::of::<P>())
    }

    pub fn policy_results(&self) -> impl Iterator<Item = &(PolicyId, Value)> {
        self.policy_results.iter()
    }

    /// Remember an error an interceptor chose not to propagate.
    pub fn record_suppressed(&mut self, error: impl ToString) {
        self.suppressed.push(error.to_string());
    }

    pub fn suppressed_errors(&self) -> &[String] {
        &self.suppressed
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

#[derive(Debug)]
pub struct RouteRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Value,
    context: RequestContext,
}

impl RouteRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        RouteRequest {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            params: HashMap::new(),
            query: HashMap::new(),
            body: Value::Null,
            context: RequestContext::default(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), v);
        }
        self
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut RequestContext {
        &mut self.context
    }

    pub(crate) fn set_context(&mut self, context: RequestContext) {
        self.context = context;
    }
}

/// Mutable response. A response counts as produced once its status was set or a body
/// was sent; the pipeline polls that to detect short-circuits.
#[derive(Debug)]
pub struct RouteResponse {
    status: StatusCode,
    status_changed: bool,
    headers: HeaderMap,
    body: Option<Value>,
    sent: bool,
}

impl Default for RouteResponse {
    fn default() -> Self {
        RouteResponse {
            status: StatusCode::OK,
            status_changed: false,
            headers: HeaderMap::new(),
            body: None,
            sent: false,
        }
    }
}

impl RouteResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self.status_changed = true;
        self
    }

    pub fn header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    /// Send a JSON body. Later sends overwrite the body but the response stays sent.
    pub fn json(&mut self, body: Value) -> &mut Self {
        self.body = Some(body);
        self.sent = true;
        self
    }

    /// Set the status and send an empty body.
    pub fn send_status(&mut self, status: StatusCode) -> &mut Self {
        self.status(status);
        self.sent = true;
        self
    }

    /// Drop status, headers and body written so far.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn headers_sent(&self) -> bool {
        self.sent
    }

    pub fn is_finalized(&self) -> bool {
        self.sent || self.status_changed
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

impl IntoResponse for RouteResponse {
    fn into_response(self) -> Response {
        let mut response = match self.body {
            Some(body) => (self.status, Json(body)).into_response(),
            None => self.status.into_response(),
        };
        response.headers_mut().extend(self.headers);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_response_is_not_finalized() {
        let res = RouteResponse::new();
        assert!(!res.is_finalized());
        assert!(!res.headers_sent());
        assert_eq!(res.status_code(), StatusCode::OK);
    }

    #[test]
    fn status_change_or_body_finalizes() {
        let mut res = RouteResponse::new();
        res.status(StatusCode::UNAUTHORIZED);
        assert!(res.is_finalized());
        assert!(!res.headers_sent());

        let mut res = RouteResponse::new();
        res.json(json!({"ok": true}));
        assert!(res.is_finalized());
        assert!(res.headers_sent());
    }

    #[test]
    fn policy_results_by_index_and_identity() {
        struct Auth;
        let mut ctx = RequestContext::new(3, "create");
        ctx.record_policy_result(PolicyId::of::<Auth>(), json!({"user": "ada"}));
        ctx.record_policy_result(PolicyId::Inline(9), Value::Null);

        assert_eq!(ctx.request_index(), 3);
        assert_eq!(ctx.route_method(), "create");
        assert_eq!(ctx.policy_result(0), Some(&json!({"user": "ada"})));
        assert_eq!(ctx.policy_result_for::<Auth>(), Some(&json!({"user": "ada"})));
        assert_eq!(ctx.policy_result_of(&PolicyId::Inline(9)), Some(&Value::Null));
        assert!(ctx.policy_result(2).is_none());
    }

    #[test]
    fn request_builders() {
        let req = RouteRequest::new(Method::POST, "/api/widgets/create")
            .with_header("x-api-key", "k1")
            .with_param("id", "4");
        assert_eq!(req.header("x-api-key"), Some("k1"));
        assert_eq!(req.param("id"), Some("4"));
        assert!(req.header("authorization").is_none());
    }
}
