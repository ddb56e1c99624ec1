//! Dispatch table and its axum mounting.

use super::reflector::route_key;
use super::{HttpMethod, RouteDescriptor};
use crate::error::AppError;
use crate::pipeline::{PipelineStats, RouteRequest, RoutePipeline};
use axum::extract::{Path, Query, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::Router;
use http_body_util::LengthLimitError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Registered routes, built once at startup and read-only afterwards.
#[derive(Clone)]
pub struct DispatchTable {
    routes: Vec<Arc<RoutePipeline>>,
    stats: Arc<PipelineStats>,
}

impl DispatchTable {
    pub(crate) fn new(routes: Vec<Arc<RoutePipeline>>, stats: Arc<PipelineStats>) -> Self {
        DispatchTable { routes, stats }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &RouteDescriptor> {
        self.routes.iter().map(|r| r.descriptor())
    }

    /// Route registered for `method` on a path template. Parameter names do not matter.
    pub fn find(&self, method: HttpMethod, path: &str) -> Option<&Arc<RoutePipeline>> {
        let key = route_key(path);
        self.routes
            .iter()
            .find(|r| r.descriptor().method == method && route_key(&r.descriptor().path) == key)
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Mount every route on an axum router, grouping methods that share a path. Routes
    /// are mounted with positional parameter names and handlers see the declared ones.
    pub fn router(&self) -> Router {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
        for pipeline in &self.routes {
            let descriptor = pipeline.descriptor();
            let (mounted, renames) = mount_path(&descriptor.path);
            let renames = Arc::new(renames);
            let route = Arc::clone(pipeline);
            let handler = move |params: Option<Path<HashMap<String, String>>>,
                                Query(query): Query<HashMap<String, String>>,
                                request: Request| {
                let route = Arc::clone(&route);
                let renames = Arc::clone(&renames);
                async move {
                    let params = params
                        .map(|Path(p)| p)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(name, value)| (declared_name(&renames, name), value))
                        .collect();
                    dispatch(route, params, query, request).await
                }
            };
            let methods = by_path.remove(&mounted).unwrap_or_default();
            by_path.insert(mounted, methods.on(descriptor.method.filter(), handler));
        }
        by_path
            .into_iter()
            .fold(Router::new(), |router, (path, methods)| router.route(&path, methods))
    }
}

/// Path as mounted on the router: `:name`/`*name` become `:p<i>`/`*p<i>` by segment
/// position. Returns the path and `(mounted, declared)` name pairs.
fn mount_path(path: &str) -> (String, Vec<(String, String)>) {
    let mut renames = Vec::new();
    let segments: Vec<String> = path
        .split('/')
        .enumerate()
        .map(|(i, seg)| match seg.chars().next() {
            Some(sigil @ (':' | '*')) => {
                let mounted = format!("p{}", i);
                renames.push((mounted.clone(), seg[1..].to_string()));
                format!("{}{}", sigil, mounted)
            }
            _ => seg.to_string(),
        })
        .collect();
    (segments.join("/"), renames)
}

fn declared_name(renames: &[(String, String)], mounted: String) -> String {
    renames
        .iter()
        .find(|(m, _)| *m == mounted)
        .map(|(_, declared)| declared.clone())
        .unwrap_or(mounted)
}

/// Whether a body read failed because the body limit layer cut the stream short.
fn exceeds_limit(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

async fn dispatch(
    route: Arc<RoutePipeline>,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) if exceeds_limit(&e) => return AppError::PayloadTooLarge(e.to_string()).into_response(),
        Err(e) => return AppError::BadRequest(format!("unreadable body: {}", e)).into_response(),
    };
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => return AppError::BadRequest(format!("invalid JSON body: {}", e)).into_response(),
        }
    };

    let mut req = RouteRequest::new(parts.method, parts.uri.path());
    req.headers = parts.headers;
    req.params = params;
    req.query = query;
    req.body = body;
    route.serve(req).await.into_response()
}
