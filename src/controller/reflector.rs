//! Route reflection: controller declarations → dispatch table.

use super::{ControllerMetadata, ControllerRef, DispatchTable, HttpMethod, PolicyStage, RouteDescriptor, RouteDraft, RouteMetadata};
use crate::error::{AppError, ConfigError};
use crate::inject::Container;
use crate::metadata::{MetadataStore, Target, CONTROLLER, EXTENDS, ROUTE, ROUTES};
use crate::pipeline::{
    DefaultErrorHandler, DefaultInterceptor, Interceptor, InterceptorRef, PipelineStats, RouteEndpoint, RouteErrorHandler,
    RoutePipeline,
};
use crate::policy::{PolicyDescriptor, PolicyResolver};
use std::collections::HashSet;
use std::sync::Arc;

/// Join path segments into a route path: one leading slash, no empty or doubled segments.
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let parts: Vec<&str> = segments
        .iter()
        .flat_map(|s| s.as_ref().split('/'))
        .filter(|p| !p.is_empty())
        .collect();
    format!("/{}", parts.join("/"))
}

/// Path with parameter names erased: `/gears/:id` and `/gears/:gear_id` share a key.
pub(crate) fn route_key(path: &str) -> String {
    path.split('/')
        .map(|seg| match seg.chars().next() {
            Some(':') => ":",
            Some('*') => "*",
            _ => seg,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Two distinct keys the router cannot hold together: a catch-all sharing its position
/// with any other segment after an identical prefix.
fn keys_conflict(a: &str, b: &str) -> bool {
    for (x, y) in a.split('/').zip(b.split('/')) {
        if x == y {
            continue;
        }
        return x == "*" || y == "*";
    }
    false
}

/// What a controller inherits from its ancestors.
#[derive(Clone, Default)]
struct Frame {
    paths: Vec<String>,
    policies: Vec<PolicyDescriptor>,
    interceptors: Vec<InterceptorRef>,
}

pub struct RouteReflector<'a> {
    store: &'a MetadataStore,
    container: &'a Container,
    resolver: PolicyResolver,
    base_path: String,
    policies: Vec<PolicyDescriptor>,
    interceptors: Vec<InterceptorRef>,
    error_handler: Arc<dyn RouteErrorHandler>,
    stats: Arc<PipelineStats>,
}

struct Walk {
    seen_controllers: HashSet<Target>,
    seen_routes: HashSet<(HttpMethod, String)>,
    /// One `(key, path)` per distinct key, in registration order.
    paths: Vec<(String, String)>,
    routes: Vec<Arc<RoutePipeline>>,
}

impl<'a> RouteReflector<'a> {
    pub fn new(store: &'a MetadataStore, container: &'a Container) -> Self {
        RouteReflector {
            store,
            container,
            resolver: PolicyResolver::new(container.clone()),
            base_path: String::new(),
            policies: Vec::new(),
            interceptors: Vec::new(),
            error_handler: Arc::new(DefaultErrorHandler),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Server-level policies, run before every controller's own.
    pub fn policies(mut self, policies: Vec<PolicyDescriptor>) -> Self {
        self.policies = policies;
        self
    }

    /// Server-level interceptors, installed after the default interceptor.
    pub fn interceptors(mut self, interceptors: Vec<InterceptorRef>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn error_handler(mut self, error_handler: Arc<dyn RouteErrorHandler>) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Build the dispatch table. Any declaration problem aborts the whole reflection.
    pub fn reflect(&self, controllers: &[ControllerRef]) -> Result<DispatchTable, AppError> {
        let mut walk = Walk {
            seen_controllers: HashSet::new(),
            seen_routes: HashSet::new(),
            paths: Vec::new(),
            routes: Vec::new(),
        };
        let root = Frame {
            paths: vec![self.base_path.clone()],
            ..Default::default()
        };
        for controller in controllers {
            self.reflect_controller(*controller, &root, &mut walk)?;
        }
        tracing::info!(routes = walk.routes.len(), "routes reflected");
        Ok(DispatchTable::new(walk.routes, Arc::clone(&self.stats)))
    }

    fn reflect_controller(&self, controller_ref: ControllerRef, frame: &Frame, walk: &mut Walk) -> Result<(), AppError> {
        let target = controller_ref.target();
        let name = target.short_name();
        let meta = self
            .store
            .get::<ControllerMetadata>(CONTROLLER, target, None)
            .ok_or_else(|| ConfigError::MissingMetadata {
                kind: "controller",
                target: name.to_string(),
            })?;
        if !walk.seen_controllers.insert(target) {
            return Err(ConfigError::DuplicateController(name.to_string()).into());
        }
        let controller = controller_ref.resolve(self.container)?;
        tracing::debug!(controller = name, path = %meta.path, "reflecting controller");

        let interceptors = self.interceptor_chain(frame, &meta)?;
        let mut policies = controller.transform_policies(PolicyStage::Server, self.policies.clone());
        policies.extend(frame.policies.iter().cloned());
        policies = controller.transform_policies(PolicyStage::Ancestors, policies);
        policies.extend(meta.policies.iter().cloned());
        policies = controller.transform_policies(PolicyStage::Controller, policies);

        let mut segments: Vec<String> = frame.paths.iter().map(|p| controller.transform_path(p)).collect();
        segments.push(controller.transform_path(&meta.path));

        for (route_name, route) in self.collect_routes(target)? {
            if !controller.route_methods().iter().any(|m| *m == route_name) {
                return Err(ConfigError::MissingHandler {
                    controller: name.to_string(),
                    route: route_name,
                }
                .into());
            }
            let mut chain = policies.clone();
            chain.extend(route.policies.iter().cloned());
            let chain = controller.transform_policies(PolicyStage::Route, chain);

            let mut path_segments = segments.clone();
            path_segments.push(controller.transform_path(&route.path));
            let draft = RouteDraft {
                name: route_name.clone(),
                method: route.method,
                path: join_path(&path_segments),
                policies: chain,
            };
            let Some(draft) = controller.transform_route(draft) else {
                tracing::debug!(controller = name, route = %route_name, "route skipped by transform");
                continue;
            };
            let path = join_path(&[draft.path.as_str()]);
            let key = route_key(&path);
            if !walk.seen_routes.insert((draft.method, key.clone())) {
                return Err(ConfigError::DuplicateRoute {
                    method: draft.method.to_string(),
                    path,
                }
                .into());
            }
            if let Some((_, other)) = walk.paths.iter().find(|(k, _)| *k != key && keys_conflict(k, &key)) {
                return Err(ConfigError::RouteConflict {
                    path,
                    other: other.clone(),
                }
                .into());
            }
            if !walk.paths.iter().any(|(k, _)| *k == key) {
                walk.paths.push((key, path.clone()));
            }

            let flat = PolicyResolver::flatten(&draft.policies);
            let resolved = self.resolver.resolve_chain(&flat)?;
            let descriptor = RouteDescriptor {
                name: draft.name,
                method: draft.method,
                path,
                policies: flat,
                controller: name,
                handler: route_name,
            };
            tracing::debug!(route = %descriptor, policies = ?descriptor.policies, "route registered");
            let endpoint = RouteEndpoint::new(descriptor, resolved, Arc::clone(&controller), Arc::clone(&self.error_handler));
            walk.routes.push(Arc::new(RoutePipeline::new(
                interceptors.clone(),
                endpoint,
                Arc::clone(&self.stats),
            )));
        }

        if !meta.children.is_empty() {
            let mut child_frame = frame.clone();
            child_frame.paths.push(meta.path.clone());
            child_frame.policies.extend(meta.policies.iter().cloned());
            child_frame.interceptors.extend(meta.interceptors.iter().cloned());
            for child in &meta.children {
                self.reflect_controller(*child, &child_frame, walk)?;
            }
        }
        Ok(())
    }

    /// Route declarations visible on `target`, base types first. A route redeclared on a
    /// derived type replaces the base declaration in place.
    fn collect_routes(&self, target: Target) -> Result<Vec<(String, RouteMetadata)>, AppError> {
        let mut lineage = vec![target];
        let mut current = target;
        while let Some(base) = self.store.get::<Target>(EXTENDS, current, None).map(|b| *b) {
            if lineage.contains(&base) {
                break;
            }
            lineage.push(base);
            current = base;
        }

        let mut routes: Vec<(String, RouteMetadata)> = Vec::new();
        for owner in lineage.iter().rev() {
            let Some(names) = self.store.get::<Vec<String>>(ROUTES, *owner, None) else {
                continue;
            };
            for route_name in names.iter() {
                let route = self
                    .store
                    .get::<RouteMetadata>(ROUTE, *owner, Some(route_name))
                    .ok_or_else(|| ConfigError::MissingMetadata {
                        kind: "route",
                        target: format!("{}::{}", owner.short_name(), route_name),
                    })?;
                match routes.iter_mut().find(|(n, _)| n == route_name) {
                    Some(slot) => slot.1 = (*route).clone(),
                    None => routes.push((route_name.clone(), (*route).clone())),
                }
            }
        }
        Ok(routes)
    }

    fn interceptor_chain(&self, frame: &Frame, meta: &ControllerMetadata) -> Result<Vec<Arc<dyn Interceptor>>, AppError> {
        let mut chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(DefaultInterceptor)];
        for interceptor in self
            .interceptors
            .iter()
            .chain(frame.interceptors.iter())
            .chain(meta.interceptors.iter())
        {
            chain.push(interceptor.resolve(self.container)?);
        }
        Ok(chain)
    }
}
