//! Controllers and their declarations.
//!
//! A controller is declared in the [`MetadataStore`] (base path, policies, interceptors,
//! child controllers) and each route is declared by name. At startup the
//! [`RouteReflector`] walks the controller tree and turns those declarations into a
//! [`DispatchTable`].

mod dispatch;
mod reflector;

pub use dispatch::DispatchTable;
pub use reflector::{join_path, RouteReflector};

use crate::error::{AppError, ResolutionError};
use crate::inject::{Container, Injectable};
use crate::metadata::{MetadataStore, Target, CONTROLLER, EXTENDS, ROUTE, ROUTES};
use crate::pipeline::{InterceptorRef, RouteRequest, RouteResponse};
use crate::policy::PolicyDescriptor;
use async_trait::async_trait;
use axum::http::Method;
use axum::routing::MethodFilter;
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Names of the route methods this controller can serve, including ones declared on
    /// a base type.
    fn route_methods(&self) -> &[&'static str];

    /// Serve the route method `name`.
    async fn handle(&self, name: &str, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError>;

    /// Normalize one path segment (server base path, ancestor paths, own path, route path).
    fn transform_path(&self, segment: &str) -> String {
        segment.to_string()
    }

    /// Replace the policy list accumulated up to `stage`.
    fn transform_policies(&self, _stage: PolicyStage, policies: Vec<PolicyDescriptor>) -> Vec<PolicyDescriptor> {
        policies
    }

    /// Rewrite a route before registration. `None` skips it.
    fn transform_route(&self, route: RouteDraft) -> Option<RouteDraft> {
        Some(route)
    }
}

/// Policy precedence stages, outermost first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyStage {
    Server,
    Ancestors,
    Controller,
    Route,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn filter(self) -> MethodFilter {
        match self {
            HttpMethod::Get => MethodFilter::GET,
            HttpMethod::Post => MethodFilter::POST,
            HttpMethod::Put => MethodFilter::PUT,
            HttpMethod::Patch => MethodFilter::PATCH,
            HttpMethod::Delete => MethodFilter::DELETE,
            HttpMethod::Head => MethodFilter::HEAD,
            HttpMethod::Options => MethodFilter::OPTIONS,
        }
    }

    pub fn as_method(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Options => Method::OPTIONS,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_method().as_str())
    }
}

/// Reference to a controller type plus how to build it.
#[derive(Clone, Copy)]
pub struct ControllerRef {
    target: Target,
    resolve: fn(&Container) -> Result<Arc<dyn Controller>, ResolutionError>,
}

fn resolve_controller<C: Controller + Injectable>(container: &Container) -> Result<Arc<dyn Controller>, ResolutionError> {
    let controller: Arc<dyn Controller> = container.resolve::<C>()?;
    Ok(controller)
}

impl ControllerRef {
    pub fn of<C: Controller + Injectable>() -> Self {
        ControllerRef {
            target: Target::of::<C>(),
            resolve: resolve_controller::<C>,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn resolve(&self, container: &Container) -> Result<Arc<dyn Controller>, ResolutionError> {
        (self.resolve)(container)
    }
}

impl fmt::Debug for ControllerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.target)
    }
}

/// Controller-level declaration.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetadata {
    pub path: String,
    pub policies: Vec<PolicyDescriptor>,
    pub interceptors: Vec<InterceptorRef>,
    pub children: Vec<ControllerRef>,
}

impl ControllerMetadata {
    pub fn new(path: impl Into<String>) -> Self {
        ControllerMetadata {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn policy(mut self, policy: PolicyDescriptor) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn interceptor(mut self, interceptor: InterceptorRef) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn child<C: Controller + Injectable>(mut self) -> Self {
        self.children.push(ControllerRef::of::<C>());
        self
    }
}

/// Route-level declaration. The route's name is the controller method serving it.
#[derive(Clone, Debug)]
pub struct RouteMetadata {
    pub method: HttpMethod,
    pub path: String,
    pub policies: Vec<PolicyDescriptor>,
}

impl RouteMetadata {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        RouteMetadata {
            method,
            path: path.into(),
            policies: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    pub fn policy(mut self, policy: PolicyDescriptor) -> Self {
        self.policies.push(policy);
        self
    }
}

/// A route as seen by [`Controller::transform_route`]: full path and accumulated policies.
#[derive(Clone, Debug)]
pub struct RouteDraft {
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
    pub policies: Vec<PolicyDescriptor>,
}

/// A registered route. Immutable once built.
#[derive(Clone, Debug)]
pub struct RouteDescriptor {
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
    pub policies: Vec<PolicyDescriptor>,
    pub controller: &'static str,
    pub handler: String,
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}::{})", self.method, self.path, self.controller, self.handler)
    }
}

impl MetadataStore {
    /// Declare `C` as a controller.
    pub fn controller<C: 'static>(&self, metadata: ControllerMetadata) -> &Self {
        self.define(CONTROLLER, Target::of::<C>(), None, metadata);
        self
    }

    /// Declare route `name` on `T`. `T` may be a controller or a base type it extends.
    pub fn route<T: 'static>(&self, name: &str, metadata: RouteMetadata) -> &Self {
        let target = Target::of::<T>();
        self.define(ROUTE, target, Some(name), metadata);
        self.update::<Vec<String>, _>(ROUTES, target, None, |names| {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        });
        self
    }

    /// Declare that `T` inherits the routes declared on `B`.
    pub fn extends<T: 'static, B: 'static>(&self) -> &Self {
        self.define(EXTENDS, Target::of::<T>(), None, Target::of::<B>());
        self
    }
}
