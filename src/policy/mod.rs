//! Policies: guards run before a route handler. A policy may short-circuit the request by
//! producing a response; its return value is recorded in the request context.

mod builtin;
mod resolver;

pub use builtin::{BearerToken, RequireHeader, ValidateBody, ValidationRule};
pub use resolver::{PolicyResolver, ResolvedPolicy};

use crate::error::{AppError, ResolutionError};
use crate::inject::{Container, Injectable};
use crate::metadata::Target;
use crate::pipeline::{RouteRequest, RouteResponse};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait Policy: Send + Sync + 'static {
    /// Policies that must run before this one. Expanded depth-first when chains are
    /// flattened.
    fn policies() -> Vec<PolicyDescriptor>
    where
        Self: Sized,
    {
        Vec::new()
    }

    async fn handle(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<Value, AppError>;
}

/// Identity used to deduplicate chains and to look up recorded results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyId {
    Type(Target),
    Inline(u64),
}

impl PolicyId {
    pub fn of<P: 'static>() -> Self {
        PolicyId::Type(Target::of::<P>())
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyId::Type(t) => f.write_str(t.short_name()),
            PolicyId::Inline(n) => write!(f, "inline#{}", n),
        }
    }
}

/// Reference to a reusable policy type, resolved once through the container.
#[derive(Clone, Copy)]
pub struct PolicyTypeRef {
    target: Target,
    resolve: fn(&Container) -> Result<Arc<dyn Policy>, ResolutionError>,
    sub_policies: fn() -> Vec<PolicyDescriptor>,
}

fn resolve_policy<P: Policy + Injectable>(container: &Container) -> Result<Arc<dyn Policy>, ResolutionError> {
    let policy: Arc<dyn Policy> = container.resolve::<P>()?;
    Ok(policy)
}

impl PolicyTypeRef {
    pub fn of<P: Policy + Injectable>() -> Self {
        PolicyTypeRef {
            target: Target::of::<P>(),
            resolve: resolve_policy::<P>,
            sub_policies: P::policies,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }
}

static NEXT_INLINE_ID: AtomicU64 = AtomicU64::new(1);

/// A policy owned by the route that declares it. Never injected; clones share identity.
#[derive(Clone)]
pub struct InlinePolicy {
    id: u64,
    policy: Arc<dyn Policy>,
}

impl InlinePolicy {
    pub fn new<P: Policy>(policy: P) -> Self {
        InlinePolicy {
            id: NEXT_INLINE_ID.fetch_add(1, Ordering::Relaxed),
            policy: Arc::new(policy),
        }
    }
}

/// Adapter turning a plain closure into a policy.
pub struct FnPolicy<F>(F);

#[async_trait]
impl<F> Policy for FnPolicy<F>
where
    F: Fn(&mut RouteRequest, &mut RouteResponse) -> Result<Value, AppError> + Send + Sync + 'static,
{
    async fn handle(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<Value, AppError> {
        (self.0)(req, res)
    }
}

/// Adapter turning a closure that returns a boxed future into a policy.
pub struct AsyncFnPolicy<F>(F);

#[async_trait]
impl<F> Policy for AsyncFnPolicy<F>
where
    F: for<'a> Fn(&'a mut RouteRequest, &'a mut RouteResponse) -> BoxFuture<'a, Result<Value, AppError>>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<Value, AppError> {
        (self.0)(req, res).await
    }
}

#[derive(Clone)]
pub enum PolicyDescriptor {
    Type(PolicyTypeRef),
    Inline(InlinePolicy),
}

impl PolicyDescriptor {
    pub fn of<P: Policy + Injectable>() -> Self {
        PolicyDescriptor::Type(PolicyTypeRef::of::<P>())
    }

    /// Wrap a ready-made policy instance as an inline policy.
    pub fn instance<P: Policy>(policy: P) -> Self {
        PolicyDescriptor::Inline(InlinePolicy::new(policy))
    }

    /// Wrap a closure invoked with the request and response.
    pub fn inline<F>(f: F) -> Self
    where
        F: Fn(&mut RouteRequest, &mut RouteResponse) -> Result<Value, AppError> + Send + Sync + 'static,
    {
        Self::instance(FnPolicy(f))
    }

    /// Wrap an async closure: `|req, res| Box::pin(async move { .. })`.
    pub fn inline_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut RouteRequest, &'a mut RouteResponse) -> BoxFuture<'a, Result<Value, AppError>>
            + Send
            + Sync
            + 'static,
    {
        Self::instance(AsyncFnPolicy(f))
    }

    pub fn id(&self) -> PolicyId {
        match self {
            PolicyDescriptor::Type(t) => PolicyId::Type(t.target),
            PolicyDescriptor::Inline(i) => PolicyId::Inline(i.id),
        }
    }
}

impl fmt::Debug for PolicyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}
