//! Policy chain flattening and resolution.

use super::{Policy, PolicyDescriptor, PolicyId};
use crate::error::ResolutionError;
use crate::inject::Container;
use std::collections::HashSet;
use std::sync::Arc;

/// A policy ready to run: its identity plus a shared callable instance.
#[derive(Clone)]
pub struct ResolvedPolicy {
    pub id: PolicyId,
    pub policy: Arc<dyn Policy>,
}

#[derive(Clone)]
pub struct PolicyResolver {
    container: Container,
}

impl PolicyResolver {
    pub fn new(container: Container) -> Self {
        PolicyResolver { container }
    }

    /// Obtain the callable for one descriptor. Policy types come from the container's
    /// cache; inline policies are used as-is.
    pub fn resolve(&self, descriptor: &PolicyDescriptor) -> Result<ResolvedPolicy, ResolutionError> {
        match descriptor {
            PolicyDescriptor::Type(t) => Ok(ResolvedPolicy {
                id: descriptor.id(),
                policy: (t.resolve)(&self.container)?,
            }),
            PolicyDescriptor::Inline(i) => Ok(ResolvedPolicy {
                id: descriptor.id(),
                policy: Arc::clone(&i.policy),
            }),
        }
    }

    /// Expand sub-policies depth-first (a policy's own sub-policies come before it) and
    /// keep only the first occurrence of each identity.
    pub fn flatten(descriptors: &[PolicyDescriptor]) -> Vec<PolicyDescriptor> {
        let mut out = Vec::new();
        let mut emitted = HashSet::new();
        let mut expanding = Vec::new();
        for d in descriptors {
            visit(d, &mut emitted, &mut expanding, &mut out);
        }
        out
    }

    pub fn resolve_chain(&self, descriptors: &[PolicyDescriptor]) -> Result<Vec<ResolvedPolicy>, ResolutionError> {
        Self::flatten(descriptors)
            .iter()
            .map(|d| self.resolve(d))
            .collect()
    }
}

fn visit(
    descriptor: &PolicyDescriptor,
    emitted: &mut HashSet<PolicyId>,
    expanding: &mut Vec<PolicyId>,
    out: &mut Vec<PolicyDescriptor>,
) {
    let id = descriptor.id();
    if emitted.contains(&id) || expanding.contains(&id) {
        return;
    }
    if let PolicyDescriptor::Type(t) = descriptor {
        expanding.push(id);
        for sub in (t.sub_policies)() {
            visit(&sub, emitted, expanding, out);
        }
        expanding.pop();
    }
    if emitted.insert(id) {
        out.push(descriptor.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::inject::Injectable;
    use crate::pipeline::{RouteRequest, RouteResponse};
    use async_trait::async_trait;
    use serde_json::Value;

    macro_rules! test_policy {
        ($name:ident $(, $sub:ident)*) => {
            struct $name;

            impl Injectable for $name {
                fn inject(_: &Container) -> Result<Self, ResolutionError> {
                    Ok($name)
                }
            }

            #[async_trait]
            impl Policy for $name {
                fn policies() -> Vec<PolicyDescriptor> {
                    vec![$(PolicyDescriptor::of::<$sub>()),*]
                }

                async fn handle(&self, _: &mut RouteRequest, _: &mut RouteResponse) -> Result<Value, AppError> {
                    Ok(Value::String(stringify!($name).into()))
                }
            }
        };
    }

    test_policy!(Session);
    test_policy!(Auth, Session);
    test_policy!(Audit, Session);
    test_policy!(Admin, Auth, Audit);
    test_policy!(Looping, Looping);

    fn ids(chain: &[PolicyDescriptor]) -> Vec<PolicyId> {
        chain.iter().map(PolicyDescriptor::id).collect()
    }

    #[test]
    fn sub_policies_come_first() {
        let flat = PolicyResolver::flatten(&[PolicyDescriptor::of::<Auth>()]);
        assert_eq!(ids(&flat), vec![PolicyId::of::<Session>(), PolicyId::of::<Auth>()]);
    }

    #[test]
    fn transitive_duplicates_run_once_at_first_position() {
        let flat = PolicyResolver::flatten(&[PolicyDescriptor::of::<Admin>(), PolicyDescriptor::of::<Session>()]);
        assert_eq!(
            ids(&flat),
            vec![
                PolicyId::of::<Session>(),
                PolicyId::of::<Auth>(),
                PolicyId::of::<Audit>(),
                PolicyId::of::<Admin>(),
            ]
        );
    }

    #[test]
    fn flatten_is_idempotent() {
        let once = PolicyResolver::flatten(&[
            PolicyDescriptor::of::<Audit>(),
            PolicyDescriptor::inline(|_, _| Ok(Value::Null)),
            PolicyDescriptor::of::<Admin>(),
        ]);
        let twice = PolicyResolver::flatten(&once);
        assert_eq!(ids(&once), ids(&twice));
    }

    #[test]
    fn self_reference_does_not_recurse() {
        let flat = PolicyResolver::flatten(&[PolicyDescriptor::of::<Looping>()]);
        assert_eq!(ids(&flat), vec![PolicyId::of::<Looping>()]);
    }

    #[test]
    fn inline_clones_share_identity() {
        let inline = PolicyDescriptor::inline(|_, _| Ok(Value::Null));
        let other = PolicyDescriptor::inline(|_, _| Ok(Value::Null));
        let flat = PolicyResolver::flatten(&[inline.clone(), other.clone(), inline.clone()]);
        assert_eq!(ids(&flat), vec![inline.id(), other.id()]);
    }

    #[tokio::test]
    async fn resolved_type_policies_are_cached() {
        let resolver = PolicyResolver::new(Container::new());
        let a = resolver.resolve(&PolicyDescriptor::of::<Auth>()).unwrap();
        let b = resolver.resolve(&PolicyDescriptor::of::<Auth>()).unwrap();
        assert!(Arc::ptr_eq(&a.policy, &b.policy));

        let mut req = RouteRequest::new(axum::http::Method::GET, "/");
        let mut res = RouteResponse::new();
        let out = a.policy.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(out, Value::String("Auth".into()));
    }
}
