//! Dependency injection container.
//!
//! Instances are process-cached singletons keyed by type. Types that know how to build
//! themselves implement [`Injectable`]; anything else (pools, settings) is registered
//! up front with [`Container::register`].

use crate::error::ResolutionError;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// A type the container can construct from other registered providers.
pub trait Injectable: Send + Sync + 'static {
    fn inject(container: &Container) -> Result<Self, ResolutionError>
    where
        Self: Sized;
}

#[derive(Clone, Default)]
pub struct Container {
    instances: Arc<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
    resolving: Arc<Mutex<Vec<TypeId>>>,
}

impl Container {
    pub fn new() -> Self {
        tracing::debug!("creating DI container");
        Self::default()
    }

    /// Register a ready-made instance, replacing any cached one.
    pub fn register<T: Send + Sync + 'static>(&self, instance: T) {
        self.register_arc(Arc::new(instance));
    }

    pub fn register_arc<T: Send + Sync + 'static>(&self, instance: Arc<T>) {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        instances.insert(TypeId::of::<T>(), instance);
        tracing::debug!(provider = std::any::type_name::<T>(), "provider registered");
    }

    /// Fetch a registered instance without attempting construction.
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolutionError> {
        self.cached::<T>()
            .ok_or(ResolutionError::NotRegistered(std::any::type_name::<T>()))
    }

    pub fn has<T: Send + Sync + 'static>(&self) -> bool {
        self.cached::<T>().is_some()
    }

    /// Resolve a cached instance, constructing and caching it through [`Injectable`] on
    /// first use.
    pub fn resolve<T: Injectable>(&self) -> Result<Arc<T>, ResolutionError> {
        if let Some(found) = self.cached::<T>() {
            return Ok(found);
        }
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        {
            let mut resolving = self.resolving.lock().unwrap_or_else(|e| e.into_inner());
            if resolving.contains(&type_id) {
                return Err(ResolutionError::Cycle(type_name));
            }
            resolving.push(type_id);
        }
        tracing::trace!(provider = type_name, "constructing provider");
        let built = T::inject(self);
        {
            let mut resolving = self.resolving.lock().unwrap_or_else(|e| e.into_inner());
            resolving.retain(|id| *id != type_id);
        }
        let instance = Arc::new(built?);

        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        // First writer wins so every caller shares one instance.
        let stored = instances
            .entry(type_id)
            .or_insert_with(|| instance as Arc<dyn Any + Send + Sync>);
        Arc::clone(stored)
            .downcast::<T>()
            .map_err(|_| ResolutionError::Construction {
                target: type_name,
                reason: "cached instance has a different type".into(),
            })
    }

    fn cached<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances
            .get(&TypeId::of::<T>())
            .and_then(|any| Arc::clone(any).downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Greeting(String);

    struct Greeter {
        greeting: Arc<Greeting>,
    }

    impl Injectable for Greeter {
        fn inject(container: &Container) -> Result<Self, ResolutionError> {
            Ok(Greeter {
                greeting: container.get::<Greeting>()?,
            })
        }
    }

    struct Ping;
    struct Pong;

    impl Injectable for Ping {
        fn inject(container: &Container) -> Result<Self, ResolutionError> {
            container.resolve::<Pong>()?;
            Ok(Ping)
        }
    }

    impl Injectable for Pong {
        fn inject(container: &Container) -> Result<Self, ResolutionError> {
            container.resolve::<Ping>()?;
            Ok(Pong)
        }
    }

    #[test]
    fn resolve_constructs_once_and_caches() {
        let container = Container::new();
        container.register(Greeting("hello".into()));

        let a = container.resolve::<Greeter>().unwrap();
        let b = container.resolve::<Greeter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.greeting.0, "hello");
    }

    #[test]
    fn missing_dependency_fails_with_resolution_error() {
        let container = Container::new();
        let err = container.resolve::<Greeter>().err().unwrap();
        assert!(matches!(err, ResolutionError::NotRegistered(name) if name.ends_with("Greeting")));
    }

    #[test]
    fn cycles_are_reported() {
        let container = Container::new();
        assert!(matches!(container.resolve::<Ping>(), Err(ResolutionError::Cycle(_))));
    }
}
