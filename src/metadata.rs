//! Metadata store: declarative facts keyed by (key, target, property).
//!
//! Declarations are made during an explicit registration phase and read back by the
//! route reflector. Nothing is validated here; the reflector reports missing or
//! inconsistent entries with the offending target's name.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

/// Stable identity of a declaration site (a controller, policy or base type).
#[derive(Clone, Copy)]
pub struct Target {
    id: TypeId,
    name: &'static str,
}

impl Target {
    pub fn of<T: 'static>() -> Self {
        Target {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Full type path of the target.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment, used in log lines and error messages.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Namespaced metadata key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetadataKey(pub &'static str);

pub const CONTROLLER: MetadataKey = MetadataKey("trellis:controller");
pub const ROUTES: MetadataKey = MetadataKey("trellis:routes");
pub const ROUTE: MetadataKey = MetadataKey("trellis:route");
pub const EXTENDS: MetadataKey = MetadataKey("trellis:extends");

type Slot = (MetadataKey, Target, Option<String>);

#[derive(Clone, Default)]
pub struct MetadataStore {
    entries: Arc<RwLock<HashMap<Slot, Arc<dyn Any + Send + Sync>>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `value` with `(key, target, property)`, replacing any previous value.
    pub fn define<V>(&self, key: MetadataKey, target: Target, property: Option<&str>, value: V)
    where
        V: Any + Send + Sync,
    {
        tracing::trace!(key = key.0, target = target.short_name(), property = ?property, "define metadata");
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert((key, target, property.map(str::to_string)), Arc::new(value));
    }

    /// Read back a value. Absent when nothing was defined or the stored type differs.
    pub fn get<V>(&self, key: MetadataKey, target: Target, property: Option<&str>) -> Option<Arc<V>>
    where
        V: Any + Send + Sync,
    {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&(key, target, property.map(str::to_string)))
            .and_then(|v| Arc::clone(v).downcast::<V>().ok())
    }

    pub fn has(&self, key: MetadataKey, target: Target, property: Option<&str>) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(&(key, target, property.map(str::to_string)))
    }

    /// Apply `f` to the value at a slot, inserting `V::default()` first if absent.
    pub fn update<V, F>(&self, key: MetadataKey, target: Target, property: Option<&str>, f: F)
    where
        V: Any + Send + Sync + Clone + Default,
        F: FnOnce(&mut V),
    {
        let mut value = self
            .get::<V>(key, target, property)
            .map(|v| (*v).clone())
            .unwrap_or_default();
        f(&mut value);
        self.define(key, target, property, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widgets;
    struct Gadgets;

    #[test]
    fn define_and_get_by_target_and_property() {
        let store = MetadataStore::new();
        store.define(ROUTE, Target::of::<Widgets>(), Some("create"), String::from("/create"));

        let got = store.get::<String>(ROUTE, Target::of::<Widgets>(), Some("create"));
        assert_eq!(got.as_deref().map(String::as_str), Some("/create"));
        assert!(store.get::<String>(ROUTE, Target::of::<Widgets>(), Some("list")).is_none());
        assert!(store.get::<String>(ROUTE, Target::of::<Gadgets>(), Some("create")).is_none());
    }

    #[test]
    fn get_with_wrong_type_is_absent() {
        let store = MetadataStore::new();
        store.define(CONTROLLER, Target::of::<Widgets>(), None, 7u32);
        assert!(store.get::<String>(CONTROLLER, Target::of::<Widgets>(), None).is_none());
        assert_eq!(store.get::<u32>(CONTROLLER, Target::of::<Widgets>(), None).map(|v| *v), Some(7));
    }

    #[test]
    fn update_appends_in_place() {
        let store = MetadataStore::new();
        let t = Target::of::<Widgets>();
        store.update::<Vec<String>, _>(ROUTES, t, None, |v| v.push("a".into()));
        store.update::<Vec<String>, _>(ROUTES, t, None, |v| v.push("b".into()));
        let names = store.get::<Vec<String>>(ROUTES, t, None).unwrap();
        assert_eq!(*names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn target_short_name() {
        assert_eq!(Target::of::<Widgets>().short_name(), "Widgets");
    }
}
