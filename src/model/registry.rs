//! Model registration and lookup.

use super::definition::{AssociationKind, ModelDef};
use super::transform::QueryTransformer;
use crate::error::{ConfigError, QueryError};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Collects model declarations in any order. Associations may name models that are
/// registered later; nothing is resolved until [`ModelRegistryBuilder::finish`].
#[derive(Default)]
pub struct ModelRegistryBuilder {
    models: Vec<ModelDef>,
}

impl ModelRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: ModelDef) -> Self {
        self.models.push(model);
        self
    }

    pub fn add(&mut self, model: ModelDef) -> &mut Self {
        self.models.push(model);
        self
    }

    /// Close registration: validate every model and verify association targets.
    pub fn finish(self) -> Result<ModelRegistry, ConfigError> {
        let mut by_name = HashMap::new();
        let mut models = Vec::with_capacity(self.models.len());
        for def in self.models {
            validate(&def)?;
            if by_name.insert(def.name.clone(), models.len()).is_some() {
                return Err(invalid(&def, "registered more than once"));
            }
            let transformer = QueryTransformer::new(&def);
            models.push(Model { def, transformer });
        }
        let registry = ModelRegistry { models, by_name };
        registry.verify()?;
        tracing::debug!(models = registry.models.len(), "model registry sealed");
        Ok(registry)
    }
}

fn invalid(def: &ModelDef, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidModel {
        model: def.name.clone(),
        reason: reason.into(),
    }
}

/// Field and column names must form a bijection, and association fields must not shadow
/// either, since eager-loaded rows carry both in one object.
fn validate(def: &ModelDef) -> Result<(), ConfigError> {
    if def.table.is_empty() {
        return Err(invalid(def, "table name is empty"));
    }
    let mut names = HashSet::new();
    let mut columns = HashSet::new();
    for f in &def.fields {
        if !names.insert(f.name.as_str()) {
            return Err(invalid(def, format!("field '{}' declared twice", f.name)));
        }
        if !columns.insert(f.column.as_str()) {
            return Err(invalid(def, format!("column '{}' mapped by two fields", f.column)));
        }
    }
    if def.find_field(&def.primary_key).is_none() {
        return Err(invalid(def, format!("primary key '{}' is not a declared field", def.primary_key)));
    }
    let mut foreign_keys = HashSet::new();
    for a in &def.associations {
        if names.contains(a.field.as_str()) || columns.contains(a.field.as_str()) || !names.insert(a.field.as_str()) {
            return Err(invalid(def, format!("association '{}' collides with another field", a.field)));
        }
        if a.kind == AssociationKind::BelongsTo {
            if columns.contains(a.foreign_key.as_str()) {
                return Err(invalid(
                    def,
                    format!("foreign key '{}' of '{}' is also a field column", a.foreign_key, a.field),
                ));
            }
            if !foreign_keys.insert(a.foreign_key.as_str()) {
                return Err(invalid(def, format!("foreign key '{}' used by two associations", a.foreign_key)));
            }
        }
    }
    Ok(())
}

pub(crate) struct Model {
    pub(crate) def: ModelDef,
    pub(crate) transformer: QueryTransformer,
}

/// Sealed set of models. Read-only after [`ModelRegistryBuilder::finish`].
pub struct ModelRegistry {
    models: Vec<Model>,
    by_name: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.def.name.as_str())
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn at(&self, index: usize) -> Option<ModelRef<'_>> {
        self.models.get(index).map(|model| ModelRef { registry: self, model })
    }

    pub fn get(&self, name: &str) -> Option<ModelRef<'_>> {
        self.index_of(name).and_then(|i| self.at(i))
    }

    pub fn model(&self, name: &str) -> Result<ModelRef<'_>, QueryError> {
        self.get(name).ok_or_else(|| QueryError::UnsupportedQuery {
            model: name.to_string(),
            reason: "model is not registered".into(),
        })
    }

    /// Check every association names a registered model and, for has-one, that the
    /// target carries the foreign key column.
    pub fn verify(&self) -> Result<(), ConfigError> {
        for m in &self.models {
            for a in &m.def.associations {
                let Some(target) = self.get(&a.target) else {
                    return Err(ConfigError::UnknownAssociationTarget {
                        model: m.def.name.clone(),
                        field: a.field.clone(),
                        target: a.target.clone(),
                    });
                };
                if a.kind == AssociationKind::HasOne && !target.def().has_column(&a.foreign_key) {
                    return Err(invalid(
                        &m.def,
                        format!("has-one '{}': {} has no column '{}'", a.field, a.target, a.foreign_key),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Handle to one registered model. All query operations hang off this.
#[derive(Clone, Copy)]
pub struct ModelRef<'r> {
    registry: &'r ModelRegistry,
    model: &'r Model,
}

impl<'r> ModelRef<'r> {
    pub fn name(&self) -> &'r str {
        &self.model.def.name
    }

    pub fn def(&self) -> &'r ModelDef {
        &self.model.def
    }

    pub fn transformer(&self) -> &'r QueryTransformer {
        &self.model.transformer
    }

    pub fn registry(&self) -> &'r ModelRegistry {
        self.registry
    }
}

impl fmt::Debug for ModelRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Model({})", self.name())
    }
}
