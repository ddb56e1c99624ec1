//! Association-aware rewriting between field-level queries and column-level SQL.

use super::definition::{AssociationKind, FieldTransform, ModelDef};
use super::registry::{ModelRef, ModelRegistry};
use crate::error::QueryError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Deepest include nesting accepted.
pub const MAX_INCLUDE_DEPTH: usize = 8;

/// Eager-load request: an association field, optionally with nested includes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Include {
    pub field: String,
    pub children: Vec<Include>,
}

impl Include {
    pub fn new(field: impl Into<String>) -> Self {
        Include {
            field: field.into(),
            children: Vec::new(),
        }
    }

    pub fn with(mut self, child: Include) -> Self {
        self.children.push(child);
        self
    }

    /// Parse a dotted path: `"author.profile"` includes `author` and its `profile`.
    pub fn path(path: &str) -> Self {
        let mut parts = path.split('.').filter(|p| !p.is_empty()).rev();
        let mut include = Include::new(parts.next().unwrap_or_default());
        for part in parts {
            include = Include::new(part).with(include);
        }
        include
    }

    /// Merge dotted paths into one include tree per top-level field.
    pub fn paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<Include> {
        let mut out: Vec<Include> = Vec::new();
        for p in paths {
            merge_include(&mut out, Include::path(p));
        }
        out
    }
}

/// Add `include` to a tree, folding it into an existing entry for the same field.
pub(crate) fn merge_include(into: &mut Vec<Include>, include: Include) {
    match into.iter_mut().find(|i| i.field == include.field) {
        Some(existing) => {
            for child in include.children {
                merge_include(&mut existing.children, child);
            }
        }
        None => into.push(include),
    }
}

/// An include resolved against the registry.
#[derive(Debug)]
pub struct IncludePlan<'r> {
    pub field: &'r str,
    pub kind: AssociationKind,
    pub target: ModelRef<'r>,
    pub foreign_key: &'r str,
    pub children: Vec<IncludePlan<'r>>,
}

/// One declared association with its target looked up on first use.
struct Association {
    kind: AssociationKind,
    field: String,
    target_name: String,
    foreign_key: String,
    target: OnceLock<usize>,
}

impl Association {
    fn target<'r>(&self, registry: &'r ModelRegistry, model: &str) -> Result<ModelRef<'r>, QueryError> {
        if let Some(index) = self.target.get() {
            if let Some(target) = registry.at(*index) {
                return Ok(target);
            }
        }
        let index = registry
            .index_of(&self.target_name)
            .ok_or_else(|| QueryError::UnsupportedQuery {
                model: model.to_string(),
                reason: format!("association '{}' targets unregistered model {}", self.field, self.target_name),
            })?;
        let _ = self.target.set(index);
        registry.at(index).ok_or_else(|| QueryError::UnsupportedQuery {
            model: model.to_string(),
            reason: format!("association '{}' target vanished", self.field),
        })
    }
}

/// Per-model rewriting rules, compiled once at registration.
pub struct QueryTransformer {
    model: String,
    columns_by_field: HashMap<String, String>,
    read_fields: Vec<(String, String, Option<FieldTransform>)>,
    associations: Vec<Association>,
}

impl QueryTransformer {
    pub(crate) fn new(def: &ModelDef) -> Self {
        QueryTransformer {
            model: def.name.clone(),
            columns_by_field: def.fields.iter().map(|f| (f.name.clone(), f.column.clone())).collect(),
            read_fields: def
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.column.clone(), f.transform))
                .collect(),
            associations: def
                .associations
                .iter()
                .map(|a| Association {
                    kind: a.kind,
                    field: a.field.clone(),
                    target_name: a.target.clone(),
                    foreign_key: a.foreign_key.clone(),
                    target: OnceLock::new(),
                })
                .collect(),
        }
    }

    fn association(&self, field: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.field == field)
    }

    /// Rewrite a field-keyed filter into a column-keyed one. Belongs-to fields become
    /// their foreign key column; has-one fields cannot be filtered on; keys that are not
    /// declared fields pass through unchanged.
    pub fn transform_where(&self, registry: &ModelRegistry, filter: &Value) -> Result<Map<String, Value>, QueryError> {
        let filter = match filter {
            Value::Null => return Ok(Map::new()),
            Value::Object(map) => map,
            _ => {
                return Err(QueryError::UnsupportedQuery {
                    model: self.model.clone(),
                    reason: "where must be an object".into(),
                })
            }
        };
        let mut out = Map::with_capacity(filter.len());
        for (key, value) in filter {
            if let Some(a) = self.association(key) {
                match a.kind {
                    AssociationKind::BelongsTo => {
                        let id = self.identifier(registry, a, value, true)?;
                        out.insert(a.foreign_key.clone(), id);
                    }
                    AssociationKind::HasOne => {
                        return Err(QueryError::UnsupportedQuery {
                            model: self.model.clone(),
                            reason: format!("has-one field '{}' in where", key),
                        })
                    }
                }
            } else if let Some(column) = self.columns_by_field.get(key) {
                out.insert(column.clone(), value.clone());
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(out)
    }

    /// Rewrite field-keyed values for an insert or update. Unknown keys are dropped.
    pub fn transform_values(&self, registry: &ModelRegistry, values: &Value) -> Result<Map<String, Value>, QueryError> {
        let values = match values {
            Value::Null => return Ok(Map::new()),
            Value::Object(map) => map,
            _ => {
                return Err(QueryError::UnsupportedQuery {
                    model: self.model.clone(),
                    reason: "values must be an object".into(),
                })
            }
        };
        let mut out = Map::with_capacity(values.len());
        for (key, value) in values {
            if let Some(a) = self.association(key) {
                if a.kind == AssociationKind::HasOne {
                    return Err(QueryError::UnsupportedQuery {
                        model: self.model.clone(),
                        reason: format!("has-one field '{}' cannot be written from {}", key, self.model),
                    });
                }
                let id = self.identifier(registry, a, value, false)?;
                out.insert(a.foreign_key.clone(), id);
            } else if let Some(column) = self.columns_by_field.get(key) {
                out.insert(column.clone(), value.clone());
            } else if self.is_foreign_key(key) {
                out.insert(key.clone(), value.clone());
            } else {
                tracing::debug!(model = %self.model, field = %key, "unknown field dropped from values");
            }
        }
        Ok(out)
    }

    fn is_foreign_key(&self, column: &str) -> bool {
        self.associations
            .iter()
            .any(|a| a.kind == AssociationKind::BelongsTo && a.foreign_key == column)
    }

    /// Resolve include names to their target models, recursively.
    pub fn transform_include<'r>(
        &'r self,
        registry: &'r ModelRegistry,
        includes: &[Include],
    ) -> Result<Vec<IncludePlan<'r>>, QueryError> {
        self.plan_includes(registry, includes, 0)
    }

    fn plan_includes<'r>(
        &'r self,
        registry: &'r ModelRegistry,
        includes: &[Include],
        depth: usize,
    ) -> Result<Vec<IncludePlan<'r>>, QueryError> {
        if depth >= MAX_INCLUDE_DEPTH && !includes.is_empty() {
            return Err(QueryError::UnsupportedQuery {
                model: self.model.clone(),
                reason: format!("includes nested deeper than {}", MAX_INCLUDE_DEPTH),
            });
        }
        includes
            .iter()
            .map(|inc| -> Result<IncludePlan<'r>, QueryError> {
                let a = self.association(&inc.field).ok_or_else(|| QueryError::UnknownField {
                    model: self.model.clone(),
                    field: inc.field.clone(),
                })?;
                let target = a.target(registry, &self.model)?;
                let children = target
                    .transformer()
                    .plan_includes(registry, &inc.children, depth + 1)?;
                Ok(IncludePlan {
                    field: a.field.as_str(),
                    kind: a.kind,
                    target,
                    foreign_key: a.foreign_key.as_str(),
                    children,
                })
            })
            .collect()
    }

    /// Turn a column-keyed row into a field-keyed domain object. Eager-loaded
    /// associations are wrapped through the target model; a belongs-to that was not
    /// loaded surfaces its foreign key under the field name.
    pub fn transform_result(&self, registry: &ModelRegistry, row: Value) -> Result<Value, QueryError> {
        let mut row = match row {
            Value::Object(map) => map,
            other => return Ok(other),
        };
        let mut out = Map::with_capacity(self.read_fields.len() + self.associations.len());
        for (field, column, transform) in &self.read_fields {
            if let Some(value) = row.remove(column) {
                let value = match transform {
                    Some(f) if !value.is_null() => f(value),
                    _ => value,
                };
                out.insert(field.clone(), value);
            }
        }
        for a in &self.associations {
            if let Some(nested) = row.remove(&a.field) {
                let target = a.target(registry, &self.model)?;
                let nested = target.transformer().transform_result(registry, nested)?;
                out.insert(a.field.clone(), nested);
                if a.kind == AssociationKind::BelongsTo {
                    row.remove(&a.foreign_key);
                }
            } else if a.kind == AssociationKind::BelongsTo {
                if let Some(fk) = row.remove(&a.foreign_key) {
                    out.insert(a.field.clone(), fk);
                }
            }
        }
        Ok(Value::Object(out))
    }

    /// Identifier written to a belongs-to key: a scalar id, a related object carrying its
    /// primary key, or (in filters) an operator object.
    fn identifier(&self, registry: &ModelRegistry, a: &Association, value: &Value, filter: bool) -> Result<Value, QueryError> {
        match value {
            Value::Object(map) => {
                if filter && !map.is_empty() && map.keys().all(|k| k.starts_with('$')) {
                    return Ok(value.clone());
                }
                let target = a.target(registry, &self.model)?;
                let pk = &target.def().primary_key;
                map.get(pk).cloned().ok_or_else(|| QueryError::MissingIdentifier {
                    model: target.name().to_string(),
                    field: a.field.clone(),
                })
            }
            Value::Array(items) if filter => items
                .iter()
                .map(|item| self.identifier(registry, a, item, false))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            _ => Ok(value.clone()),
        }
    }
}
