//! Model declarations: fields, column mapping, associations.

use crate::case::to_snake_case;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Read-side conversion applied to a column value before it reaches the domain object.
pub type FieldTransform = fn(Value) -> Value;

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub column: String,
    /// Postgres type the bound parameter is cast to (`$1::timestamptz`).
    pub sql_cast: Option<String>,
    pub transform: Option<FieldTransform>,
}

impl FieldDef {
    /// Field stored in the snake_case column of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        FieldDef {
            column: to_snake_case(&name),
            name,
            sql_cast: None,
            transform: None,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn cast(mut self, pg_type: impl Into<String>) -> Self {
        self.sql_cast = Some(pg_type.into());
        self
    }

    pub fn transform(mut self, transform: FieldTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// `timestamptz` column surfaced as an RFC 3339 string.
    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name).cast("timestamptz").transform(timestamp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationKind {
    /// This model holds the foreign key.
    BelongsTo,
    /// The target model holds the foreign key.
    HasOne,
}

#[derive(Clone, Debug)]
pub struct AssociationDef {
    pub kind: AssociationKind,
    pub field: String,
    pub target: String,
    pub foreign_key: String,
}

#[derive(Clone, Debug)]
pub struct ModelDef {
    pub name: String,
    pub schema: Option<String>,
    pub table: String,
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
    pub associations: Vec<AssociationDef>,
}

impl ModelDef {
    /// A model with an `id` primary key field, not yet declared.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        ModelDef {
            name: name.into(),
            schema: None,
            table: table.into(),
            primary_key: "id".into(),
            fields: Vec::new(),
            associations: Vec::new(),
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// `field` refers to one `target` row through this model's `foreign_key` column.
    pub fn belongs_to(mut self, field: impl Into<String>, target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        self.associations.push(AssociationDef {
            kind: AssociationKind::BelongsTo,
            field: field.into(),
            target: target.into(),
            foreign_key: foreign_key.into(),
        });
        self
    }

    /// `field` is the `target` row whose `foreign_key` column points back at this model.
    pub fn has_one(mut self, field: impl Into<String>, target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        self.associations.push(AssociationDef {
            kind: AssociationKind::HasOne,
            field: field.into(),
            target: target.into(),
            foreign_key: foreign_key.into(),
        });
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn find_association(&self, field: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.field == field)
    }

    /// Columns this model's table carries: declared fields, then belongs-to keys.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.fields.iter().map(|f| f.column.as_str()).collect();
        for a in &self.associations {
            if a.kind == AssociationKind::BelongsTo && !columns.contains(&a.foreign_key.as_str()) {
                columns.push(a.foreign_key.as_str());
            }
        }
        columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    pub fn cast_for(&self, column: &str) -> Option<&str> {
        self.field_by_column(column).and_then(|f| f.sql_cast.as_deref())
    }

    pub fn primary_key_column(&self) -> &str {
        self.find_field(&self.primary_key)
            .map(|f| f.column.as_str())
            .unwrap_or(self.primary_key.as_str())
    }
}

/// Normalize timestamps to RFC 3339 in UTC. Unparseable values pass through.
pub fn timestamp(value: Value) -> Value {
    let Value::String(s) = &value else {
        return value;
    };
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Value::String(d.with_timezone(&Utc).to_rfc3339());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(d) = DateTime::parse_from_str(s, format) {
            return Value::String(d.with_timezone(&Utc).to_rfc3339());
        }
        if let Ok(d) = NaiveDateTime::parse_from_str(s, format) {
            return Value::String(d.and_utc().to_rfc3339());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(d) = d.and_hms_opt(0, 0, 0) {
            return Value::String(d.and_utc().to_rfc3339());
        }
    }
    value
}

/// Coerce 0/1 and "t"/"f"/"true"/"false" to booleans.
pub fn boolean(value: Value) -> Value {
    match &value {
        Value::Number(n) => match n.as_i64() {
            Some(0) => Value::Bool(false),
            Some(1) => Value::Bool(true),
            _ => value,
        },
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "yes" => Value::Bool(true),
            "f" | "false" | "0" | "no" => Value::Bool(false),
            _ => value,
        },
        _ => value,
    }
}
