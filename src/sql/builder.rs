//! Builds parameterized SELECT, COUNT, INSERT, UPDATE, DELETE for registered models.
//! Identifiers come from model definitions only; values are always bound.

use super::params::PgBindValue;
use crate::error::QueryError;
use crate::model::{AssociationKind, IncludePlan, ModelDef};
use serde_json::{Map, Value};

/// Largest LIMIT a query may carry.
pub const MAX_LIMIT: u32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Quote identifier for PostgreSQL.
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn qualified_table(def: &ModelDef) -> String {
    match &def.schema {
        Some(schema) => format!("{}.{}", quoted(schema), quoted(&def.table)),
        None => quoted(&def.table),
    }
}

fn alias(depth: usize) -> String {
    format!("t{}", depth)
}

#[derive(Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    fn new() -> Self {
        Self::default()
    }

    /// Bind `v` and return its placeholder, cast when the column declares one.
    fn placeholder(&mut self, v: PgBindValue, cast: Option<&str>) -> String {
        self.params.push(v);
        let n = self.params.len();
        match cast {
            Some(t) => format!("${}::{}", n, t),
            None => format!("${}", n),
        }
    }
}

/// Options for [`select`] already rewritten to column names.
#[derive(Debug, Default)]
pub struct SelectSpec<'a> {
    pub filter: Map<String, Value>,
    pub includes: &'a [IncludePlan<'a>],
    pub order: Vec<(String, SortDirection)>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn column_list(def: &ModelDef, table_alias: &str) -> Vec<String> {
    def.columns()
        .into_iter()
        .map(|c| format!("{}.{} AS {}", table_alias, quoted(c), quoted(c)))
        .collect()
}

/// Eager-loaded association as a scalar `row_to_json` subquery, nesting its own includes.
fn include_subquery(parent: &ModelDef, plan: &IncludePlan<'_>, depth: usize) -> String {
    let parent_alias = alias(depth);
    let own_alias = alias(depth + 1);
    let target = plan.target.def();
    let mut cols = column_list(target, &own_alias);
    for child in &plan.children {
        cols.push(format!("{} AS {}", include_subquery(target, child, depth + 1), quoted(child.field)));
    }
    let join = match plan.kind {
        AssociationKind::BelongsTo => format!(
            "{}.{} = {}.{}",
            own_alias,
            quoted(target.primary_key_column()),
            parent_alias,
            quoted(plan.foreign_key)
        ),
        AssociationKind::HasOne => format!(
            "{}.{} = {}.{}",
            own_alias,
            quoted(plan.foreign_key),
            parent_alias,
            quoted(parent.primary_key_column())
        ),
    };
    let order = match plan.kind {
        AssociationKind::HasOne => format!(" ORDER BY {}.{}", own_alias, quoted(target.primary_key_column())),
        AssociationKind::BelongsTo => String::new(),
    };
    format!(
        "(SELECT row_to_json(sub) FROM (SELECT {} FROM {} {} WHERE {}{} LIMIT 1) sub)",
        cols.join(", "),
        qualified_table(target),
        own_alias,
        join,
        order
    )
}

fn operator(op: &str) -> Option<&'static str> {
    Some(match op {
        "$eq" => "=",
        "$ne" => "<>",
        "$gt" => ">",
        "$gte" => ">=",
        "$lt" => "<",
        "$lte" => "<=",
        "$like" => "LIKE",
        "$ilike" => "ILIKE",
        _ => return None,
    })
}

/// `IN` list for an array operand. A `null` member matches NULL (or, negated, excludes it).
fn in_list(q: &mut QueryBuf, target: &str, items: &[Value], cast: Option<&str>, negate: bool) -> String {
    let with_null = items.iter().any(Value::is_null);
    let placeholders: Vec<String> = items
        .iter()
        .filter_map(PgBindValue::from_json)
        .map(|v| q.placeholder(v, cast))
        .collect();
    let list = placeholders.join(", ");
    match (placeholders.is_empty(), with_null, negate) {
        (true, false, false) => "FALSE".to_string(),
        (true, false, true) => "TRUE".to_string(),
        (true, true, false) => format!("{} IS NULL", target),
        (true, true, true) => format!("{} IS NOT NULL", target),
        (false, false, false) => format!("{} IN ({})", target, list),
        (false, false, true) => format!("{} NOT IN ({})", target, list),
        (false, true, false) => format!("({} IN ({}) OR {} IS NULL)", target, list, target),
        (false, true, true) => format!("({} NOT IN ({}) AND {} IS NOT NULL)", target, list, target),
    }
}

fn condition(q: &mut QueryBuf, def: &ModelDef, target: &str, column: &str, value: &Value) -> Result<Vec<String>, QueryError> {
    let cast = def.cast_for(column);
    let unsupported = |reason: String| QueryError::UnsupportedQuery {
        model: def.name.clone(),
        reason,
    };
    Ok(match value {
        Value::Null => vec![format!("{} IS NULL", target)],
        Value::Array(items) => vec![in_list(q, target, items, cast, false)],
        Value::Object(ops) => {
            if ops.is_empty() {
                return Err(unsupported(format!("empty condition on '{}'", column)));
            }
            let mut parts = Vec::with_capacity(ops.len());
            for (op, operand) in ops {
                let part = match (op.as_str(), operand) {
                    ("$in", Value::Array(items)) => in_list(q, target, items, cast, false),
                    ("$nin", Value::Array(items)) => in_list(q, target, items, cast, true),
                    ("$eq", Value::Null) => format!("{} IS NULL", target),
                    ("$ne", Value::Null) => format!("{} IS NOT NULL", target),
                    (op, Value::Array(_) | Value::Object(_)) => {
                        return Err(unsupported(format!("operator '{}' on '{}' needs a scalar", op, column)))
                    }
                    (op, operand) => {
                        let sql_op = operator(op).ok_or_else(|| unsupported(format!("unknown operator '{}'", op)))?;
                        match PgBindValue::from_json(operand) {
                            Some(v) => format!("{} {} {}", target, sql_op, q.placeholder(v, cast)),
                            None => return Err(unsupported(format!("operator '{}' on '{}' compared with null", op, column))),
                        }
                    }
                };
                parts.push(part);
            }
            parts
        }
        scalar => match PgBindValue::from_json(scalar) {
            Some(v) => vec![format!("{} = {}", target, q.placeholder(v, cast))],
            None => vec![format!("{} IS NULL", target)],
        },
    })
}

/// WHERE clause (with leading space) for a column-keyed filter. Columns the model does
/// not carry are rejected.
fn where_clause(q: &mut QueryBuf, def: &ModelDef, table_alias: Option<&str>, filter: &Map<String, Value>) -> Result<String, QueryError> {
    let mut parts = Vec::new();
    for (column, value) in filter {
        if !def.has_column(column) {
            return Err(QueryError::UnknownField {
                model: def.name.clone(),
                field: column.clone(),
            });
        }
        let target = match table_alias {
            Some(a) => format!("{}.{}", a, quoted(column)),
            None => quoted(column),
        };
        parts.extend(condition(q, def, &target, column, value)?);
    }
    Ok(if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    })
}

/// SELECT with includes as scalar subqueries, ORDER BY (primary key by default), and
/// optional LIMIT/OFFSET.
pub fn select(def: &ModelDef, spec: &SelectSpec<'_>) -> Result<QueryBuf, QueryError> {
    let mut q = QueryBuf::new();
    let main = alias(0);
    let mut select_parts = column_list(def, &main);
    for plan in spec.includes {
        select_parts.push(format!("{} AS {}", include_subquery(def, plan, 0), quoted(plan.field)));
    }
    let where_sql = where_clause(&mut q, def, Some(main.as_str()), &spec.filter)?;

    let mut order_parts = Vec::new();
    for (column, direction) in &spec.order {
        if !def.has_column(column) {
            return Err(QueryError::UnknownField {
                model: def.name.clone(),
                field: column.clone(),
            });
        }
        let dir = match direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        order_parts.push(format!("{}.{} {}", main, quoted(column), dir));
    }
    if order_parts.is_empty() {
        order_parts.push(format!("{}.{}", main, quoted(def.primary_key_column())));
    }
    let limit_sql = spec.limit.map(|n| format!(" LIMIT {}", n.min(MAX_LIMIT))).unwrap_or_default();
    let offset_sql = spec.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();

    q.sql = format!(
        "SELECT {} FROM {} {}{} ORDER BY {}{}{}",
        select_parts.join(", "),
        qualified_table(def),
        main,
        where_sql,
        order_parts.join(", "),
        limit_sql,
        offset_sql
    );
    Ok(q)
}

pub fn count(def: &ModelDef, filter: &Map<String, Value>) -> Result<QueryBuf, QueryError> {
    let mut q = QueryBuf::new();
    let main = alias(0);
    let where_sql = where_clause(&mut q, def, Some(main.as_str()), filter)?;
    q.sql = format!("SELECT COUNT(*) AS \"count\" FROM {} {}{}", qualified_table(def), main, where_sql);
    Ok(q)
}

fn returning(def: &ModelDef) -> String {
    def.columns().into_iter().map(quoted).collect::<Vec<_>>().join(", ")
}

/// INSERT of the given columns; omitted columns take their database default.
pub fn insert(def: &ModelDef, values: &Map<String, Value>) -> Result<QueryBuf, QueryError> {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for (column, value) in values {
        if !def.has_column(column) {
            return Err(QueryError::UnknownField {
                model: def.name.clone(),
                field: column.clone(),
            });
        }
        cols.push(quoted(column));
        placeholders.push(match PgBindValue::from_json(value) {
            Some(v) => q.placeholder(v, def.cast_for(column)),
            None => "NULL".to_string(),
        });
    }
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", qualified_table(def), returning(def))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            qualified_table(def),
            cols.join(", "),
            placeholders.join(", "),
            returning(def)
        )
    };
    Ok(q)
}

/// UPDATE rows matching `filter`. With nothing to set this degrades to a SELECT of the
/// matching rows. An empty filter is refused.
pub fn update(def: &ModelDef, values: &Map<String, Value>, filter: &Map<String, Value>) -> Result<QueryBuf, QueryError> {
    if filter.is_empty() {
        return Err(QueryError::EmptyWhere {
            model: def.name.clone(),
            operation: "update",
        });
    }
    let pk = def.primary_key_column();
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for (column, value) in values {
        if column == pk {
            continue;
        }
        if !def.has_column(column) {
            return Err(QueryError::UnknownField {
                model: def.name.clone(),
                field: column.clone(),
            });
        }
        let rhs = match PgBindValue::from_json(value) {
            Some(v) => q.placeholder(v, def.cast_for(column)),
            None => "NULL".to_string(),
        };
        sets.push(format!("{} = {}", quoted(column), rhs));
    }
    if sets.is_empty() {
        return select(
            def,
            &SelectSpec {
                filter: filter.clone(),
                ..Default::default()
            },
        );
    }
    let where_sql = where_clause(&mut q, def, None, filter)?;
    q.sql = format!(
        "UPDATE {} SET {}{} RETURNING {}",
        qualified_table(def),
        sets.join(", "),
        where_sql,
        returning(def)
    );
    Ok(q)
}

/// DELETE rows matching `filter`. An empty filter is refused.
pub fn delete(def: &ModelDef, filter: &Map<String, Value>) -> Result<QueryBuf, QueryError> {
    if filter.is_empty() {
        return Err(QueryError::EmptyWhere {
            model: def.name.clone(),
            operation: "destroy",
        });
    }
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, def, None, filter)?;
    q.sql = format!("DELETE FROM {}{}", qualified_table(def), where_sql);
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, Include, ModelRegistry};
    use serde_json::json;

    fn registry() -> ModelRegistry {
        ModelRegistry::builder()
            .model(
                ModelDef::new("Post", "posts")
                    .schema("blog")
                    .field(FieldDef::new("id").cast("int8"))
                    .field(FieldDef::new("title"))
                    .field(FieldDef::timestamp("publishedAt"))
                    .belongs_to("author", "User", "author_id")
                    .has_one("cover", "Image", "post_id"),
            )
            .model(
                ModelDef::new("User", "users")
                    .field(FieldDef::new("id"))
                    .field(FieldDef::new("name"))
                    .belongs_to("manager", "User", "manager_id"),
            )
            .model(
                ModelDef::new("Image", "images")
                    .field(FieldDef::new("id"))
                    .belongs_to("post", "Post", "post_id"),
            )
            .finish()
            .unwrap()
    }

    fn filter(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn select_with_filters_and_paging() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let q = select(
            post.def(),
            &SelectSpec {
                filter: filter(json!({ "id": "5", "author_id": null })),
                limit: Some(5000),
                offset: Some(20),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT t0.\"id\" AS \"id\", t0.\"title\" AS \"title\", t0.\"published_at\" AS \"published_at\", \
             t0.\"author_id\" AS \"author_id\" FROM \"blog\".\"posts\" t0 \
             WHERE t0.\"author_id\" IS NULL AND t0.\"id\" = $1::int8 ORDER BY t0.\"id\" LIMIT 1000 OFFSET 20"
        );
        assert_eq!(q.params, vec![PgBindValue::Text("5".into())]);
    }

    #[test]
    fn operators_and_lists() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let q = count(
            post.def(),
            &filter(json!({
                "id": { "$gte": 2, "$lt": 9 },
                "title": { "$like": "Hello%" },
                "author_id": [1, null, 3],
                "published_at": { "$ne": null }
            })),
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT COUNT(*) AS \"count\" FROM \"blog\".\"posts\" t0 WHERE (t0.\"author_id\" IN ($1, $2) OR t0.\"author_id\" IS NULL) \
             AND t0.\"id\" >= $3::int8 AND t0.\"id\" < $4::int8 AND t0.\"published_at\" IS NOT NULL \
             AND t0.\"title\" LIKE $5"
        );
        assert_eq!(q.params.len(), 5);
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let q = count(post.def(), &filter(json!({ "author_id": [] }))).unwrap();
        assert!(q.sql.ends_with("WHERE FALSE"));
    }

    #[test]
    fn null_members_of_lists() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let q = count(post.def(), &filter(json!({ "author_id": [null] }))).unwrap();
        assert!(q.sql.ends_with("WHERE t0.\"author_id\" IS NULL"));
        assert!(q.params.is_empty());

        let q = count(post.def(), &filter(json!({ "author_id": { "$nin": [4, null] } }))).unwrap();
        assert!(q.sql.ends_with("WHERE (t0.\"author_id\" NOT IN ($1) AND t0.\"author_id\" IS NOT NULL)"));
        assert_eq!(q.params.len(), 1);
    }

    #[test]
    fn unknown_columns_and_operators_are_rejected() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let err = count(post.def(), &filter(json!({ "legacy_flag": true }))).unwrap_err();
        assert!(matches!(err, QueryError::UnknownField { .. }));
        let err = count(post.def(), &filter(json!({ "id": { "$regex": "x" } }))).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedQuery { .. }));
    }

    #[test]
    fn includes_nest_as_scalar_subqueries() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let plans = post
            .transformer()
            .transform_include(&registry, &Include::paths(["author.manager", "cover"]))
            .unwrap();
        let q = select(
            post.def(),
            &SelectSpec {
                includes: &plans,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(q.sql.contains(
            "(SELECT row_to_json(sub) FROM (SELECT t1.\"id\" AS \"id\", t1.\"name\" AS \"name\", \
             t1.\"manager_id\" AS \"manager_id\", (SELECT row_to_json(sub) FROM (SELECT t2.\"id\" AS \"id\", \
             t2.\"name\" AS \"name\", t2.\"manager_id\" AS \"manager_id\" FROM \"users\" t2 \
             WHERE t2.\"id\" = t1.\"manager_id\" LIMIT 1) sub) AS \"manager\" FROM \"users\" t1 \
             WHERE t1.\"id\" = t0.\"author_id\" LIMIT 1) sub) AS \"author\""
        ));
        assert!(q.sql.contains(
            "FROM \"images\" t1 WHERE t1.\"post_id\" = t0.\"id\" ORDER BY t1.\"id\" LIMIT 1) sub) AS \"cover\""
        ));
    }

    #[test]
    fn insert_writes_null_literals() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let q = insert(post.def(), &filter(json!({ "title": "Hi", "published_at": null }))).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO \"blog\".\"posts\" (\"published_at\", \"title\") VALUES (NULL, $1) \
             RETURNING \"id\", \"title\", \"published_at\", \"author_id\""
        );
        assert_eq!(q.params, vec![PgBindValue::Text("Hi".into())]);

        let q = insert(post.def(), &Map::new()).unwrap();
        assert!(q.sql.starts_with("INSERT INTO \"blog\".\"posts\" DEFAULT VALUES"));
    }

    #[test]
    fn update_and_delete_require_a_filter() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let values = filter(json!({ "id": 3, "title": "New", "published_at": "2024-01-01T00:00:00Z" }));
        let q = update(post.def(), &values, &filter(json!({ "id": 3 }))).unwrap();
        assert_eq!(
            q.sql,
            "UPDATE \"blog\".\"posts\" SET \"published_at\" = $1::timestamptz, \"title\" = $2 \
             WHERE \"id\" = $3::int8 RETURNING \"id\", \"title\", \"published_at\", \"author_id\""
        );
        assert!(matches!(
            update(post.def(), &values, &Map::new()),
            Err(QueryError::EmptyWhere { operation: "update", .. })
        ));

        let q = delete(post.def(), &filter(json!({ "id": 3 }))).unwrap();
        assert_eq!(q.sql, "DELETE FROM \"blog\".\"posts\" WHERE \"id\" = $1::int8");
        assert!(matches!(delete(post.def(), &Map::new()), Err(QueryError::EmptyWhere { .. })));
    }
}
