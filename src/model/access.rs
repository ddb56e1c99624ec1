//! Model access operations over PostgreSQL.

use super::registry::ModelRef;
use super::transform::{merge_include, Include};
use crate::error::{AppError, QueryError};
use crate::sql::{self, QueryBuf, SelectSpec, SortDirection};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Acquire, PgConnection, Postgres, Row};

/// Query options for the find operations. `filter` is field-keyed and may name
/// associations.
#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    pub filter: Value,
    pub include: Vec<Include>,
    pub order: Vec<(String, SortDirection)>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    /// Eager-load a dotted association path, e.g. `"author.manager"`.
    pub fn include(mut self, path: &str) -> Self {
        merge_include(&mut self.include, Include::path(path));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Rows of one page plus the total matching the filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub rows: Vec<Value>,
    pub count: u64,
}

impl<'r> ModelRef<'r> {
    fn filter(&self, filter: &Value) -> Result<Map<String, Value>, QueryError> {
        self.transformer().transform_where(self.registry(), filter)
    }

    fn order_columns(&self, order: &[(String, SortDirection)]) -> Result<Vec<(String, SortDirection)>, QueryError> {
        let def = self.def();
        order
            .iter()
            .map(|(field, dir)| match def.find_field(field) {
                Some(f) => Ok((f.column.clone(), *dir)),
                None if def.has_column(field) => Ok((field.clone(), *dir)),
                None => Err(QueryError::UnknownField {
                    model: def.name.clone(),
                    field: field.clone(),
                }),
            })
            .collect()
    }

    fn wrap(&self, rows: Vec<Value>) -> Result<Vec<Value>, AppError> {
        rows.into_iter()
            .map(|row| self.transformer().transform_result(self.registry(), row).map_err(AppError::from))
            .collect()
    }

    async fn select_rows(&self, conn: &mut PgConnection, options: &FindOptions, filter: Map<String, Value>) -> Result<Vec<Value>, AppError> {
        let includes = self.transformer().transform_include(self.registry(), &options.include)?;
        let spec = SelectSpec {
            filter,
            includes: &includes,
            order: self.order_columns(&options.order)?,
            limit: options.limit,
            offset: options.offset,
        };
        let q = sql::select(self.def(), &spec)?;
        let rows = fetch_all(conn, &q).await?;
        self.wrap(rows)
    }

    async fn count_rows(&self, conn: &mut PgConnection, filter: &Map<String, Value>) -> Result<u64, AppError> {
        let q = sql::count(self.def(), filter)?;
        let row = bind(&q).fetch_one(&mut *conn).await?;
        let n: i64 = row.try_get("count")?;
        Ok(n.max(0) as u64)
    }

    async fn insert_row(&self, conn: &mut PgConnection, values: &Value) -> Result<Value, AppError> {
        let values = self.transformer().transform_values(self.registry(), values)?;
        let q = sql::insert(self.def(), &values)?;
        let row = fetch_optional(conn, &q).await?.ok_or(AppError::Db(sqlx::Error::RowNotFound))?;
        Ok(self.transformer().transform_result(self.registry(), row)?)
    }

    async fn update_rows(&self, conn: &mut PgConnection, values: &Value, filter: &Value) -> Result<Vec<Value>, AppError> {
        let values = self.transformer().transform_values(self.registry(), values)?;
        let q = sql::update(self.def(), &values, &self.filter(filter)?)?;
        let rows = fetch_all(conn, &q).await?;
        self.wrap(rows)
    }

    /// Insert one row from field-keyed values and return it.
    pub async fn create<'c, A>(&self, conn: A, values: &Value) -> Result<Value, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let mut conn = conn.acquire().await?;
        self.insert_row(&mut *conn, values).await
    }

    /// Row with the given primary key, further narrowed by `options.filter`.
    pub async fn find_by_id<'c, A>(&self, conn: A, id: &Value, options: &FindOptions) -> Result<Option<Value>, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        if id.is_null() {
            return Ok(None);
        }
        let mut filter = self.filter(&options.filter)?;
        filter.insert(self.def().primary_key_column().to_string(), id.clone());
        let mut conn = conn.acquire().await?;
        let single = FindOptions {
            limit: Some(1),
            offset: None,
            ..options.clone()
        };
        Ok(self.select_rows(&mut *conn, &single, filter).await?.into_iter().next())
    }

    pub async fn find_one<'c, A>(&self, conn: A, options: &FindOptions) -> Result<Option<Value>, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let filter = self.filter(&options.filter)?;
        let mut conn = conn.acquire().await?;
        let single = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.select_rows(&mut *conn, &single, filter).await?.into_iter().next())
    }

    pub async fn find_all<'c, A>(&self, conn: A, options: &FindOptions) -> Result<Vec<Value>, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let filter = self.filter(&options.filter)?;
        let mut conn = conn.acquire().await?;
        self.select_rows(&mut *conn, options, filter).await
    }

    /// One page of rows and the count of all rows matching the filter.
    pub async fn find_and_count_all<'c, A>(&self, conn: A, options: &FindOptions) -> Result<Page, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let filter = self.filter(&options.filter)?;
        let mut conn = conn.acquire().await?;
        let count = self.count_rows(&mut *conn, &filter).await?;
        let rows = self.select_rows(&mut *conn, options, filter).await?;
        Ok(Page { rows, count })
    }

    pub async fn count<'c, A>(&self, conn: A, filter: &Value) -> Result<u64, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let filter = self.filter(filter)?;
        let mut conn = conn.acquire().await?;
        self.count_rows(&mut *conn, &filter).await
    }

    /// Update every row matching `filter` and return the updated rows.
    pub async fn update<'c, A>(&self, conn: A, values: &Value, filter: &Value) -> Result<Vec<Value>, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let mut conn = conn.acquire().await?;
        self.update_rows(&mut *conn, values, filter).await
    }

    /// Delete every row matching `filter`; returns how many went.
    pub async fn destroy<'c, A>(&self, conn: A, filter: &Value) -> Result<u64, AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let q = sql::delete(self.def(), &self.filter(filter)?)?;
        let mut conn = conn.acquire().await?;
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let done = bind(&q).execute(&mut *conn).await?;
        Ok(done.rows_affected())
    }

    /// Update the row matching `filter`, or create one from `filter` merged with
    /// `values`, in one transaction. Returns the row and whether it was created.
    /// Best effort: a concurrent writer in another transaction can still race the read.
    pub async fn update_or_create<'c, A>(&self, conn: A, filter: &Value, values: &Value) -> Result<(Value, bool), AppError>
    where
        A: Acquire<'c, Database = Postgres>,
    {
        let mut tx = conn.begin().await?;
        match self.upsert_in(&mut *tx, filter, values).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(model = self.name(), error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn upsert_in(&self, conn: &mut PgConnection, filter: &Value, values: &Value) -> Result<(Value, bool), AppError> {
        let options = FindOptions {
            filter: filter.clone(),
            limit: Some(1),
            ..Default::default()
        };
        let existing = self
            .select_rows(conn, &options, self.filter(filter)?)
            .await?
            .into_iter()
            .next();
        let pk = self.def().primary_key.clone();
        match existing {
            Some(row) => {
                let id = row.get(&pk).cloned().ok_or_else(|| QueryError::MissingIdentifier {
                    model: self.name().to_string(),
                    field: pk.clone(),
                })?;
                let by_id = Value::Object(Map::from_iter([(pk, id)]));
                self.update_rows(conn, values, &by_id).await?;
                let refreshed = self.select_rows(conn, &FindOptions::new().filter(by_id.clone()), self.filter(&by_id)?).await?;
                let row = refreshed.into_iter().next().ok_or(AppError::Db(sqlx::Error::RowNotFound))?;
                Ok((row, false))
            }
            None => {
                let mut merged = match filter {
                    Value::Object(m) => m.clone(),
                    _ => Map::new(),
                };
                if let Value::Object(v) = values {
                    merged.extend(v.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                let row = self.insert_row(conn, &Value::Object(merged)).await?;
                Ok((row, true))
            }
        }
    }
}

fn bind(q: &QueryBuf) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    query
}

async fn fetch_all(conn: &mut PgConnection, q: &QueryBuf) -> Result<Vec<Value>, AppError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let rows = bind(q).fetch_all(&mut *conn).await?;
    Ok(rows.iter().map(row_to_json).collect())
}

async fn fetch_optional(conn: &mut PgConnection, q: &QueryBuf) -> Result<Option<Value>, AppError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let row = bind(q).fetch_optional(&mut *conn).await?;
    Ok(row.map(|r| row_to_json(&r)))
}

/// Column-keyed JSON object for one row.
pub(crate) fn row_to_json(row: &PgRow) -> Value {
    use sqlx::Column;
    let mut map = Map::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    Value::Object(map)
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
