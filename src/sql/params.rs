//! Convert serde_json::Value to values sqlx can bind.

use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::{Database, Type};

/// A non-null value bound to a PostgreSQL query. Nulls never reach a bind: the builder
/// writes them as `NULL` / `IS NULL` literals. Each variant declares its own wire type,
/// so a cast in the SQL (`$1::timestamptz`) decides how text is interpreted.
#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl PgBindValue {
    /// `None` for JSON null.
    pub fn from_json(v: &Value) -> Option<Self> {
        Some(match v {
            Value::Null => return None,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PgBindValue::Int(i),
                None => match n.as_f64() {
                    Some(f) => PgBindValue::Float(f),
                    None => PgBindValue::Text(n.to_string()),
                },
            },
            Value::String(s) => PgBindValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => PgBindValue::Json(v.clone()),
        })
    }

    fn pg_type(&self) -> PgTypeInfo {
        match self {
            PgBindValue::Bool(_) => <bool as Type<Postgres>>::type_info(),
            PgBindValue::Int(_) => <i64 as Type<Postgres>>::type_info(),
            PgBindValue::Float(_) => <f64 as Type<Postgres>>::type_info(),
            PgBindValue::Text(_) => <String as Type<Postgres>>::type_info(),
            PgBindValue::Json(_) => <Value as Type<Postgres>>::type_info(),
        }
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        match self {
            PgBindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf),
            PgBindValue::Int(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf),
            PgBindValue::Float(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf),
            PgBindValue::Text(s) => <String as Encode<Postgres>>::encode_by_ref(s, buf),
            PgBindValue::Json(v) => <Value as Encode<Postgres>>::encode_by_ref(v, buf),
        }
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(self.pg_type())
    }
}

impl Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_scalars_map_to_typed_binds() {
        assert_eq!(PgBindValue::from_json(&Value::Null), None);
        assert_eq!(PgBindValue::from_json(&json!(3)), Some(PgBindValue::Int(3)));
        assert_eq!(PgBindValue::from_json(&json!(2.5)), Some(PgBindValue::Float(2.5)));
        assert_eq!(PgBindValue::from_json(&json!("x")), Some(PgBindValue::Text("x".into())));
        assert_eq!(PgBindValue::from_json(&json!({"a": 1})), Some(PgBindValue::Json(json!({"a": 1}))));
    }

    #[test]
    fn each_variant_declares_its_wire_type() {
        assert_eq!(PgBindValue::Int(1).produces(), Some(<i64 as Type<Postgres>>::type_info()));
        assert_eq!(PgBindValue::Text("a".into()).produces(), Some(<String as Type<Postgres>>::type_info()));
        assert_eq!(PgBindValue::Json(json!([])).produces(), Some(<Value as Type<Postgres>>::type_info()));
    }
}
