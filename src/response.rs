//! Standard response envelope helpers.

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Serialize)]
pub struct SuccessMany<T> {
    pub data: Vec<T>,
    pub meta: MetaCount,
}

#[derive(Serialize)]
pub struct MetaCount {
    pub count: u64,
}

pub fn success_one<T: Serialize>(data: T) -> Value {
    serde_json::to_value(SuccessOne { data, meta: None }).unwrap_or(Value::Null)
}

/// List envelope. `count` is the total when paginating, else the number of rows.
pub fn success_many<T: Serialize>(data: Vec<T>, count: Option<u64>) -> Value {
    let count = count.unwrap_or(data.len() as u64);
    serde_json::to_value(SuccessMany {
        data,
        meta: MetaCount { count },
    })
    .unwrap_or(Value::Null)
}

pub fn error_body(code: &str, message: String, details: Option<Value>) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
