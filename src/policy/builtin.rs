//! Built-in policies: header requirements, bearer tokens, body validation.

use super::Policy;
use crate::config::AuthSettings;
use crate::error::{AppError, ConfigError, ResolutionError};
use crate::inject::{Container, Injectable};
use crate::pipeline::{RouteRequest, RouteResponse};
use crate::response::error_body;
use async_trait::async_trait;
use axum::http::StatusCode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Rejects requests missing a header. Records the header value on success.
pub struct RequireHeader {
    header: String,
    status: StatusCode,
}

impl RequireHeader {
    pub fn new(header: impl Into<String>) -> Self {
        RequireHeader {
            header: header.into().to_ascii_lowercase(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

#[async_trait]
impl Policy for RequireHeader {
    async fn handle(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<Value, AppError> {
        match req.header(&self.header).map(str::trim).filter(|s| !s.is_empty()) {
            Some(v) => Ok(Value::String(v.to_string())),
            None => {
                res.status(self.status).json(error_body(
                    "missing_header",
                    format!("{} header is required", self.header),
                    None,
                ));
                Ok(Value::Null)
            }
        }
    }
}

/// Requires `<scheme> <token>` in the configured auth header and records the token.
/// Token verification is left to policies that depend on this one.
pub struct BearerToken {
    settings: AuthSettings,
}

impl Injectable for BearerToken {
    fn inject(container: &Container) -> Result<Self, ResolutionError> {
        let settings = container
            .get::<AuthSettings>()
            .map(|s| (*s).clone())
            .unwrap_or_default();
        Ok(BearerToken { settings })
    }
}

#[async_trait]
impl Policy for BearerToken {
    async fn handle(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<Value, AppError> {
        let prefix = format!("{} ", self.settings.scheme);
        let token = req
            .header(&self.settings.header)
            .and_then(|h| h.strip_prefix(prefix.as_str()))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        match token {
            Some(t) => Ok(Value::String(t.to_string())),
            None => {
                res.status(StatusCode::UNAUTHORIZED).json(error_body(
                    "unauthorized",
                    format!("missing or invalid {} header", self.settings.header),
                    None,
                ));
                Ok(Value::Null)
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

/// Validates the JSON body against per-field rules. Fails with `AppError::Validation`.
pub struct ValidateBody {
    rules: HashMap<String, ValidationRule>,
    patterns: HashMap<String, Regex>,
    partial: bool,
}

impl ValidateBody {
    /// All required fields must be present. Fails on a rule whose pattern does not compile.
    pub fn new(rules: HashMap<String, ValidationRule>) -> Result<Self, ConfigError> {
        Self::build(rules, false)
    }

    /// Only fields present in the body are checked (PATCH-style).
    pub fn partial(rules: HashMap<String, ValidationRule>) -> Result<Self, ConfigError> {
        Self::build(rules, true)
    }

    fn build(rules: HashMap<String, ValidationRule>, partial: bool) -> Result<Self, ConfigError> {
        let mut patterns = HashMap::new();
        for (field, rule) in &rules {
            if let Some(pattern) = &rule.pattern {
                let re = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                    field: field.clone(),
                    reason: e.to_string(),
                })?;
                patterns.insert(field.clone(), re);
            }
        }
        Ok(ValidateBody { rules, patterns, partial })
    }

    pub fn validate(&self, body: &Value) -> Result<(), AppError> {
        let obj = body
            .as_object()
            .ok_or_else(|| AppError::BadRequest("body must be a JSON object".into()))?;
        if self.partial {
            for (field, v) in obj {
                if let Some(rule) = self.rules.get(field) {
                    validate_field(field, v, rule, self.patterns.get(field))?;
                }
            }
            return Ok(());
        }
        for (field, rule) in &self.rules {
            let val = obj.get(field);
            if rule.required == Some(true) && val.map_or(true, Value::is_null) {
                return Err(AppError::Validation(format!("{} is required", field)));
            }
            if let Some(v) = val {
                validate_field(field, v, rule, self.patterns.get(field))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Policy for ValidateBody {
    async fn handle(&self, req: &mut RouteRequest, _res: &mut RouteResponse) -> Result<Value, AppError> {
        self.validate(&req.body)?;
        Ok(Value::Bool(true))
    }
}

fn validate_field(field: &str, v: &Value, rule: &ValidationRule, pattern: Option<&Regex>) -> Result<(), AppError> {
    if v.is_null() {
        return Ok(());
    }
    if let Some(format) = &rule.format {
        validate_format(field, v, format)?;
    }
    if let (Some(max), Some(s)) = (rule.max_length, v.as_str()) {
        if s.chars().count() > max as usize {
            return Err(AppError::Validation(format!("{} must be at most {} characters", field, max)));
        }
    }
    if let (Some(min), Some(s)) = (rule.min_length, v.as_str()) {
        if s.chars().count() < min as usize {
            return Err(AppError::Validation(format!("{} must be at least {} characters", field, min)));
        }
    }
    if let Some(re) = pattern {
        if let Some(s) = v.as_str() {
            if !re.is_match(s) {
                return Err(AppError::Validation(format!("{} does not match required pattern", field)));
            }
        }
    }
    if let Some(allowed) = &rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            return Err(AppError::Validation(format!(
                "{} must be one of: {:?}",
                field,
                allowed.iter().take(5).collect::<Vec<_>>()
            )));
        }
    }
    if let (Some(min), Some(n)) = (rule.minimum, v.as_f64()) {
        if n < min {
            return Err(AppError::Validation(format!("{} must be at least {}", field, min)));
        }
    }
    if let (Some(max), Some(n)) = (rule.maximum, v.as_f64()) {
        if n > max {
            return Err(AppError::Validation(format!("{} must be at most {}", field, max)));
        }
    }
    Ok(())
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn validate_format(field: &str, v: &Value, format: &str) -> Result<(), AppError> {
    let Some(s) = v.as_str() else { return Ok(()) };
    match format.to_lowercase().as_str() {
        "email" if !s.contains('@') || s.len() < 3 => {
            Err(AppError::Validation(format!("{} must be a valid email", field)))
        }
        "uuid" if uuid::Uuid::parse_str(s).is_err() => {
            Err(AppError::Validation(format!("{} must be a valid UUID", field)))
        }
        "date-time" if chrono::DateTime::parse_from_rfc3339(s).is_err() => {
            Err(AppError::Validation(format!("{} must be an RFC 3339 timestamp", field)))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use serde_json::json;

    fn rules() -> HashMap<String, ValidationRule> {
        let mut rules = HashMap::new();
        rules.insert(
            "name".to_string(),
            ValidationRule {
                required: Some(true),
                max_length: Some(8),
                ..Default::default()
            },
        );
        rules.insert(
            "size".to_string(),
            ValidationRule {
                allowed: Some(vec![json!("s"), json!("m")]),
                ..Default::default()
            },
        );
        rules
    }

    #[test]
    fn validate_required_and_lengths() {
        let v = ValidateBody::new(rules()).unwrap();
        assert!(v.validate(&json!({"name": "bolt"})).is_ok());
        assert!(matches!(v.validate(&json!({"size": "s"})), Err(AppError::Validation(_))));
        assert!(matches!(v.validate(&json!({"name": "much too long"})), Err(AppError::Validation(_))));
        assert!(matches!(v.validate(&json!({"name": "a", "size": "xl"})), Err(AppError::Validation(_))));
        assert!(matches!(v.validate(&json!([1])), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn partial_skips_missing_required() {
        let v = ValidateBody::partial(rules()).unwrap();
        assert!(v.validate(&json!({"size": "m"})).is_ok());
    }

    #[test]
    fn patterns_compile_up_front() {
        let mut rules = rules();
        rules.insert(
            "sku".to_string(),
            ValidationRule {
                pattern: Some("^[A-Z]{3}-\\d+$".into()),
                ..Default::default()
            },
        );
        let v = ValidateBody::partial(rules.clone()).unwrap();
        assert!(v.validate(&json!({"sku": "ABC-12"})).is_ok());
        assert!(matches!(v.validate(&json!({"sku": "abc"})), Err(AppError::Validation(_))));

        rules.insert(
            "code".to_string(),
            ValidationRule {
                pattern: Some("([unclosed".into()),
                ..Default::default()
            },
        );
        let err = ValidateBody::new(rules).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidPattern { field, .. } if field == "code"));
    }

    #[tokio::test]
    async fn require_header_short_circuits() {
        let policy = RequireHeader::new("X-Api-Key");
        let mut req = RouteRequest::new(Method::GET, "/");
        let mut res = RouteResponse::new();
        policy.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert!(res.is_finalized());

        let mut req = RouteRequest::new(Method::GET, "/").with_header("x-api-key", "k");
        let mut res = RouteResponse::new();
        let out = policy.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(out, json!("k"));
        assert!(!res.is_finalized());
    }

    #[tokio::test]
    async fn bearer_token_uses_settings() {
        let container = Container::new();
        container.register(AuthSettings {
            header: "x-auth".into(),
            scheme: "Token".into(),
        });
        let policy = BearerToken::inject(&container).unwrap();

        let mut req = RouteRequest::new(Method::GET, "/").with_header("x-auth", "Token abc");
        let mut res = RouteResponse::new();
        assert_eq!(policy.handle(&mut req, &mut res).await.unwrap(), json!("abc"));

        let mut req = RouteRequest::new(Method::GET, "/").with_header("x-auth", "Bearer abc");
        let mut res = RouteResponse::new();
        policy.handle(&mut req, &mut res).await.unwrap();
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
    }
}
