//! Payload validation for registered topics
//!
//! The dispatcher only depends on the [`Validator`] capability
//! (`check` + `errors`). [`ObjectSchema`] is a small built-in validator
//! covering required fields and JSON types addressed by dot-path.

use crate::error::{Result, TxLogError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Dot-path of the offending field (empty for the root)
    pub path: String,
    pub message: String,
}

/// Schema check capability supplied per topic or route
pub trait Validator: Send + Sync {
    /// True when `data` satisfies the schema
    fn check(&self, data: &Value) -> bool {
        self.errors(data).is_empty()
    }

    /// Every issue found in `data`, in declaration order
    fn errors(&self, data: &Value) -> Vec<ValidationIssue>;
}

/// JSON type expected at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Any,
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
}

impl JsonType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::Any => true,
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Bool => value.is_boolean(),
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            JsonType::Any => "any",
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Bool => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldRule {
    path: String,
    expected: JsonType,
    required: bool,
}

/// Object validator built from dot-path field rules
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    fields: Vec<FieldRule>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// `path` must exist and hold a value of type `expected`
    pub fn required(mut self, path: impl Into<String>, expected: JsonType) -> Self {
        self.fields.push(FieldRule {
            path: path.into(),
            expected,
            required: true,
        });
        self
    }

    /// `path` may be absent; when present it must hold `expected`
    pub fn optional(mut self, path: impl Into<String>, expected: JsonType) -> Self {
        self.fields.push(FieldRule {
            path: path.into(),
            expected,
            required: false,
        });
        self
    }
}

impl Validator for ObjectSchema {
    fn errors(&self, data: &Value) -> Vec<ValidationIssue> {
        if !data.is_object() {
            return vec![ValidationIssue {
                path: String::new(),
                message: "Expected object".to_string(),
            }];
        }

        let mut issues = Vec::new();
        for rule in &self.fields {
            match lookup(data, &rule.path) {
                None | Some(Value::Null) if rule.required => issues.push(ValidationIssue {
                    path: rule.path.clone(),
                    message: "Required property".to_string(),
                }),
                None | Some(Value::Null) => {}
                Some(value) if !rule.expected.matches(value) => issues.push(ValidationIssue {
                    path: rule.path.clone(),
                    message: format!("Expected {}", rule.expected.name()),
                }),
                Some(_) => {}
            }
        }
        issues
    }
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Validators registered for one topic
#[derive(Clone, Default)]
pub struct TopicSchema {
    pub body: Option<Arc<dyn Validator>>,
    pub headers: Option<Arc<dyn Validator>>,
}

impl std::fmt::Debug for TopicSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSchema")
            .field("body", &self.body.is_some())
            .field("headers", &self.headers.is_some())
            .finish()
    }
}

impl TopicSchema {
    pub fn body(validator: impl Validator + 'static) -> Self {
        Self {
            body: Some(Arc::new(validator)),
            headers: None,
        }
    }

    pub fn with_headers(mut self, validator: impl Validator + 'static) -> Self {
        self.headers = Some(Arc::new(validator));
        self
    }

    /// Check body then headers; the first issue becomes a validation error
    pub fn validate(&self, body: &Value, headers: &Value) -> Result<()> {
        let targets = [(&self.body, body, "body"), (&self.headers, headers, "headers")];
        for (validator, data, part) in targets {
            let Some(validator) = validator else {
                continue;
            };
            if validator.check(data) {
                continue;
            }
            let issue = validator
                .errors(data)
                .into_iter()
                .next()
                .unwrap_or_else(|| ValidationIssue {
                    path: String::new(),
                    message: "Invalid schema".to_string(),
                });
            let path = if issue.path.is_empty() {
                part.to_string()
            } else {
                format!("{}.{}", part, issue.path)
            };
            return Err(TxLogError::validation(path, issue.message));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> ObjectSchema {
        ObjectSchema::new()
            .required("email", JsonType::String)
            .required("profile.age", JsonType::Integer)
            .optional("tags", JsonType::Array)
    }

    #[test]
    fn test_valid_payload() {
        let data = json!({"email": "a@b.io", "profile": {"age": 30}});
        assert!(user_schema().check(&data));
        assert!(user_schema().errors(&data).is_empty());
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let data = json!({"profile": {"age": "thirty"}, "tags": "x"});
        let issues = user_schema().errors(&data);

        assert_eq!(issues.len(), 3);
        assert_eq!(issues[0].path, "email");
        assert_eq!(issues[0].message, "Required property");
        assert_eq!(issues[1].path, "profile.age");
        assert_eq!(issues[1].message, "Expected integer");
        assert_eq!(issues[2].path, "tags");
    }

    #[test]
    fn test_non_object_rejected() {
        let issues = user_schema().errors(&json!("text"));
        assert_eq!(issues[0].message, "Expected object");
    }

    #[test]
    fn test_array_index_paths() {
        let schema = ObjectSchema::new().required("items.0.sku", JsonType::String);
        assert!(schema.check(&json!({"items": [{"sku": "A-1"}]})));
        assert!(!schema.check(&json!({"items": []})));
    }

    #[test]
    fn test_topic_schema_reports_first_issue_with_part() {
        let schema = TopicSchema::body(user_schema())
            .with_headers(ObjectSchema::new().required("session", JsonType::String));

        let err = schema
            .validate(&json!({"profile": {"age": 1}}), &json!({}))
            .unwrap_err();
        match err {
            TxLogError::Validation { path, message } => {
                assert_eq!(path, "body.email");
                assert_eq!(message, "Required property");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = schema
            .validate(&json!({"email": "a@b.io", "profile": {"age": 1}}), &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("headers.session"));

        assert!(schema
            .validate(
                &json!({"email": "a@b.io", "profile": {"age": 1}}),
                &json!({"session": "s"})
            )
            .is_ok());
    }
}
