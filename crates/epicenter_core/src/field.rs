//! Field definitions and cell values.
//!
//! [`Field`] is the closed set of column types a table may declare and
//! [`Value`] is the closed set of scalars a cell may hold. Every write into the
//! document is validated with [`Field::validate`] before a transaction opens.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use yrs::Any;

use crate::error::{EpicenterError, Result};

/// Row keys that are not available as field identifiers.
pub const RESERVED_KEYS: [&str; 2] = ["id", "deletedAt"];

/// A cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert into the scalar stored in the document.
    pub fn to_any(&self) -> Any {
        match self {
            Value::Null => Any::Null,
            Value::Boolean(b) => Any::Bool(*b),
            Value::Number(n) => Any::Number(*n),
            Value::Text(s) => Any::String(Arc::from(s.as_str())),
        }
    }

    /// Read a scalar back from the document. Container values have no
    /// cell representation and yield `None`.
    pub fn from_any(any: &Any) -> Option<Self> {
        match any {
            Any::Null | Any::Undefined => Some(Value::Null),
            Any::Bool(b) => Some(Value::Boolean(*b)),
            Any::Number(n) => Some(Value::Number(*n)),
            Any::BigInt(i) => Some(Value::Number(*i as f64)),
            Any::String(s) => Some(Value::Text(s.to_string())),
            _ => None,
        }
    }

    /// Render as a YAML scalar for frontmatter.
    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Value::Null => serde_yaml::Value::Null,
            Value::Boolean(b) => serde_yaml::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    serde_yaml::Value::Number((*n as i64).into())
                } else {
                    serde_yaml::Value::Number((*n).into())
                }
            }
            Value::Text(s) => serde_yaml::Value::String(s.clone()),
        }
    }

    /// Render as JSON for kv.json and query results.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// The type of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldKind {
    Text,
    /// Collaborative text, stored as a Y.Text inside the row.
    LongText,
    Number,
    Boolean,
    Id,
    Date,
    Select { options: Vec<String> },
    Reference { table: String },
}

/// A field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Field {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            nullable: false,
            default: None,
        }
    }

    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    pub fn long_text() -> Self {
        Self::new(FieldKind::LongText)
    }

    pub fn number() -> Self {
        Self::new(FieldKind::Number)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn id() -> Self {
        Self::new(FieldKind::Id)
    }

    pub fn date() -> Self {
        Self::new(FieldKind::Date)
    }

    pub fn select<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(FieldKind::Select {
            options: options.into_iter().map(Into::into).collect(),
        })
    }

    pub fn reference(table: impl Into<String>) -> Self {
        Self::new(FieldKind::Reference {
            table: table.into(),
        })
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn is_long_text(&self) -> bool {
        self.kind == FieldKind::LongText
    }

    /// The value a missing cell takes: the default, then null for nullable
    /// fields. `None` means the cell is required.
    pub fn fallback(&self) -> Option<Value> {
        match &self.default {
            Some(v) => Some(v.clone()),
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }

    /// Check that `value` is acceptable for this field. `name` is only used
    /// for the error message.
    pub fn validate(&self, name: &str, value: &Value) -> Result<()> {
        let fail = |message: &str| Err(EpicenterError::validation(name, message));

        if value.is_null() {
            return if self.nullable {
                Ok(())
            } else {
                fail("field is not nullable")
            };
        }

        match (&self.kind, value) {
            (FieldKind::Text | FieldKind::LongText, Value::Text(_)) => Ok(()),
            (FieldKind::Number, Value::Number(n)) if n.is_finite() => Ok(()),
            (FieldKind::Number, Value::Number(_)) => fail("number must be finite"),
            (FieldKind::Boolean, Value::Boolean(_)) => Ok(()),
            (FieldKind::Id, Value::Text(s)) if is_identifier(s) => Ok(()),
            (FieldKind::Id, Value::Text(_)) => fail("expected a UUID or ULID"),
            (FieldKind::Date, Value::Text(s)) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|_| ())
                .map_err(|e| EpicenterError::validation(name, format!("invalid date: {}", e))),
            (FieldKind::Select { options }, Value::Text(s)) => {
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    fail(&format!("'{}' is not one of {:?}", s, options))
                }
            }
            (FieldKind::Reference { .. }, Value::Text(s)) if !s.is_empty() => Ok(()),
            (FieldKind::Reference { .. }, Value::Text(_)) => fail("reference must not be empty"),
            (kind, other) => fail(&format!("{:?} does not accept {:?}", kind, other)),
        }
    }

    /// Convert a human-edited YAML scalar into a value for this field.
    ///
    /// Text-like fields accept numbers and booleans and keep their string
    /// form. The result still goes through [`Field::validate`].
    pub fn coerce_yaml(&self, name: &str, yaml: &serde_yaml::Value) -> Result<Value> {
        let text_like = !matches!(self.kind, FieldKind::Number | FieldKind::Boolean);
        let value = match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) if text_like => Value::Text(b.to_string()),
            serde_yaml::Value::Bool(b) => Value::Boolean(*b),
            serde_yaml::Value::Number(n) if text_like => Value::Text(n.to_string()),
            serde_yaml::Value::Number(n) => Value::Number(n.as_f64().ok_or_else(|| {
                EpicenterError::validation(name, format!("number {} out of range", n))
            })?),
            serde_yaml::Value::String(s) => Value::Text(s.clone()),
            other => {
                return Err(EpicenterError::validation(
                    name,
                    format!("expected a scalar, got {:?}", other),
                ));
            }
        };
        self.validate(name, &value)?;
        Ok(value)
    }
}

/// Reject field identifiers that collide with row bookkeeping keys.
pub fn check_field_name(name: &str) -> Result<()> {
    if name.is_empty() || RESERVED_KEYS.contains(&name) {
        return Err(EpicenterError::validation(
            name,
            "field name is empty or reserved",
        ));
    }
    Ok(())
}

/// Generate a fresh row or table identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// True for UUIDs and ULIDs (26 characters of Crockford base32).
pub fn is_identifier(s: &str) -> bool {
    if uuid::Uuid::parse_str(s).is_ok() {
        return true;
    }
    s.len() == 26
        && s.bytes().all(|b| {
            b.is_ascii_digit() || (b.is_ascii_uppercase() && !matches!(b, b'I' | b'L' | b'O' | b'U'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_json_shape() {
        let field = Field::select(["draft", "published"]).with_default(Value::text("draft"));
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "select");
        assert_eq!(json["options"][1], "published");
        assert_eq!(json["nullable"], false);
        assert_eq!(json["default"], "draft");

        let back: Field = serde_json::from_value(json).unwrap();
        assert_eq!(back, field);
    }

    #[test]
    fn test_field_json_defaults_nullable() {
        let field: Field = serde_json::from_str(r#"{"type":"reference","table":"authors"}"#).unwrap();
        assert_eq!(field.kind, FieldKind::Reference { table: "authors".into() });
        assert!(!field.nullable);
        assert!(field.default.is_none());
    }

    #[test]
    fn test_validate_null_requires_nullable() {
        assert!(Field::text().validate("title", &Value::Null).is_err());
        assert!(Field::text().nullable().validate("title", &Value::Null).is_ok());
    }

    #[test]
    fn test_validate_kinds() {
        assert!(Field::number().validate("n", &Value::Number(1.5)).is_ok());
        assert!(Field::number().validate("n", &Value::Number(f64::NAN)).is_err());
        assert!(Field::number().validate("n", &Value::text("1")).is_err());
        assert!(Field::boolean().validate("b", &Value::Boolean(true)).is_ok());
        assert!(Field::date().validate("d", &Value::text("2024-05-01T10:00:00Z")).is_ok());
        assert!(Field::date().validate("d", &Value::text("yesterday")).is_err());
        assert!(Field::select(["a"]).validate("s", &Value::text("b")).is_err());
        assert!(Field::reference("t").validate("r", &Value::text("")).is_err());
    }

    #[test]
    fn test_validate_id_accepts_uuid_and_ulid() {
        let field = Field::id();
        assert!(field.validate("id", &Value::text(new_id())).is_ok());
        assert!(field.validate("id", &Value::text("01ARZ3NDEKTSV4RRFFQ69G5FAV")).is_ok());
        assert!(field.validate("id", &Value::text("post-1")).is_err());
    }

    #[test]
    fn test_coerce_yaml_is_lenient_for_text() {
        let yaml = serde_yaml::Value::Number(2024.into());
        assert_eq!(Field::text().coerce_yaml("year", &yaml).unwrap(), Value::text("2024"));
        assert_eq!(Field::number().coerce_yaml("year", &yaml).unwrap(), Value::Number(2024.0));
        assert!(Field::boolean().coerce_yaml("flag", &serde_yaml::Value::String("yes".into())).is_err());
    }

    #[test]
    fn test_any_conversion() {
        for value in [Value::Null, Value::Boolean(false), Value::Number(3.25), Value::text("x")] {
            assert_eq!(Value::from_any(&value.to_any()), Some(value));
        }
    }

    #[test]
    fn test_reserved_field_names() {
        assert!(check_field_name("id").is_err());
        assert!(check_field_name("deletedAt").is_err());
        assert!(check_field_name("title").is_ok());
    }
}
