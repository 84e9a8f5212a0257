//! Input-model schemas. Models follow a JSON-Schema-like shape with
//! `type`, `properties`, `required`, `default` and the constraint subset
//! (`minLength`, `maxLength`, `pattern`, `enum`, `minimum`, `maximum`,
//! `format`), parsed from the branch's `$.input.yaml`/`$.input.json` files.

use crate::error::ShapeError;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
}

impl SchemaType {
    fn parse(s: &str) -> Option<SchemaType> {
        match s {
            "object" => Some(SchemaType::Object),
            "array" => Some(SchemaType::Array),
            "string" => Some(SchemaType::String),
            "integer" => Some(SchemaType::Integer),
            "number" => Some(SchemaType::Number),
            "boolean" => Some(SchemaType::Boolean),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Integer => "integer",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
        }
    }
}

/// Declared `format` constraint. Only the formats the models actually use
/// are checked; unknown format names are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaFormat {
    Email,
    Uuid,
}

impl SchemaFormat {
    fn parse(s: &str) -> Option<SchemaFormat> {
        match s {
            "email" => Some(SchemaFormat::Email),
            "uuid" => Some(SchemaFormat::Uuid),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SchemaFormat::Email => "email",
            SchemaFormat::Uuid => "uuid",
        }
    }

    fn check(self, s: &str) -> bool {
        match self {
            SchemaFormat::Email => email_re().is_match(s),
            SchemaFormat::Uuid => uuid::Uuid::parse_str(s).is_ok(),
        }
    }
}

/// One validation failure, reported the way clients see it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ValidationError {
    pub path: Option<String>,
    pub message: String,
}

/// Parsed model node. Property names are lowercased; declaration order is
/// preserved because it drives child branch ordering.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub ty: Option<SchemaType>,
    pub properties: Vec<(String, Arc<Schema>)>,
    pub required: Vec<String>,
    pub default: Option<Value>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
    pub enum_values: Option<Vec<Value>>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub format: Option<SchemaFormat>,
}

impl Schema {
    /// Parse a model value. Unknown keys and malformed fragments are
    /// ignored rather than rejected.
    pub fn from_value(value: &Value) -> Schema {
        let Some(obj) = value.as_object() else {
            return Schema::default();
        };
        let ty = obj
            .get("type")
            .and_then(Value::as_str)
            .and_then(SchemaType::parse);
        let mut properties = Vec::new();
        if let Some(props) = obj.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                properties.push((name.to_lowercase(), Arc::new(Schema::from_value(prop))));
            }
        }
        let required = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|xs| {
                xs.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        Schema {
            ty,
            properties,
            required,
            default: obj.get("default").cloned(),
            min_length: obj.get("minLength").and_then(Value::as_u64).map(|n| n as usize),
            max_length: obj.get("maxLength").and_then(Value::as_u64).map(|n| n as usize),
            pattern: obj
                .get("pattern")
                .and_then(Value::as_str)
                .and_then(|p| Regex::new(p).ok()),
            enum_values: obj.get("enum").and_then(Value::as_array).cloned(),
            minimum: obj.get("minimum").and_then(Value::as_f64),
            maximum: obj.get("maximum").and_then(Value::as_f64),
            format: obj
                .get("format")
                .and_then(Value::as_str)
                .and_then(SchemaFormat::parse),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Arc<Schema>> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    pub fn is_array(&self) -> bool {
        self.ty == Some(SchemaType::Array)
    }

    /// Cast `value` toward this property's declared type. Scalars that
    /// cannot be represented in the declared type are an error; properties
    /// without a declared scalar type pass through unchanged.
    pub fn coerce(&self, prop: &str, value: Value) -> Result<Value, ShapeError> {
        let Some(schema) = self.property(prop) else {
            return Ok(value);
        };
        let Some(ty) = schema.ty else {
            return Ok(value);
        };
        let fail = || ShapeError::Coerce {
            prop: prop.to_string(),
            expected: ty.name(),
        };
        match ty {
            SchemaType::Integer => match &value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
                Value::Number(n) => {
                    let f = n.as_f64().ok_or_else(fail)?;
                    Ok(Value::from(f as i64))
                }
                Value::String(s) => {
                    let n: i64 = s.trim().parse().map_err(|_| fail())?;
                    Ok(Value::from(n))
                }
                _ => Err(fail()),
            },
            SchemaType::Number => match &value {
                Value::Number(_) => Ok(value),
                Value::String(s) => {
                    let f: f64 = s.trim().parse().map_err(|_| fail())?;
                    Ok(Value::from(f))
                }
                _ => Err(fail()),
            },
            SchemaType::String => match value {
                Value::String(_) => Ok(value),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(fail()),
            },
            SchemaType::Boolean => match value {
                Value::Bool(_) => Ok(value),
                _ => Err(fail()),
            },
            SchemaType::Object | SchemaType::Array => Ok(value),
        }
    }

    /// Validate `data` against this schema, appending failures to `errors`.
    /// Scalar checks are lenient: strings that parse as the declared
    /// numeric type are accepted, and null passes unless the property is
    /// required.
    pub fn validate(&self, data: &Value, errors: &mut Vec<ValidationError>) {
        for name in &self.required {
            let missing = match data.as_object() {
                Some(obj) => !obj.contains_key(name) || obj[name].is_null(),
                None => true,
            };
            if missing {
                errors.push(ValidationError {
                    path: Some(name.clone()),
                    message: format!("'{name}' is a required property"),
                });
            }
        }
        let Some(obj) = data.as_object() else {
            return;
        };
        for (name, schema) in &self.properties {
            let Some(value) = obj.get(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if let Some(ty) = schema.ty {
                let ok = match ty {
                    SchemaType::Object => value.is_object(),
                    SchemaType::Array => value.is_array(),
                    SchemaType::String => value.is_string(),
                    SchemaType::Boolean => value.is_boolean(),
                    SchemaType::Integer => match value {
                        Value::Number(n) => n.is_i64() || n.is_u64(),
                        Value::String(s) => s.trim().parse::<i64>().is_ok(),
                        _ => false,
                    },
                    SchemaType::Number => match value {
                        Value::Number(_) => true,
                        Value::String(s) => s.trim().parse::<f64>().is_ok(),
                        _ => false,
                    },
                };
                if !ok {
                    errors.push(ValidationError {
                        path: Some(name.clone()),
                        message: format!("'{name}' is not of type '{}'", ty.name()),
                    });
                    continue;
                }
            }
            schema.check_constraints(name, value, errors);
        }
    }

    /// String, numeric, enum and format constraints, applied after the type
    /// check. Numeric bounds accept numeric strings the same way the type
    /// check does.
    fn check_constraints(&self, name: &str, value: &Value, errors: &mut Vec<ValidationError>) {
        let mut fail = |message: String| {
            errors.push(ValidationError {
                path: Some(name.to_string()),
                message,
            });
        };
        if let Some(s) = value.as_str() {
            let len = s.chars().count();
            if let Some(min) = self.min_length {
                if len < min {
                    fail(format!("'{name}' is shorter than {min} characters"));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    fail(format!("'{name}' is longer than {max} characters"));
                }
            }
            if let Some(re) = &self.pattern {
                if !re.is_match(s) {
                    fail(format!("'{name}' does not match '{}'", re.as_str()));
                }
            }
            if let Some(format) = self.format {
                if !format.check(s) {
                    fail(format!("'{name}' is not a valid {}", format.name()));
                }
            }
        }
        let numeric = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        if let Some(n) = numeric {
            if let Some(min) = self.minimum {
                if n < min {
                    fail(format!("'{name}' is less than the minimum of {min}"));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    fail(format!("'{name}' is greater than the maximum of {max}"));
                }
            }
        }
        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(value) {
                fail(format!("'{name}' is not one of the allowed values"));
            }
        }
    }
}
