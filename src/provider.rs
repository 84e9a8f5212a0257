//! Database access seam. The engine talks to connections through
//! [`DataProvider`]; concrete drivers live under `providers/`.

use crate::error::ExecutionError;
use crate::shape::{Prop, ShapeId, ShapeTree};
use crate::template::{ParamDecl, Placeholder};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Driver-neutral bind value.
#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl BindValue {
    /// Lossless mapping from a JSON value, containers becoming JSON binds.
    pub fn from_json(value: Value) -> BindValue {
        match value {
            Value::Null => BindValue::Null,
            Value::Bool(b) => BindValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    BindValue::Int(i)
                } else {
                    BindValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => BindValue::Text(s),
            v @ (Value::Array(_) | Value::Object(_)) => BindValue::Json(v),
        }
    }
}

/// Rows plus the driver's last-inserted row id, if it has one.
#[derive(Clone, Debug, Default)]
pub struct QueryOutput {
    pub rows: Vec<Value>,
    pub last_inserted_id: Value,
}

/// One connection for the duration of a request. `begin` is called once by
/// the trunk; `commit`/`rollback` close the transaction out.
#[async_trait]
pub trait DataProvider: Send {
    fn placeholder(&self) -> Placeholder;

    /// Driver-specific coercion for declared parameter types outside the
    /// neutral set (`blob` and vendor casts). Default is a passthrough.
    fn value_converter(&self, ty: &str, value: BindValue) -> BindValue {
        let _ = ty;
        value
    }

    async fn begin(&mut self) -> Result<(), ExecutionError>;

    async fn execute(
        &mut self,
        sql: &str,
        params: Vec<BindValue>,
    ) -> Result<QueryOutput, ExecutionError>;

    async fn commit(&mut self) -> Result<(), ExecutionError>;

    async fn rollback(&mut self) -> Result<(), ExecutionError>;
}

/// Hands out request-scoped providers by connection name.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn provider(&self, name: &str) -> Result<Box<dyn DataProvider>, ExecutionError>;
}

/// Resolves twig parameters against a shape, caching lookups for the run of
/// one twig. `$params.*` and `$parent.*` values change between twigs and
/// items, so they are never cached.
#[derive(Default)]
pub struct ParamBinder {
    cache: HashMap<String, Option<Prop>>,
}

impl ParamBinder {
    pub fn new() -> ParamBinder {
        ParamBinder::default()
    }

    fn lookup(&mut self, tree: &ShapeTree, ctx: ShapeId, name: &str) -> Option<Prop> {
        if let Some(hit) = self.cache.get(name) {
            return hit.clone();
        }
        let prop = tree.get(ctx, name);
        if !(name.contains("$params") || name.contains("$parent")) {
            self.cache.insert(name.to_string(), prop.clone());
        }
        prop
    }

    /// Whether a parameter resolves to null, for null-guard collapsing.
    pub fn is_null(&mut self, tree: &ShapeTree, ctx: ShapeId, name: &str) -> bool {
        match self.lookup(tree, ctx, name) {
            None | Some(Prop::Value(Value::Null)) => true,
            Some(_) => false,
        }
    }

    /// Bind values for one compiled twig, in placeholder order.
    pub fn bind(
        &mut self,
        tree: &ShapeTree,
        ctx: ShapeId,
        params: &[ParamDecl],
    ) -> Vec<BindValue> {
        params
            .iter()
            .map(|p| convert(&p.ty, self.lookup(tree, ctx, &p.name), tree))
            .collect()
    }
}

/// Convert a resolved property toward its declared type. Values that do
/// not fit are bound as-is rather than rejected, matching the lenient cast
/// on input shapes.
fn convert(ty: &str, prop: Option<Prop>, tree: &ShapeTree) -> BindValue {
    let value = match prop {
        None => return BindValue::Null,
        Some(Prop::Shape(id)) => {
            if ty == "json" {
                return BindValue::Json(tree.data(id).clone());
            }
            return BindValue::Null;
        }
        Some(Prop::Value(v)) => v,
    };
    if value.is_null() {
        return BindValue::Null;
    }
    match ty {
        "integer" => match &value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => BindValue::Int(i),
                None => BindValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => BindValue::Int(i),
                Err(_) => BindValue::from_json(value),
            },
            Value::Bool(b) => BindValue::Int(*b as i64),
            _ => BindValue::from_json(value),
        },
        "string" => match value {
            Value::String(s) => BindValue::Text(s),
            Value::Number(n) => BindValue::Text(n.to_string()),
            Value::Bool(b) => BindValue::Text(b.to_string()),
            other => BindValue::from_json(other),
        },
        "json" => BindValue::Json(value),
        _ => BindValue::from_json(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ParamDecl;
    use serde_json::json;

    fn decl(name: &str, ty: &str) -> ParamDecl {
        ParamDecl {
            name: name.to_string(),
            ty: ty.to_string(),
        }
    }

    #[test]
    fn test_bind_converts_toward_declared_types() {
        let mut tree = ShapeTree::new();
        let ctx = tree
            .add(
                None,
                Some(json!({"id": "7", "name": 42, "flag": true})),
                None,
                false,
            )
            .unwrap();
        let mut binder = ParamBinder::new();
        let values = binder.bind(
            &tree,
            ctx,
            &[decl("id", "integer"), decl("name", "string"), decl("flag", "")],
        );
        assert_eq!(
            values,
            vec![
                BindValue::Int(7),
                BindValue::Text("42".to_string()),
                BindValue::Bool(true)
            ]
        );
    }

    #[test]
    fn test_missing_parameter_binds_null() {
        let mut tree = ShapeTree::new();
        let ctx = tree.add(None, None, None, false).unwrap();
        let mut binder = ParamBinder::new();
        assert_eq!(
            binder.bind(&tree, ctx, &[decl("absent", "integer")]),
            vec![BindValue::Null]
        );
        assert!(binder.is_null(&tree, ctx, "absent"));
    }

    #[test]
    fn test_json_type_serializes_child_shapes() {
        let mut tree = ShapeTree::new();
        let schema = std::sync::Arc::new(crate::schema::Schema::from_value(&json!({
            "type": "object",
            "properties": {"meta": {"type": "object"}}
        })));
        let ctx = tree
            .add(Some(schema), Some(json!({"meta": {"a": 1}})), None, false)
            .unwrap();
        let mut binder = ParamBinder::new();
        let values = binder.bind(&tree, ctx, &[decl("meta", "json")]);
        assert_eq!(values, vec![BindValue::Json(json!({"a": 1}))]);
    }

    #[test]
    fn test_params_values_are_not_cached() {
        let mut tree = ShapeTree::new();
        let params = tree.add(None, None, None, false).unwrap();
        let extras: crate::shape::Extras = std::sync::Arc::new(
            std::collections::BTreeMap::from([("$params".to_string(), params)]),
        );
        let ctx = tree.add(None, None, Some(extras), false).unwrap();
        let mut binder = ParamBinder::new();

        tree.set(ctx, "$params.$last_inserted_id", json!(1)).unwrap();
        assert_eq!(
            binder.bind(&tree, ctx, &[decl("$params.$last_inserted_id", "integer")]),
            vec![BindValue::Int(1)]
        );
        tree.set(ctx, "$params.$last_inserted_id", json!(2)).unwrap();
        assert_eq!(
            binder.bind(&tree, ctx, &[decl("$params.$last_inserted_id", "integer")]),
            vec![BindValue::Int(2)]
        );
    }
}
