//! Schema-bound request data. All shapes for one request live in a single
//! arena (`ShapeTree`); nodes refer to each other by `ShapeId`, which keeps
//! parent links and shared extras ($query, $path, …) plain indices instead
//! of reference cycles.

use crate::error::ShapeError;
use crate::schema::{Schema, ValidationError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ShapeId = usize;

/// Named shapes reachable from any node of a tree, e.g. `$query` or
/// `$params`. Shared by reference so every node sees the same instances.
pub type Extras = Arc<BTreeMap<String, ShapeId>>;

/// Result of a property lookup: either a scalar value or another node.
#[derive(Clone, Debug)]
pub enum Prop {
    Value(Value),
    Shape(ShapeId),
}

struct ShapeNode {
    schema: Option<Arc<Schema>>,
    array: bool,
    /// Top-level keys lowercased for object nodes.
    data: Value,
    /// Data with caller's original casing, returned by `data()` and `$json`.
    o_data: Value,
    parent: Option<ShapeId>,
    index: usize,
    children: Vec<(String, ShapeId)>,
    items: Vec<ShapeId>,
    extras: Option<Extras>,
    /// Only root nodes carry a validator.
    validate: bool,
}

#[derive(Default)]
pub struct ShapeTree {
    nodes: Vec<ShapeNode>,
}

fn lower_keys(data: &Value) -> Value {
    match data.as_object() {
        Some(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(k.to_lowercase(), v.clone());
            }
            Value::Object(out)
        }
        None => data.clone(),
    }
}

impl ShapeTree {
    pub fn new() -> ShapeTree {
        ShapeTree::default()
    }

    /// Add a root node, materializing child nodes for every array- or
    /// object-typed property eagerly.
    pub fn add(
        &mut self,
        schema: Option<Arc<Schema>>,
        data: Option<Value>,
        extras: Option<Extras>,
        validate: bool,
    ) -> Result<ShapeId, ShapeError> {
        self.insert(schema, data, None, 0, extras, validate, false)
    }

    fn insert(
        &mut self,
        schema: Option<Arc<Schema>>,
        data: Option<Value>,
        parent: Option<ShapeId>,
        index: usize,
        extras: Option<Extras>,
        validate: bool,
        item: bool,
    ) -> Result<ShapeId, ShapeError> {
        if let Some(obj) = data.as_ref().and_then(Value::as_object) {
            for key in ["$parent", "$length", "$json", "$index"] {
                if obj.contains_key(key) {
                    return Err(ShapeError::ReservedKey(key.to_string()));
                }
            }
        }

        // Items of an array share the array's schema but are object nodes.
        let array = !item && schema.as_ref().map(|s| s.is_array()).unwrap_or(false);
        let typed_object = schema
            .as_ref()
            .map(|s| s.ty.is_some() && !array)
            .unwrap_or(false);

        let o_data = data.unwrap_or_else(|| Value::Object(Map::new()));
        let data = if array {
            if !(o_data.is_array() || o_data.is_null()) && o_data != Value::Object(Map::new()) {
                return Err(ShapeError::ExpectedArray);
            }
            o_data.clone()
        } else if typed_object {
            if !(o_data.is_object() || o_data.is_null()) {
                return Err(ShapeError::ExpectedObject);
            }
            lower_keys(&o_data)
        } else {
            lower_keys(&o_data)
        };

        let id = self.nodes.len();
        self.nodes.push(ShapeNode {
            schema: schema.clone(),
            array,
            data,
            o_data,
            parent,
            index,
            children: Vec::new(),
            items: Vec::new(),
            extras: extras.clone(),
            validate,
        });

        if array {
            let items: Vec<Value> = self.nodes[id]
                .data
                .as_array()
                .cloned()
                .unwrap_or_default();
            for (idx, value) in items.into_iter().enumerate() {
                let child = self.insert(
                    schema.clone(),
                    Some(value),
                    Some(id),
                    idx,
                    extras.clone(),
                    false,
                    true,
                )?;
                self.nodes[id].items.push(child);
            }
        } else if let Some(schema) = &schema {
            for (name, prop) in schema.properties.clone() {
                if prop.ty != Some(crate::schema::SchemaType::Array)
                    && prop.ty != Some(crate::schema::SchemaType::Object)
                {
                    continue;
                }
                let value = self.nodes[id]
                    .data
                    .as_object()
                    .and_then(|o| o.get(&name))
                    .cloned();
                let child =
                    self.insert(Some(prop), value, Some(id), 0, extras.clone(), false, false)?;
                self.nodes[id].children.push((name, child));
            }
        }

        Ok(id)
    }

    pub fn is_array(&self, id: ShapeId) -> bool {
        self.nodes[id].array
    }

    pub fn index(&self, id: ShapeId) -> usize {
        self.nodes[id].index
    }

    /// Data as given by the caller, original key casing preserved.
    pub fn data(&self, id: ShapeId) -> &Value {
        &self.nodes[id].o_data
    }

    fn length(&self, id: ShapeId) -> usize {
        match &self.nodes[id].data {
            Value::Array(xs) => xs.len(),
            Value::Object(o) => o.len(),
            _ => 0,
        }
    }

    fn item(&self, id: ShapeId, prop: &str) -> Option<ShapeId> {
        let idx: usize = prop.strip_prefix('$')?.parse().ok()?;
        self.nodes[id].items.get(idx).copied()
    }

    fn child(&self, id: ShapeId, name: &str) -> Option<ShapeId> {
        self.nodes[id]
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| *c)
    }

    /// Resolve a possibly dotted property path. Lookup order at the leaf is
    /// specials, extras, child shape, raw data, schema default.
    pub fn get(&self, id: ShapeId, prop: &str) -> Option<Prop> {
        let node = &self.nodes[id];
        if let Some(dot) = prop.find('.') {
            let (path, rest) = (&prop[..dot], &prop[dot + 1..]);
            if path.starts_with('$') {
                if path == "$parent" {
                    return self.get(node.parent?, rest);
                }
                if let Some(extra) = node.extras.as_ref().and_then(|e| e.get(path)) {
                    return self.get(*extra, rest);
                }
            }
            if node.array {
                return self.get(self.item(id, path)?, rest);
            }
            return self.get(self.child(id, path)?, rest);
        }

        if prop.starts_with('$') {
            match prop {
                "$json" => {
                    return serde_json::to_string(&node.o_data)
                        .ok()
                        .map(|s| Prop::Value(Value::String(s)))
                }
                "$parent" => return node.parent.map(Prop::Shape),
                "$length" => return Some(Prop::Value(Value::from(self.length(id)))),
                "$index" => return Some(Prop::Value(Value::from(node.index))),
                _ => {}
            }
            if let Some(extra) = node.extras.as_ref().and_then(|e| e.get(prop)) {
                return Some(Prop::Shape(*extra));
            }
        }

        if node.array {
            return self.item(id, prop).map(Prop::Shape);
        }
        if let Some(child) = self.child(id, prop) {
            return Some(Prop::Shape(child));
        }
        if let Some(v) = node.data.as_object().and_then(|o| o.get(prop)) {
            return Some(Prop::Value(v.clone()));
        }
        node.schema
            .as_ref()
            .and_then(|s| s.property(prop))
            .and_then(|p| p.default.clone())
            .map(Prop::Value)
    }

    /// Scalar lookup for parameter binding; a node result is treated as
    /// absent.
    pub fn get_value(&self, id: ShapeId, prop: &str) -> Option<Value> {
        match self.get(id, prop)? {
            Prop::Value(v) => Some(v),
            Prop::Shape(_) => None,
        }
    }

    /// Set a property, casting toward the schema's declared type. Dotted
    /// paths route through child shapes and extras.
    pub fn set(&mut self, id: ShapeId, prop: &str, value: Value) -> Result<(), ShapeError> {
        if let Some(dot) = prop.find('.') {
            let (path, rest) = (prop[..dot].to_string(), &prop[dot + 1..]);
            if self.nodes[id].array {
                if let Some(item) = self.item(id, &path) {
                    return self.set(item, rest, value);
                }
                return Ok(());
            }
            if let Some(child) = self.child(id, &path) {
                return self.set(child, rest, value);
            }
            let extra = self.nodes[id]
                .extras
                .as_ref()
                .and_then(|e| e.get(&path).copied());
            if let Some(extra) = extra {
                return self.set(extra, rest, value);
            }
            return Ok(());
        }

        let value = match &self.nodes[id].schema {
            Some(schema) => schema.coerce(prop, value)?,
            None => value,
        };
        let node = &mut self.nodes[id];
        if let Value::Object(o) = &mut node.data {
            o.insert(prop.to_lowercase(), value.clone());
        }
        if !node.o_data.is_object() {
            node.o_data = Value::Object(Map::new());
        }
        if let Value::Object(o) = &mut node.o_data {
            o.insert(prop.to_string(), value);
        }
        Ok(())
    }

    /// Collect validation errors for a node, walking its extras first when
    /// `include_extras` is set.
    pub fn validate(&self, id: ShapeId, include_extras: bool) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let node = &self.nodes[id];
        if include_extras {
            if let Some(extras) = &node.extras {
                for extra in extras.values() {
                    errors.extend(self.validate(*extra, include_extras));
                }
            }
        }
        if node.validate {
            if let Some(schema) = &node.schema {
                schema.validate(&node.data, &mut errors);
            }
        }
        errors
    }
}
