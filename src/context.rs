//! Per-request context: one shape arena wired with the payload shape and
//! the `$query`/`$path`/`$header`/`$cookie`/`$params`/`$request`/`$response`
//! extras every branch can reach.

use crate::descriptor::Trunk;
use crate::error::ShapeError;
use crate::schema::ValidationError;
use crate::shape::{Extras, ShapeId, ShapeTree};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Raw request pieces, before validation.
#[derive(Clone, Debug, Default)]
pub struct RequestInput {
    pub payload: Option<Value>,
    pub query: Map<String, Value>,
    pub path_values: Map<String, Value>,
    pub header: Option<Value>,
    pub cookie: Option<Value>,
    pub request_id: Option<String>,
}

pub struct Context {
    pub tree: ShapeTree,
    /// The payload shape; execution starts here.
    pub root: ShapeId,
    response_header: ShapeId,
    response_cookie: ShapeId,
}

impl Context {
    /// Build the shape graph for one request against a trunk's models.
    /// Query and path values go through schema casting; a value that cannot
    /// be cast fails the request here.
    pub fn new(trunk: &Trunk, input: RequestInput) -> Result<Context, ShapeError> {
        let model = &trunk.model;
        let mut tree = ShapeTree::new();

        let query = tree.add(Some(model.query.clone()), None, None, true)?;
        for (k, v) in input.query {
            tree.set(query, &k.to_lowercase(), v)?;
        }

        let path = tree.add(Some(model.path.clone()), None, None, true)?;
        for (k, v) in input.path_values {
            tree.set(path, &k.to_lowercase(), v)?;
        }

        let header = tree.add(Some(model.header.clone()), input.header, None, true)?;
        let cookie = tree.add(Some(model.cookie.clone()), input.cookie, None, true)?;

        let request_extras: Extras = Arc::new(BTreeMap::from([
            ("$query".to_string(), query),
            ("$path".to_string(), path),
            ("$header".to_string(), header),
            ("$cookie".to_string(), cookie),
        ]));
        let request = tree.add(None, None, Some(request_extras), false)?;
        if let Some(id) = input.request_id {
            tree.set(request, "id", Value::String(id))?;
        }

        let response_header = tree.add(None, None, None, false)?;
        let response_cookie = tree.add(None, None, None, false)?;
        let response_extras: Extras = Arc::new(BTreeMap::from([
            ("$header".to_string(), response_header),
            ("$cookie".to_string(), response_cookie),
        ]));
        let response = tree.add(None, None, Some(response_extras), false)?;

        let params = tree.add(
            None,
            Some(json!({"path": trunk.branch.path})),
            None,
            false,
        )?;

        let extras: Extras = Arc::new(BTreeMap::from([
            ("$params".to_string(), params),
            ("$query".to_string(), query),
            ("$path".to_string(), path),
            ("$header".to_string(), header),
            ("$cookie".to_string(), cookie),
            ("$request".to_string(), request),
            ("$response".to_string(), response),
        ]));
        let root = tree.add(
            Some(model.payload.clone()),
            input.payload,
            Some(extras),
            true,
        )?;

        Ok(Context {
            tree,
            root,
            response_header,
            response_cookie,
        })
    }

    /// Request-side validation: the four parameter shapes, then the payload.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Some(crate::shape::Prop::Shape(request)) = self.tree.get(self.root, "$request") {
            errors.extend(self.tree.validate(request, true));
        }
        errors.extend(self.tree.validate(self.root, false));
        errors
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.tree.get_value(self.root, "$response.status_code")? {
            Value::Number(n) => n.as_u64().map(|n| n as u16),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn set_status_code(&mut self, code: u16) -> Result<(), ShapeError> {
        self.tree
            .set(self.root, "$response.status_code", Value::from(code))
    }

    /// Response headers accumulated by `header` control rows, as
    /// name/value pairs.
    pub fn response_headers(&self) -> Vec<(String, String)> {
        Self::name_values(self.tree.data(self.response_header))
    }

    /// Response cookies accumulated by `cookie` control rows. The full
    /// control row travels along so expiry and path attributes survive.
    pub fn response_cookies(&self) -> Vec<(String, Value)> {
        match self.tree.data(self.response_cookie) {
            Value::Object(obj) => obj
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn name_values(data: &Value) -> Vec<(String, String)> {
        let Some(obj) = data.as_object() else {
            return Vec::new();
        };
        obj.values()
            .filter_map(|row| {
                let name = row.get("name")?.as_str()?;
                let value = row.get("value")?;
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((name.to_string(), value))
            })
            .collect()
    }
}
