//! Tree-walking executor. Runs a descriptor's twigs against their
//! connections inside one transaction per connection, folds control rows
//! into the request context, joins child branch rows onto parent rows, and
//! maps the final tree through the output model.

use crate::cache::ResultCache;
use crate::context::Context;
use crate::descriptor::{Branch, Trunk};
use crate::error::ExecutionError;
use crate::mapper::map_branch;
use crate::provider::{BindValue, DataProvider, ParamBinder, ProviderFactory};
use crate::shape::{Prop, ShapeId};
use crate::template::compile;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Rows produced by a branch, or error rows that abort the request.
#[derive(Debug)]
enum Outcome {
    Rows(Vec<Value>),
    Errors(Vec<Value>),
}

/// Open providers for one request, in connection declaration order so that
/// `db` commits first.
#[derive(Default)]
struct Providers(Vec<(String, Box<dyn DataProvider>)>);

impl Providers {
    fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn DataProvider>> {
        self.0
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }
}

/// Execute a request against a built descriptor. The returned value is the
/// response body; validation failures and `error` control rows come back as
/// `{"errors": [...]}` with the status code recorded on the context.
pub async fn get_result(
    trunk: &Trunk,
    factory: &dyn ProviderFactory,
    ctx: &mut Context,
    results: &ResultCache,
) -> Result<Value, ExecutionError> {
    let validation = ctx.validate();
    if !validation.is_empty() {
        ctx.set_status_code(400)?;
        return Ok(json!({ "errors": validation }));
    }

    let mut providers = Providers::default();
    for name in &trunk.connections {
        providers.0.push((name.clone(), factory.provider(name).await?));
    }
    for (_, provider) in &mut providers.0 {
        provider.begin().await?;
    }

    let root = ctx.root;
    let outcome = execute_branch(&trunk.branch, &mut providers, ctx, Some(root), &[], results).await;

    match outcome {
        Ok(Outcome::Rows(rows)) => {
            commit_all(&mut providers).await?;
            let mapped = map_branch(&trunk.branch, rows)?;
            ctx.set_status_code(200)?;
            Ok(mapped)
        }
        Ok(Outcome::Errors(errors)) => {
            rollback_all(&mut providers).await;
            if ctx.status_code().is_none() {
                ctx.set_status_code(400)?;
            }
            Ok(json!({ "errors": errors }))
        }
        Err(e) => {
            rollback_all(&mut providers).await;
            Err(e)
        }
    }
}

/// Commit every connection. All are attempted; the first failure is
/// surfaced once the rest have had their chance.
async fn commit_all(providers: &mut Providers) -> Result<(), ExecutionError> {
    let mut first_err = None;
    for (name, provider) in &mut providers.0 {
        if let Err(e) = provider.commit().await {
            tracing::error!(connection = %name, error = %e, "commit failed");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn rollback_all(providers: &mut Providers) {
    for (name, provider) in &mut providers.0 {
        if let Err(e) = provider.rollback().await {
            tracing::error!(connection = %name, error = %e, "rollback failed");
        }
    }
}

fn execute_branch<'a>(
    branch: &'a Branch,
    providers: &'a mut Providers,
    ctx: &'a mut Context,
    shape: Option<ShapeId>,
    parent_rows: &'a [Value],
    results: &'a ResultCache,
) -> Pin<Box<dyn Future<Output = Result<Outcome, ExecutionError>> + Send + 'a>> {
    Box::pin(async move {
        let mut rows: Vec<Value> = Vec::new();

        let cached = branch
            .cache
            .then(|| results.get(&branch.path, &branch.method))
            .flatten();
        if let Some(hit) = cached {
            rows = hit;
        } else {
            if branch.input_array {
                if let Some(shape) = shape {
                    let length = match ctx.tree.get_value(shape, "$length") {
                        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
                        _ => 0,
                    };
                    for i in 0..length {
                        let item = match ctx.tree.get(shape, &format!("${i}")) {
                            Some(Prop::Shape(id)) => id,
                            _ => continue,
                        };
                        match execute_twigs(branch, providers, ctx, item).await? {
                            Outcome::Rows(rs) => rows.extend(rs),
                            errors @ Outcome::Errors(_) => return Ok(errors),
                        }
                    }
                }
            } else if let Some(shape) = shape {
                match execute_twigs(branch, providers, ctx, shape).await? {
                    Outcome::Rows(rs) => rows = rs,
                    errors @ Outcome::Errors(_) => return Ok(errors),
                }
            }

            if branch.cache {
                results.put(&branch.path, &branch.method, rows.clone());
            }

            if branch.use_parent_rows {
                rows = parent_rows.to_vec();
            }
        }

        for child in &branch.branches {
            let child_shape = shape.and_then(|s| match ctx.tree.get(s, &child.key) {
                Some(Prop::Shape(id)) => Some(id),
                _ => None,
            });

            let child_rows =
                match execute_branch(child, providers, ctx, child_shape, &rows, results).await? {
                    Outcome::Rows(rs) => rs,
                    errors @ Outcome::Errors(_) => return Ok(errors),
                };

            // A branch with no statements of its own still carries its
            // children on a synthesized empty row.
            if branch.twigs.is_empty() && rows.is_empty() {
                rows.push(Value::Object(Map::new()));
            }

            match &branch.partition_by {
                None => {
                    for row in &mut rows {
                        if let Some(obj) = row.as_object_mut() {
                            obj.insert(child.name.clone(), Value::Array(child_rows.clone()));
                        }
                    }
                }
                Some(key) => {
                    rows = partition_join(rows, child_rows, key, &child.name)?;
                }
            }
        }

        Ok(Outcome::Rows(rows))
    })
}

async fn execute_twigs(
    branch: &Branch,
    providers: &mut Providers,
    ctx: &mut Context,
    shape: ShapeId,
) -> Result<Outcome, ExecutionError> {
    let mut rs: Vec<Value> = Vec::new();
    let mut binder = ParamBinder::new();

    for twig in &branch.twigs {
        let provider = providers
            .get_mut(&twig.connection)
            .ok_or_else(|| ExecutionError::UnknownConnection(twig.connection.clone()))?;

        let compiled = compile(twig, provider.placeholder(), |name| {
            binder.is_null(&ctx.tree, shape, name)
        });
        let mut values = binder.bind(&ctx.tree, shape, &compiled.parameters);
        for (decl, value) in compiled.parameters.iter().zip(values.iter_mut()) {
            if !matches!(decl.ty.as_str(), "" | "integer" | "string" | "json") {
                let taken = std::mem::replace(value, BindValue::Null);
                *value = provider.value_converter(&decl.ty, taken);
            }
        }
        let output = provider.execute(&compiled.sql, values).await?;

        ctx.tree
            .set(shape, "$params.$last_inserted_id", output.last_inserted_id)?;

        let mut rows = output.rows;
        let Some(action) = rows.first().and_then(|r| r.get("$action")).cloned() else {
            if !rows.is_empty() {
                rs = rows;
            }
            continue;
        };

        match action.as_str() {
            Some("error") => {
                if let Some(status) = rows[0].get("$http_status_code").cloned() {
                    ctx.tree.set(shape, "$response.status_code", status)?;
                }
                return Ok(Outcome::Errors(rows));
            }
            Some("json") => {
                let mut parsed = Vec::with_capacity(rows.len());
                let as_text = rows[0].get("json").map(Value::is_string).unwrap_or(false);
                for row in &rows {
                    let cell = row.get("json").cloned().ok_or_else(|| {
                        ExecutionError::ControlJson("row has no 'json' column".to_string())
                    })?;
                    if as_text {
                        let text = cell.as_str().unwrap_or_default();
                        let value: Value = serde_json::from_str(text)
                            .map_err(|e| ExecutionError::ControlJson(e.to_string()))?;
                        parsed.push(value);
                    } else {
                        parsed.push(cell);
                    }
                }
                return Ok(Outcome::Rows(parsed));
            }
            Some("break") => {
                for row in &mut rows {
                    if let Some(obj) = row.as_object_mut() {
                        obj.remove("$action");
                    }
                }
                return Ok(Outcome::Rows(rows));
            }
            Some("params") => {
                if let Some(obj) = rows[0].as_object() {
                    for (k, v) in obj.clone() {
                        ctx.tree.set(shape, &format!("$params.{k}"), v)?;
                    }
                }
            }
            Some("cookie") => {
                set_named_rows(ctx, shape, "$response.$cookie", &rows)?;
            }
            Some("header") => {
                set_named_rows(ctx, shape, "$response.$header", &rows)?;
            }
            // Unknown actions swallow their rows.
            _ => {}
        }
    }

    Ok(Outcome::Rows(rs))
}

fn set_named_rows(
    ctx: &mut Context,
    shape: ShapeId,
    target: &str,
    rows: &[Value],
) -> Result<(), ExecutionError> {
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if let Some(name) = obj.get("name").and_then(Value::as_str) {
            if obj.contains_key("value") {
                ctx.tree
                    .set(shape, &format!("{target}.{name}"), row.clone())?;
            }
        }
    }
    Ok(())
}

fn group_key(row: &Value, key: &str) -> Result<String, ExecutionError> {
    let value = row
        .get(key)
        .ok_or_else(|| ExecutionError::PartitionKeyMissing {
            key: key.to_string(),
        })?;
    Ok(value.to_string())
}

/// Equi-join child rows onto parent rows by a shared column. Parent rows
/// collapse to one row per key in first-seen order; a key with no child
/// rows gets an empty list.
pub fn partition_join(
    parent_rows: Vec<Value>,
    child_rows: Vec<Value>,
    key: &str,
    child_name: &str,
) -> Result<Vec<Value>, ExecutionError> {
    let mut child_groups: HashMap<String, Vec<Value>> = HashMap::new();
    for row in child_rows {
        child_groups.entry(group_key(&row, key)?).or_default().push(row);
    }

    let mut seen: Vec<String> = Vec::new();
    let mut firsts: Vec<Value> = Vec::new();
    for row in parent_rows {
        let k = group_key(&row, key)?;
        if !seen.contains(&k) {
            seen.push(k);
            firsts.push(row);
        }
    }

    let mut out = Vec::with_capacity(firsts.len());
    for (k, mut row) in seen.into_iter().zip(firsts) {
        let children = child_groups.remove(&k).unwrap_or_default();
        if let Some(obj) = row.as_object_mut() {
            obj.insert(child_name.to_string(), Value::Array(children));
        }
        out.push(row);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_join_groups_by_key() {
        let parents = vec![
            json!({"id": 1, "title": "a"}),
            json!({"id": 2, "title": "b"}),
            json!({"id": 1, "title": "dup"}),
        ];
        let children = vec![
            json!({"id": 2, "note": "x"}),
            json!({"id": 1, "note": "y"}),
            json!({"id": 2, "note": "z"}),
        ];
        let out = partition_join(parents, children, "id", "notes").unwrap();
        assert_eq!(
            out,
            json!([
                {"id": 1, "title": "a", "notes": [{"id": 1, "note": "y"}]},
                {"id": 2, "title": "b", "notes": [{"id": 2, "note": "x"}, {"id": 2, "note": "z"}]}
            ])
            .as_array()
            .unwrap()
            .clone()
        );
    }

    #[test]
    fn test_partition_join_unmatched_parent_gets_empty_list() {
        let parents = vec![json!({"id": 1})];
        let out = partition_join(parents, Vec::new(), "id", "items").unwrap();
        assert_eq!(out, vec![json!({"id": 1, "items": []})]);
    }

    #[test]
    fn test_partition_join_missing_key_is_an_error() {
        let parents = vec![json!({"other": 1})];
        let err = partition_join(parents, Vec::new(), "id", "items").unwrap_err();
        assert!(matches!(err, ExecutionError::PartitionKeyMissing { .. }));
    }
}
