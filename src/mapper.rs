//! Shapes raw result rows into the response the output model describes:
//! column renames, child-branch nesting and array-versus-object collapse.

use crate::descriptor::{Branch, OutputKind, OutputProp};
use crate::error::ExecutionError;
use serde_json::{Map, Value};

/// Map a branch's rows into its output form. Rows keep their raw columns
/// when the output model maps none of them.
pub fn map_output(
    kind: OutputKind,
    props: &[OutputProp],
    branches: &[Branch],
    rows: Vec<Value>,
) -> Result<Value, ExecutionError> {
    let mut mapped_rows = Vec::with_capacity(rows.len());

    for row in rows {
        let Value::Object(row) = row else {
            mapped_rows.push(row);
            continue;
        };

        let mut mapped_tree: Map<String, Value> = Map::new();
        for child in branches {
            if let Some(Value::Array(child_rows)) = row.get(&child.name).cloned() {
                let mapped = map_output(
                    child.output_kind,
                    &child.output_props,
                    &child.branches,
                    child_rows,
                )?;
                mapped_tree.insert(child.name.clone(), mapped);
            }
        }

        let mut mapped_obj: Map<String, Value> = Map::new();
        let mut mapped_count = 0;
        for prop in props {
            if let Some(column) = &prop.mapped {
                match row.get(column) {
                    Some(v) => {
                        mapped_obj.insert(prop.name.clone(), v.clone());
                        mapped_count += 1;
                    }
                    None => {
                        return Err(ExecutionError::MappedColumnMissing(column.clone()));
                    }
                }
            }
            if prop.nested {
                if let Some(v) = mapped_tree.get(&prop.name) {
                    mapped_obj.insert(prop.name.clone(), v.clone());
                }
            }
        }

        // No mapped column means the row passes through untouched.
        if mapped_count == 0 {
            mapped_obj = row;
        }
        for (k, v) in mapped_tree {
            mapped_obj.insert(k, v);
        }
        mapped_rows.push(Value::Object(mapped_obj));
    }

    Ok(match kind {
        OutputKind::Array => Value::Array(mapped_rows),
        OutputKind::Object => mapped_rows
            .into_iter()
            .next()
            .unwrap_or(Value::Object(Map::new())),
    })
}

/// Entry point for a whole descriptor tree.
pub fn map_branch(branch: &Branch, rows: Vec<Value>) -> Result<Value, ExecutionError> {
    map_output(
        branch.output_kind,
        &branch.output_props,
        &branch.branches,
        rows,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prop(name: &str, mapped: Option<&str>, nested: bool) -> OutputProp {
        OutputProp {
            name: name.to_string(),
            mapped: mapped.map(str::to_string),
            nested,
        }
    }

    fn leaf_branch(name: &str, kind: OutputKind, props: Vec<OutputProp>) -> Branch {
        Branch {
            name: name.to_string(),
            key: name.to_lowercase(),
            method: format!("$.{name}"),
            path: "t".to_string(),
            input_array: false,
            output_kind: kind,
            use_parent_rows: false,
            partition_by: None,
            cache: false,
            twigs: Vec::new(),
            output_props: props,
            branches: Vec::new(),
        }
    }

    #[test]
    fn test_mapped_columns_are_renamed() {
        let props = vec![prop("id", Some("todo_id"), false)];
        let rows = vec![json!({"todo_id": 1, "x": "dropped"})];
        let out = map_output(OutputKind::Array, &props, &[], rows).unwrap();
        assert_eq!(out, json!([{"id": 1}]));
    }

    #[test]
    fn test_missing_mapped_column_is_loud() {
        let props = vec![prop("id", Some("todo_id"), false)];
        let rows = vec![json!({"other": 1})];
        let err = map_output(OutputKind::Array, &props, &[], rows).unwrap_err();
        assert!(err.to_string().contains("todo_id"));
    }

    #[test]
    fn test_rows_pass_through_without_mapped_props() {
        let rows = vec![json!({"a": 1, "b": 2})];
        let out = map_output(OutputKind::Array, &[], &[], rows).unwrap();
        assert_eq!(out, json!([{"a": 1, "b": 2}]));
    }

    #[test]
    fn test_object_kind_collapses_to_first_row() {
        let rows = vec![json!({"a": 1}), json!({"a": 2})];
        let out = map_output(OutputKind::Object, &[], &[], rows).unwrap();
        assert_eq!(out, json!({"a": 1}));
        let empty = map_output(OutputKind::Object, &[], &[], Vec::new()).unwrap();
        assert_eq!(empty, json!({}));
    }

    #[test]
    fn test_child_branch_rows_are_mapped_in_place() {
        let child = leaf_branch(
            "items",
            OutputKind::Array,
            vec![prop("sku", Some("item_sku"), false)],
        );
        let props = vec![prop("id", Some("todo_id"), false), prop("items", None, true)];
        let rows = vec![json!({
            "todo_id": 1,
            "items": [{"item_sku": "x"}, {"item_sku": "y"}]
        })];
        let out = map_output(OutputKind::Array, &props, &[child], rows).unwrap();
        assert_eq!(
            out,
            json!([{"id": 1, "items": [{"sku": "x"}, {"sku": "y"}]}])
        );
    }

    #[test]
    fn test_child_object_collapse_inside_passthrough() {
        let child = leaf_branch("owner", OutputKind::Object, Vec::new());
        let rows = vec![json!({"id": 1, "owner": [{"name": "a"}]})];
        let out = map_output(OutputKind::Array, &[], &[child], rows).unwrap();
        assert_eq!(out, json!([{"id": 1, "owner": {"name": "a"}}]));
    }
}
