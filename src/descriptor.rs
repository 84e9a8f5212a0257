//! Builds the executable descriptor for one API path: a trunk with nested
//! branches, assembled from template files and the path's input/output
//! models. Parameters declared by templates are folded back into the input
//! models so that request shapes expose them.

use crate::content::ContentReader;
use crate::error::BuildError;
use crate::schema::Schema;
use crate::template::{lex, parse, Twig};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    Object,
    Array,
}

/// One output-model property relevant to mapping: either a column rename
/// (`mapped`) or a container slot for a child branch (`nested`).
#[derive(Clone, Debug)]
pub struct OutputProp {
    pub name: String,
    pub mapped: Option<String>,
    pub nested: bool,
}

/// One node of the descriptor tree. The trunk is itself a branch named `$`.
#[derive(Clone, Debug)]
pub struct Branch {
    pub name: String,
    /// Lowercased name, used for shape navigation and payload properties.
    pub key: String,
    /// Dotted template name, e.g. `$.orders.items`.
    pub method: String,
    pub path: String,
    pub input_array: bool,
    pub output_kind: OutputKind,
    pub use_parent_rows: bool,
    pub partition_by: Option<String>,
    pub cache: bool,
    pub twigs: Vec<Twig>,
    pub output_props: Vec<OutputProp>,
    pub branches: Vec<Branch>,
}

/// Request-side schemas for one path, shared across requests.
#[derive(Clone, Debug)]
pub struct RequestModel {
    pub query: Arc<Schema>,
    pub path: Arc<Schema>,
    pub header: Arc<Schema>,
    pub cookie: Arc<Schema>,
    pub payload: Arc<Schema>,
}

#[derive(Clone, Debug)]
pub struct Trunk {
    pub branch: Branch,
    pub connections: Vec<String>,
    pub model: RequestModel,
}

fn array_prop_rx() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"^(?P<path>\w+)\[\d+\]$").expect("array prop regex"))
}

/// Lowercase template names and order them by ascending dot depth, so a
/// parent branch is always seen before its children.
fn order_by_dots(mut names: Vec<String>) -> Vec<String> {
    for n in &mut names {
        *n = n.to_lowercase();
    }
    names.sort_by_key(|n| n.matches('.').count());
    names
}

/// Nested map of branch names derived from dotted file names. Insertion
/// order is preserved.
#[derive(Default, Debug)]
struct FileMap {
    children: Vec<(String, FileMap)>,
}

impl FileMap {
    fn ensure(&mut self, name: &str) -> &mut FileMap {
        if let Some(idx) = self.children.iter().position(|(n, _)| n == name) {
            return &mut self.children[idx].1;
        }
        self.children.push((name.to_string(), FileMap::default()));
        let idx = self.children.len() - 1;
        &mut self.children[idx].1
    }

    fn insert(&mut self, dotted: &str) {
        if dotted.is_empty() {
            return;
        }
        match dotted.split_once('.') {
            Some((head, rest)) => self.ensure(head).insert(rest),
            None => {
                self.ensure(dotted);
            }
        }
    }

    fn get(&self, name: &str) -> Option<&FileMap> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }
}

fn lower_keys_deep(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(k.to_lowercase(), lower_keys_deep(v));
            }
            Value::Object(out)
        }
        Value::Array(xs) => Value::Array(xs.iter().map(lower_keys_deep).collect()),
        other => other.clone(),
    }
}

/// Input models mutated during the build as template parameters register
/// themselves.
struct ModelSet {
    query: Value,
    path: Value,
    header: Value,
    cookie: Value,
    payload: Value,
}

fn empty_object_model() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Walk the payload model down a chain of property names.
fn payload_at<'v>(payload: &'v mut Value, path: &[String]) -> Option<&'v mut Value> {
    path.iter().try_fold(payload, |model, name| {
        Value::get_mut(Value::get_mut(model, "properties")?, name.as_str())
    })
}

/// Create missing intermediate properties and register the leaf with its
/// declared type. `name[0]`-style segments become array properties.
fn insert_prop(model: &mut Value, dotted: &str, ty: &str) {
    let Some(obj) = model.as_object_mut() else {
        return;
    };
    if !obj.contains_key("properties") {
        obj.insert("properties".to_string(), Value::Object(Map::new()));
    }
    let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) else {
        return;
    };
    match dotted.split_once('.') {
        None => {
            if !props.contains_key(dotted) {
                let ty = if ty.is_empty() { "string" } else { ty };
                props.insert(dotted.to_string(), json!({"type": ty}));
            }
        }
        Some((head, rest)) => {
            let (seg, container) = match array_prop_rx().captures(head) {
                Some(c) => (c["path"].to_string(), "array"),
                None => (head.to_string(), "object"),
            };
            let entry = props
                .entry(seg)
                .or_insert_with(|| json!({"type": container, "properties": {}}));
            insert_prop(entry, rest, ty);
        }
    }
}

/// Route a declared parameter to the model it belongs to. `$parent.`
/// prefixes climb the payload tree; `$params.` and `$request.` values are
/// runtime-only and register nowhere.
fn register_param(
    models: &mut ModelSet,
    payload_path: &[String],
    name: &str,
    ty: &str,
) {
    let mut depth = payload_path.len();
    let mut rest = name;
    while let Some(tail) = rest.strip_prefix("$parent.") {
        depth = match depth.checked_sub(1) {
            Some(d) => d,
            None => return,
        };
        rest = tail;
    }

    if let Some(prop) = rest.strip_prefix("$query.") {
        insert_prop(&mut models.query, prop, ty);
    } else if let Some(prop) = rest.strip_prefix("$path.") {
        insert_prop(&mut models.path, prop, ty);
    } else if let Some(prop) = rest.strip_prefix("$header.") {
        insert_prop(&mut models.header, prop, ty);
    } else if let Some(prop) = rest.strip_prefix("$cookie.") {
        insert_prop(&mut models.cookie, prop, ty);
    } else if rest.starts_with("$params.") || rest.starts_with("$request.") {
    } else if let Some(model) = payload_at(&mut models.payload, &payload_path[..depth]) {
        insert_prop(model, rest, ty);
    }
}

fn output_kind(model: Option<&Value>) -> OutputKind {
    match model.and_then(|m| m.get("type")).and_then(Value::as_str) {
        Some("object") => OutputKind::Object,
        _ => OutputKind::Array,
    }
}

fn output_props(model: Option<&Value>) -> Vec<OutputProp> {
    let Some(props) = model
        .and_then(|m| m.get("properties"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (name, value) in props {
        let (mapped, nested) = match value {
            Value::String(column) => (Some(column.clone()), false),
            Value::Object(obj) => {
                let mapped = obj.get("mapped").and_then(Value::as_str).map(str::to_string);
                let nested = matches!(
                    obj.get("type").and_then(Value::as_str),
                    Some("object") | Some("array")
                );
                (mapped, nested)
            }
            _ => (None, false),
        };
        if mapped.is_some() || nested {
            out.push(OutputProp {
                name: name.clone(),
                mapped,
                nested,
            });
        }
    }
    out
}

struct Builder<'a> {
    reader: &'a dyn ContentReader,
    connections: Vec<String>,
}

impl<'a> Builder<'a> {
    fn build_branch(
        &mut self,
        name: &str,
        method: &str,
        path: &str,
        payload_path: &mut Vec<String>,
        models: &mut ModelSet,
        output_model: Option<&Value>,
        file_map: &FileMap,
    ) -> Result<Branch, BuildError> {
        let content = self.reader.get_sql(method, path);

        let input_array = payload_at(&mut models.payload, payload_path)
            .and_then(|m| m.get("type"))
            .and_then(Value::as_str)
            == Some("array");

        let use_parent_rows = output_model
            .and_then(|m| m.get("parent_rows"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let cache = output_model
            .and_then(|m| m.get("cache"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if cache && use_parent_rows {
            return Err(BuildError::CacheWithParentRows {
                branch: method.to_string(),
            });
        }
        let partition_by = output_model
            .and_then(|m| m.get("partition_by"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut branch = Branch {
            name: name.to_string(),
            key: name.to_lowercase(),
            method: method.to_string(),
            path: path.to_string(),
            input_array,
            output_kind: output_kind(output_model),
            use_parent_rows,
            partition_by,
            cache,
            twigs: Vec::new(),
            output_props: output_props(output_model),
            branches: Vec::new(),
        };

        if let Some(content) = &content {
            let template = parse(&lex(content), method)?;
            if template.twigs.is_empty() {
                // A template that declares no statements ends the branch
                // here, children included.
                return Ok(branch);
            }
            for decl in &template.params {
                register_param(models, payload_path, &decl.name, &decl.ty);
            }
            for twig in &template.twigs {
                self.connections.push(twig.connection.clone());
            }
            branch.twigs = template.twigs;
        }

        // Children declared by the output model come first, then templates
        // on disk that the model does not mention.
        let mut child_names: Vec<String> = Vec::new();
        let output_properties = output_model
            .and_then(|m| m.get("properties"))
            .and_then(Value::as_object);
        if let Some(props) = output_properties {
            for (k, v) in props {
                let container = matches!(
                    v.get("type").and_then(Value::as_str),
                    Some("object") | Some("array")
                );
                if container {
                    child_names.push(k.clone());
                }
            }
        }
        for (file_name, _) in &file_map.children {
            if !child_names.iter().any(|n| n.to_lowercase() == *file_name) {
                child_names.push(file_name.clone());
            }
        }

        for child_name in child_names {
            let key = child_name.to_lowercase();
            let child_method = format!("{method}.{key}");

            if let Some(model) = payload_at(&mut models.payload, payload_path) {
                if let Some(props) = model
                    .as_object_mut()
                    .and_then(|o| o.get_mut("properties"))
                    .and_then(Value::as_object_mut)
                {
                    if !props.contains_key(&key) {
                        props.insert(key.clone(), empty_object_model());
                    }
                }
            }

            let child_output = output_properties.and_then(|p| p.get(&child_name)).cloned();
            let empty = FileMap::default();
            let child_files = file_map.get(&key).unwrap_or(&empty);

            payload_path.push(key.clone());
            let child = self.build_branch(
                &child_name,
                &child_method,
                path,
                payload_path,
                models,
                child_output.as_ref(),
                child_files,
            )?;
            payload_path.pop();

            if child.use_parent_rows && branch.partition_by.is_none() {
                return Err(BuildError::MissingPartitionBy {
                    branch: child.method,
                });
            }
            branch.branches.push(child);
        }

        Ok(branch)
    }
}

/// Build the descriptor for one API path. Fails with
/// [`BuildError::NoTemplates`] when the path holds no templates at all.
pub fn create_trunk(path: &str, reader: &dyn ContentReader) -> Result<Trunk, BuildError> {
    let ordered = order_by_dots(reader.list_sql(path));
    if ordered.is_empty() {
        return Err(BuildError::NoTemplates(path.to_string()));
    }

    let mut files = FileMap::default();
    for name in &ordered {
        files.insert(name);
    }

    let config = reader.get_config(path)?;
    let input = config.input.unwrap_or(Value::Null);
    let pick = |key: &str| -> Value {
        match input.get(key) {
            Some(v) if !v.is_null() => lower_keys_deep(v),
            _ => empty_object_model(),
        }
    };
    let mut models = ModelSet {
        query: pick("query"),
        path: pick("path"),
        header: pick("header"),
        cookie: pick("cookie"),
        payload: pick("payload"),
    };
    let output_model = config
        .output
        .unwrap_or_else(|| json!({"type": "array", "properties": {}}));

    let mut builder = Builder {
        reader,
        connections: vec!["db".to_string()],
    };
    let empty = FileMap::default();
    let trunk_files = files.get("$").unwrap_or(&empty);
    let branch = builder.build_branch(
        "$",
        "$",
        path,
        &mut Vec::new(),
        &mut models,
        Some(&output_model),
        trunk_files,
    )?;

    let mut connections = Vec::new();
    for c in builder.connections {
        if !connections.contains(&c) {
            connections.push(c);
        }
    }

    Ok(Trunk {
        branch,
        connections,
        model: RequestModel {
            query: Arc::new(Schema::from_value(&models.query)),
            path: Arc::new(Schema::from_value(&models.path)),
            header: Arc::new(Schema::from_value(&models.header)),
            cookie: Arc::new(Schema::from_value(&models.cookie)),
            payload: Arc::new(Schema::from_value(&models.payload)),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ModelConfig;
    use std::collections::HashMap;

    struct MapReader {
        sql: HashMap<String, String>,
        input: Option<Value>,
        output: Option<Value>,
    }

    impl MapReader {
        fn new(files: &[(&str, &str)]) -> MapReader {
            MapReader {
                sql: files
                    .iter()
                    .map(|(n, c)| (n.to_string(), c.to_string()))
                    .collect(),
                input: None,
                output: None,
            }
        }
    }

    impl ContentReader for MapReader {
        fn get_sql(&self, method: &str, _path: &str) -> Option<String> {
            self.sql.get(method).cloned()
        }

        fn list_sql(&self, _path: &str) -> Vec<String> {
            let mut names: Vec<String> = self.sql.keys().cloned().collect();
            names.sort();
            names
        }

        fn get_config(&self, _path: &str) -> Result<ModelConfig, BuildError> {
            Ok(ModelConfig {
                input: self.input.clone(),
                output: self.output.clone(),
            })
        }

        fn get_routes(&self) -> Result<Option<Value>, BuildError> {
            Ok(None)
        }
    }

    #[test]
    fn test_no_templates_is_an_error() {
        let reader = MapReader::new(&[]);
        assert!(matches!(
            create_trunk("todo/get", &reader),
            Err(BuildError::NoTemplates(_))
        ));
    }

    #[test]
    fn test_dotted_files_nest_as_branches() {
        let reader = MapReader::new(&[
            ("$", "select 1 as id"),
            ("$.items", "select 2 as id"),
            ("$.items.tags", "select 3 as id"),
        ]);
        let trunk = create_trunk("todo/get", &reader).unwrap();
        assert_eq!(trunk.branch.method, "$");
        assert_eq!(trunk.branch.branches.len(), 1);
        let items = &trunk.branch.branches[0];
        assert_eq!(items.method, "$.items");
        assert_eq!(items.branches[0].method, "$.items.tags");
    }

    #[test]
    fn test_model_children_come_before_file_children() {
        let mut reader = MapReader::new(&[
            ("$", "select 1 as id"),
            ("$.aaa", "select 2"),
            ("$.zzz", "select 3"),
        ]);
        reader.output = Some(json!({
            "type": "array",
            "properties": {
                "zzz": {"type": "array"}
            }
        }));
        let trunk = create_trunk("todo/get", &reader).unwrap();
        let names: Vec<&str> = trunk
            .branch
            .branches
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(names, vec!["zzz", "aaa"]);
    }

    #[test]
    fn test_empty_template_stops_the_branch() {
        let reader = MapReader::new(&[
            ("$", "--($query.id integer)--"),
            ("$.items", "select 1"),
        ]);
        let trunk = create_trunk("todo/get", &reader).unwrap();
        assert!(trunk.branch.twigs.is_empty());
        assert!(trunk.branch.branches.is_empty());
    }

    #[test]
    fn test_declared_params_register_into_models() {
        let reader = MapReader::new(&[(
            "$",
            "--($query.page integer, name, address.city)--\nselect {{$query.page}}, {{name}}, {{address.city}}",
        )]);
        let trunk = create_trunk("todo/get", &reader).unwrap();
        let page = trunk.model.query.property("page").unwrap();
        assert_eq!(page.ty, Some(crate::schema::SchemaType::Integer));
        assert!(trunk.model.payload.property("name").is_some());
        let address = trunk.model.payload.property("address").unwrap();
        assert!(address.property("city").is_some());
    }

    #[test]
    fn test_parent_params_register_on_parent_model() {
        let reader = MapReader::new(&[
            ("$", "--(name)--\nselect {{name}}"),
            ("$.items", "--($parent.name)--\nselect {{$parent.name}}"),
        ]);
        let trunk = create_trunk("todo/get", &reader).unwrap();
        // $parent.name from the child resolves to the trunk payload.
        assert!(trunk.model.payload.property("name").is_some());
        assert!(trunk.model.payload.property("items").is_some());
    }

    #[test]
    fn test_array_segment_registers_array_property() {
        let reader = MapReader::new(&[(
            "$",
            "--(items[0].sku)--\nselect {{items[0].sku}}",
        )]);
        let trunk = create_trunk("todo/get", &reader).unwrap();
        let items = trunk.model.payload.property("items").unwrap();
        assert!(items.is_array());
        assert!(items.property("sku").is_some());
    }

    #[test]
    fn test_connections_accumulate_in_first_seen_order() {
        let reader = MapReader::new(&[
            ("$", "select 1 --sql(audit)-- select 2"),
            ("$.items", "select 3 --sql(audit)-- select 4"),
        ]);
        let trunk = create_trunk("todo/get", &reader).unwrap();
        assert_eq!(trunk.connections, vec!["db", "audit"]);
    }

    #[test]
    fn test_cache_with_parent_rows_conflict() {
        let mut reader = MapReader::new(&[("$", "select 1"), ("$.items", "select 2")]);
        reader.output = Some(json!({
            "type": "array",
            "partition_by": "id",
            "properties": {
                "items": {"type": "array", "cache": true, "parent_rows": true}
            }
        }));
        assert!(matches!(
            create_trunk("todo/get", &reader),
            Err(BuildError::CacheWithParentRows { .. })
        ));
    }

    #[test]
    fn test_parent_rows_requires_partition_by() {
        let mut reader = MapReader::new(&[("$", "select 1"), ("$.items", "select 2")]);
        reader.output = Some(json!({
            "type": "array",
            "properties": {
                "items": {"type": "array", "parent_rows": true}
            }
        }));
        assert!(matches!(
            create_trunk("todo/get", &reader),
            Err(BuildError::MissingPartitionBy { .. })
        ));
    }

    #[test]
    fn test_output_props_distinguish_mapped_and_nested() {
        let mut reader = MapReader::new(&[("$", "select 1"), ("$.items", "select 2")]);
        reader.output = Some(json!({
            "type": "object",
            "properties": {
                "id": {"mapped": "todo_id"},
                "title": "todo_title",
                "items": {"type": "array"},
                "note": {"type": "string"}
            }
        }));
        let trunk = create_trunk("todo/get", &reader).unwrap();
        assert_eq!(trunk.branch.output_kind, OutputKind::Object);
        let props = &trunk.branch.output_props;
        assert_eq!(props.len(), 3);
        assert_eq!(props[0].mapped.as_deref(), Some("todo_id"));
        assert_eq!(props[1].mapped.as_deref(), Some("todo_title"));
        assert!(props[2].nested);
    }
}
