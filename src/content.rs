//! Template and model sources. The file layout mirrors the API tree:
//! `<root>/<path>/<method>.sql` for templates, `$.input.(yaml|json)` and
//! `$.output.(yaml|json)` for models, and `routes.(yaml|json)` at the root
//! for route overrides.

use crate::error::BuildError;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Input and output models for one API path, raw and unvalidated.
#[derive(Clone, Debug, Default)]
pub struct ModelConfig {
    pub input: Option<Value>,
    pub output: Option<Value>,
}

/// Source of templates and models. File-backed in production, in-memory in
/// tests.
pub trait ContentReader: Send + Sync {
    /// Template text for `<path>/<method>.sql`, if present.
    fn get_sql(&self, method: &str, path: &str) -> Option<String>;

    /// Template names (without extension) under `path`.
    fn list_sql(&self, path: &str) -> Vec<String>;

    fn get_config(&self, path: &str) -> Result<ModelConfig, BuildError>;

    /// Route table from `routes.(yaml|json)`, if present.
    fn get_routes(&self) -> Result<Option<Value>, BuildError>;
}

pub struct FileContentReader {
    root: PathBuf,
}

impl FileContentReader {
    pub fn new(root: impl Into<PathBuf>) -> FileContentReader {
        FileContentReader { root: root.into() }
    }

    // Extensions are appended; `with_extension` would replace the
    // `.input`/`.output` suffix.
    fn load_model(&self, dir: &Path, name: &str) -> Result<Option<Value>, BuildError> {
        let yaml = dir.join(format!("{name}.yaml"));
        if yaml.exists() {
            let text = fs::read_to_string(&yaml).map_err(|e| BuildError::InvalidModel {
                path: yaml.display().to_string(),
                message: e.to_string(),
            })?;
            let value = serde_yaml::from_str(&text).map_err(|e| BuildError::InvalidModel {
                path: yaml.display().to_string(),
                message: e.to_string(),
            })?;
            return Ok(Some(value));
        }
        let json = dir.join(format!("{name}.json"));
        if json.exists() {
            let text = fs::read_to_string(&json).map_err(|e| BuildError::InvalidModel {
                path: json.display().to_string(),
                message: e.to_string(),
            })?;
            let value = serde_json::from_str(&text).map_err(|e| BuildError::InvalidModel {
                path: json.display().to_string(),
                message: e.to_string(),
            })?;
            return Ok(Some(value));
        }
        Ok(None)
    }
}

impl ContentReader for FileContentReader {
    fn get_sql(&self, method: &str, path: &str) -> Option<String> {
        let file = self.root.join(path).join(format!("{method}.sql"));
        fs::read_to_string(file).ok()
    }

    fn list_sql(&self, path: &str) -> Vec<String> {
        let dir = self.root.join(path);
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|n| n.strip_suffix(".sql").map(str::to_string))
            .collect();
        names.sort();
        names
    }

    fn get_config(&self, path: &str) -> Result<ModelConfig, BuildError> {
        let dir = self.root.join(path);
        Ok(ModelConfig {
            input: self.load_model(&dir, "$.input")?,
            output: self.load_model(&dir, "$.output")?,
        })
    }

    fn get_routes(&self) -> Result<Option<Value>, BuildError> {
        self.load_model(&self.root, "routes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let file = root.join(rel);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(file, content).unwrap();
    }

    #[test]
    fn test_sql_and_models_are_read_per_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "todo/get/$.sql", "select 1");
        write(dir.path(), "todo/get/$.data.sql", "select 2");
        write(
            dir.path(),
            "todo/get/$.input.yaml",
            "payload:\n  type: object\n",
        );
        let reader = FileContentReader::new(dir.path());

        assert_eq!(reader.get_sql("$", "todo/get"), Some("select 1".into()));
        assert_eq!(reader.get_sql("missing", "todo/get"), None);
        assert_eq!(reader.list_sql("todo/get"), vec!["$", "$.data"]);
        let config = reader.get_config("todo/get").unwrap();
        assert_eq!(config.input.unwrap()["payload"]["type"], "object");
        assert!(config.output.is_none());
    }

    #[test]
    fn test_json_model_fallback() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "todo/get/$.output.json",
            r#"{"type": "object"}"#,
        );
        let reader = FileContentReader::new(dir.path());
        let config = reader.get_config("todo/get").unwrap();
        assert_eq!(config.output.unwrap()["type"], "object");
    }

    #[test]
    fn test_invalid_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "todo/get/$.input.yaml", "payload: [unclosed");
        let reader = FileContentReader::new(dir.path());
        assert!(reader.get_config("todo/get").is_err());
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileContentReader::new(dir.path());
        assert!(reader.list_sql("nope").is_empty());
    }
}
