//! One engine instance: content reader, provider factory, route table and
//! both caches. `execute` is the whole request lifecycle minus HTTP.

use crate::cache::{DescriptorCache, ResultCache};
use crate::content::{ContentReader, FileContentReader};
use crate::context::{Context, RequestInput};
use crate::descriptor::{Branch, Trunk};
use crate::engine::get_result;
use crate::error::{ApiError, BuildError};
use crate::provider::ProviderFactory;
use crate::routes::{RouteMatch, Router};
use serde_json::{json, Value};
use std::sync::Arc;

/// Everything the HTTP layer needs to write a response.
#[derive(Debug)]
pub struct ApiResult {
    pub status: u16,
    pub body: Value,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, Value)>,
}

pub struct Arbor {
    reader: Arc<dyn ContentReader>,
    factory: Arc<dyn ProviderFactory>,
    descriptors: DescriptorCache,
    results: ResultCache,
    router: Router,
    /// Debug rebuilds descriptors on every request so template edits are
    /// picked up without a restart.
    debug: bool,
}

impl Arbor {
    pub fn new(
        reader: Arc<dyn ContentReader>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Arbor, BuildError> {
        let router = Router::from_config(reader.get_routes()?.as_ref())?;
        Ok(Arbor {
            reader,
            factory,
            descriptors: DescriptorCache::new(),
            results: ResultCache::new(),
            router,
            debug: false,
        })
    }

    /// Engine over a content directory, the usual deployment.
    pub fn from_dir(
        root: impl Into<std::path::PathBuf>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Arbor, BuildError> {
        Arbor::new(Arc::new(FileContentReader::new(root)), factory)
    }

    pub fn with_debug(mut self, debug: bool) -> Arbor {
        self.debug = debug;
        self
    }

    pub fn resolve(&self, path: &str) -> RouteMatch {
        self.router.resolve(path)
    }

    /// Descriptor for a resolved route and HTTP method. A route with no
    /// templates is a 404, not a server error.
    pub fn get_descriptor(&self, route: &RouteMatch, method: &str) -> Result<Arc<Trunk>, ApiError> {
        let path = descriptor_path(&route.descriptor, method);
        let built = if self.debug {
            crate::descriptor::create_trunk(&path, self.reader.as_ref()).map(Arc::new)
        } else {
            self.descriptors.get_or_build(&path, self.reader.as_ref())
        };
        match built {
            Ok(trunk) => Ok(trunk),
            Err(BuildError::NoTemplates(p)) => Err(ApiError::NotFound(p)),
            Err(e) => Err(ApiError::Build(e)),
        }
    }

    /// Full request lifecycle: route resolution, descriptor build, context
    /// assembly, execution. Route-captured path values are merged into the
    /// input without overriding values the caller already set.
    pub async fn execute(
        &self,
        method: &str,
        path: &str,
        mut input: RequestInput,
    ) -> Result<ApiResult, ApiError> {
        let route = self.resolve(path);
        let trunk = self.get_descriptor(&route, &method.to_lowercase())?;

        for (k, v) in route.path_values.iter() {
            input.path_values.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let mut ctx = Context::new(trunk.as_ref(), input)?;
        let body = get_result(trunk.as_ref(), self.factory.as_ref(), &mut ctx, &self.results).await?;

        Ok(ApiResult {
            status: ctx.status_code().unwrap_or(200),
            body,
            headers: ctx.response_headers(),
            cookies: ctx.response_cookies(),
        })
    }

    /// Debug dump of a built descriptor, `/_debug` in the web layer.
    pub fn describe(&self, path: &str, method: &str) -> Result<Value, ApiError> {
        let route = self.resolve(path);
        let trunk = self.get_descriptor(&route, &method.to_lowercase())?;
        Ok(json!({
            "path": trunk.branch.path,
            "connections": trunk.connections,
            "branch": describe_branch(&trunk.branch),
        }))
    }

    pub fn clear_cache(&self) {
        self.descriptors.clear();
        self.results.clear();
    }
}

fn descriptor_path(descriptor: &str, method: &str) -> String {
    let base = descriptor.trim_matches('/');
    if base.is_empty() {
        method.to_string()
    } else {
        format!("{base}/{method}")
    }
}

fn describe_branch(branch: &Branch) -> Value {
    json!({
        "name": branch.name,
        "method": branch.method,
        "input_array": branch.input_array,
        "output_array": branch.output_kind == crate::descriptor::OutputKind::Array,
        "use_parent_rows": branch.use_parent_rows,
        "partition_by": branch.partition_by,
        "cache": branch.cache,
        "twigs": branch
            .twigs
            .iter()
            .map(|t| {
                json!({
                    "connection": t.connection,
                    "parameters": t.parameters.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>(),
        "branches": branch.branches.iter().map(describe_branch).collect::<Vec<_>>(),
    })
}
