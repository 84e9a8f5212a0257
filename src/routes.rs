//! Route table: maps request paths to descriptor directories.
//!
//! The table is loaded from an optional `routes.yaml`/`routes.json` at the
//! content root. Each entry carries a `route` pattern and a `descriptor`
//! directory; `{name}` segments become named path parameters. A request path
//! that matches no entry is used as the descriptor path directly.

use crate::error::BuildError;
use regex::Regex;
use serde_json::{Map, Value};

struct Route {
    pattern: Regex,
    descriptor: String,
    path: String,
}

/// Resolution of a request path against the route table.
pub struct RouteMatch {
    /// Directory the descriptor lives in, relative to the content root.
    pub descriptor: String,
    /// The route pattern as written, used as the descriptor cache key.
    pub path: String,
    /// Values captured from `{name}` segments.
    pub path_values: Map<String, Value>,
}

pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Builds the table from the parsed routes config. `None` (no routes
    /// file) yields an empty table; every path then resolves to itself.
    pub fn from_config(config: Option<&Value>) -> Result<Router, BuildError> {
        let mut routes = Vec::new();
        if let Some(Value::Array(entries)) = config {
            for entry in entries {
                let (route, descriptor) = match (entry.get("route"), entry.get("descriptor")) {
                    (Some(Value::String(r)), Some(Value::String(d))) => (r, d),
                    _ => continue,
                };
                let pattern = compile_route(route)?;
                routes.push(Route {
                    pattern,
                    descriptor: descriptor.clone(),
                    path: route.clone(),
                });
            }
        }
        Ok(Router { routes })
    }

    /// First matching entry wins. Unmatched paths fall through to the path
    /// itself with no captured values.
    pub fn resolve(&self, path: &str) -> RouteMatch {
        for route in &self.routes {
            if let Some(captures) = route.pattern.captures(path) {
                let mut path_values = Map::new();
                for name in route.pattern.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        path_values.insert(name.to_string(), Value::String(m.as_str().to_string()));
                    }
                }
                return RouteMatch {
                    descriptor: route.descriptor.clone(),
                    path: route.path.clone(),
                    path_values,
                };
            }
        }
        RouteMatch {
            descriptor: path.to_string(),
            path: path.to_string(),
            path_values: Map::new(),
        }
    }
}

/// `{name}` segments become named capture groups matching one path segment.
/// A single trailing slash is tolerated.
fn compile_route(route: &str) -> Result<Regex, BuildError> {
    let mut pattern = String::from("^");
    let mut rest = route;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        pattern.push_str(&regex::escape(&rest[..open]));
        let name = &rest[open + 1..open + close];
        pattern.push_str("(?P<");
        pattern.push_str(name);
        pattern.push_str(">[^/]+)");
        rest = &rest[open + close + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push_str("/?$");
    Regex::new(&pattern).map_err(|e| BuildError::InvalidModel {
        path: "routes".to_string(),
        message: format!("bad route pattern {route:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_with_parameters_captures_values() {
        let config = json!([
            {"route": "customers/{id}/orders/{order_id}", "descriptor": "customers/orders"}
        ]);
        let router = Router::from_config(Some(&config)).unwrap();

        let m = router.resolve("customers/42/orders/7");
        assert_eq!(m.descriptor, "customers/orders");
        assert_eq!(m.path, "customers/{id}/orders/{order_id}");
        assert_eq!(m.path_values["id"], json!("42"));
        assert_eq!(m.path_values["order_id"], json!("7"));
    }

    #[test]
    fn test_trailing_slash_tolerated() {
        let config = json!([{"route": "items/{id}", "descriptor": "items/one"}]);
        let router = Router::from_config(Some(&config)).unwrap();
        assert_eq!(router.resolve("items/3/").descriptor, "items/one");
    }

    #[test]
    fn test_unmatched_path_resolves_to_itself() {
        let config = json!([{"route": "items/{id}", "descriptor": "items/one"}]);
        let router = Router::from_config(Some(&config)).unwrap();

        let m = router.resolve("reports/daily");
        assert_eq!(m.descriptor, "reports/daily");
        assert_eq!(m.path, "reports/daily");
        assert!(m.path_values.is_empty());
    }

    #[test]
    fn test_first_match_wins() {
        let config = json!([
            {"route": "items/special", "descriptor": "items/special"},
            {"route": "items/{id}", "descriptor": "items/one"}
        ]);
        let router = Router::from_config(Some(&config)).unwrap();
        assert_eq!(router.resolve("items/special").descriptor, "items/special");
        assert_eq!(router.resolve("items/9").descriptor, "items/one");
    }

    #[test]
    fn test_entries_missing_keys_are_skipped() {
        let config = json!([
            {"route": "only-route"},
            {"descriptor": "only-descriptor"},
            {"route": "ok", "descriptor": "ok/dir"}
        ]);
        let router = Router::from_config(Some(&config)).unwrap();
        assert_eq!(router.resolve("ok").descriptor, "ok/dir");
        assert_eq!(router.resolve("only-route").descriptor, "only-route");
    }
}
