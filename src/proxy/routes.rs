//! Static route table: path prefixes and exact paths mapped to components.

use std::collections::HashMap;

use crate::config::ComponentKind;
use crate::{Error, Result};

/// Backend path every OpenAPI aggregation route is rewritten to
pub const OPENAPI_PATH: &str = "/openapi/v2";

/// How a route matches request paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Any path starting with the route path
    Prefix,
    /// Only the route path itself
    Exact,
}

/// One registration: where it matches, whether it needs a session and
/// which backend path it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub path: String,
    pub kind: MatchKind,
    pub protected: bool,
    pub component: ComponentKind,
    /// Replace the request path with this one when forwarding
    pub rewrite: Option<&'static str>,
}

impl RouteSpec {
    fn prefix(component: ComponentKind, path: &str, protected: bool) -> Self {
        Self {
            path: path.to_string(),
            kind: MatchKind::Prefix,
            protected,
            component,
            rewrite: None,
        }
    }

    fn exact(component: ComponentKind, path: &str, protected: bool) -> Self {
        Self {
            path: path.to_string(),
            kind: MatchKind::Exact,
            protected,
            component,
            rewrite: None,
        }
    }

    fn openapi(component: ComponentKind) -> Self {
        Self {
            rewrite: Some(OPENAPI_PATH),
            ..Self::exact(component, &format!("/tke-{component}-api"), true)
        }
    }

    /// Path sent to the backend for a request to `request_path`
    #[must_use]
    pub fn upstream_path<'a>(&self, request_path: &'a str) -> &'a str {
        self.rewrite.unwrap_or(request_path)
    }
}

/// Routes a component serves. Ingest and IdP paths stay unprotected so
/// collectors and browsers can reach them without a session.
#[must_use]
pub fn component_routes(component: ComponentKind) -> Vec<RouteSpec> {
    use ComponentKind as K;

    let group = |name: &str| format!("/apis/{name}.tkestack.io/");
    let mut routes = match component {
        K::Platform => vec![
            RouteSpec::prefix(component, "/api/", true),
            RouteSpec::prefix(component, "/apis/", true),
            RouteSpec::prefix(component, &group("platform"), true),
        ],
        K::Notify => vec![
            RouteSpec::prefix(component, &group("notify"), true),
            RouteSpec::exact(component, "/webhook", false),
        ],
        K::Registry => vec![
            RouteSpec::prefix(component, &group("registry"), true),
            RouteSpec::prefix(component, "/v2/", false),
            RouteSpec::prefix(component, "/chart/", false),
        ],
        K::Auth => vec![
            RouteSpec::prefix(component, &group("auth"), true),
            RouteSpec::prefix(component, "/oidc/", false),
        ],
        K::Audit => vec![
            RouteSpec::prefix(component, &group("audit"), true),
            RouteSpec::prefix(component, "/apis/audit.tkestack.io/v1/events/sink/", false),
        ],
        K::Business | K::Monitor | K::Logagent | K::Application | K::Mesh => {
            vec![RouteSpec::prefix(component, &group(component.as_str()), true)]
        }
    };
    routes.push(RouteSpec::openapi(component));
    routes
}

/// Immutable route lookup.
///
/// Exact paths are checked first, then the longest matching prefix wins, so
/// nested prefixes (`/apis/` and `/apis/audit.tkestack.io/`) may coexist.
/// Registering the same path twice is a configuration error.
#[derive(Debug)]
pub struct RouteTable<T> {
    exact: HashMap<String, (RouteSpec, T)>,
    // longest first
    prefixes: Vec<(RouteSpec, T)>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
        }
    }
}

impl<T> RouteTable<T> {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a route of the same kind already uses
    /// this path.
    pub fn insert(&mut self, spec: RouteSpec, target: T) -> Result<()> {
        let existing = match spec.kind {
            MatchKind::Exact => self.exact.get(&spec.path).map(|(s, _)| s),
            MatchKind::Prefix => self
                .prefixes
                .iter()
                .map(|(s, _)| s)
                .find(|s| s.path == spec.path),
        };
        if let Some(existing) = existing {
            return Err(Error::Config(format!(
                "route {} registered by both {} and {}",
                spec.path, existing.component, spec.component
            )));
        }

        match spec.kind {
            MatchKind::Exact => {
                self.exact.insert(spec.path.clone(), (spec, target));
            }
            MatchKind::Prefix => {
                let at = self
                    .prefixes
                    .partition_point(|(s, _)| s.path.len() >= spec.path.len());
                self.prefixes.insert(at, (spec, target));
            }
        }
        Ok(())
    }

    /// Route serving `path`, if any
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<(&RouteSpec, &T)> {
        if let Some((spec, target)) = self.exact.get(path) {
            return Some((spec, target));
        }
        self.prefixes
            .iter()
            .find(|(spec, _)| path.starts_with(&spec.path))
            .map(|(spec, target)| (spec, target))
    }

    /// Every route, exact paths first, each group sorted by path
    pub fn routes(&self) -> Vec<&RouteSpec> {
        let mut exact: Vec<_> = self.exact.values().map(|(s, _)| s).collect();
        exact.sort_by(|a, b| a.path.cmp(&b.path));
        let mut prefixes: Vec<_> = self.prefixes.iter().map(|(s, _)| s).collect();
        prefixes.sort_by(|a, b| a.path.cmp(&b.path));
        exact.extend(prefixes);
        exact
    }

    /// Number of registered routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
