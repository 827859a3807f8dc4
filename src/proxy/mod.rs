//! Reverse proxying to backend components.
//!
//! Each enabled component gets one [`ComponentProxy`] holding its address,
//! [`ProxyMode`] and transports. Its routes are registered in a shared
//! [`RouteTable`] that the gateway consults for every request.

mod handler;
mod mode;
mod routes;

pub use handler::{forward, handle};
pub use mode::{ComponentProxy, Credentials, IdentityHeaders, ProxyMode, set_identity_headers};
pub use routes::{MatchKind, OPENAPI_PATH, RouteSpec, RouteTable, component_routes};

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::Result;
use crate::config::{ComponentKind, ComponentsConfig};

/// Route table targets
pub type ProxyTable = RouteTable<Arc<ComponentProxy>>;

/// Build one proxy per enabled component and register its routes.
///
/// # Errors
///
/// Returns [`crate::Error::Config`] for an invalid component or a path
/// registered twice.
pub fn build_route_table(
    components: &ComponentsConfig,
    connect_timeout: Duration,
) -> Result<ProxyTable> {
    let mut table = RouteTable::new();
    for (kind, config) in components.enabled() {
        let proxy = Arc::new(ComponentProxy::from_config(kind, config, connect_timeout)?);
        register(&mut table, kind, &proxy)?;
    }
    Ok(table)
}

/// Register every route of `kind` against `proxy`
///
/// # Errors
///
/// Returns [`crate::Error::Config`] on a duplicate path.
pub fn register(
    table: &mut ProxyTable,
    kind: ComponentKind,
    proxy: &Arc<ComponentProxy>,
) -> Result<()> {
    for spec in component_routes(kind) {
        info!(
            component = %kind,
            path = %spec.path,
            exact = spec.kind == MatchKind::Exact,
            protected = spec.protected,
            mode = proxy.mode_name(),
            "Registered route"
        );
        table.insert(spec, Arc::clone(proxy))?;
    }
    Ok(())
}
