//! Mapping ID token claims to a caller identity

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::OidcConfig;

/// Key under [`Identity::extra`] carrying the tenant id
pub const TENANT_ID_KEY: &str = "tenantid";

/// Authenticated caller, alive for one request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    /// User name, prefixed
    pub name: String,
    /// Stable subject id
    pub uid: String,
    /// Group memberships, prefixed
    #[serde(default)]
    pub groups: Vec<String>,
    /// Additional attributes
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Which claims carry which identity attribute
#[derive(Debug, Clone)]
pub struct ClaimMapping {
    pub username_claim: String,
    pub username_prefix: String,
    pub groups_claim: String,
    pub groups_prefix: String,
    pub tenant_id_claim: String,
}

impl From<&OidcConfig> for ClaimMapping {
    fn from(config: &OidcConfig) -> Self {
        Self {
            username_claim: config.username_claim.clone(),
            username_prefix: config.username_prefix.clone(),
            groups_claim: config.groups_claim.clone(),
            groups_prefix: config.groups_prefix.clone(),
            tenant_id_claim: config.tenant_id_claim.clone(),
        }
    }
}

impl ClaimMapping {
    /// Build an identity from verified claims. `None` when the username
    /// claim is absent or empty.
    #[must_use]
    pub fn map(&self, claims: &Map<String, Value>) -> Option<Identity> {
        let username = claims
            .get(&self.username_claim)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())?;

        let groups = match claims.get(&self.groups_claim) {
            Some(Value::String(group)) => vec![format!("{}{group}", self.groups_prefix)],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|group| format!("{}{group}", self.groups_prefix))
                .collect(),
            _ => Vec::new(),
        };

        let mut extra = BTreeMap::new();
        if let Some(tenant) = self.tenant_id(claims) {
            extra.insert(TENANT_ID_KEY.to_string(), vec![tenant]);
        }

        Some(Identity {
            name: format!("{}{username}", self.username_prefix),
            uid: claims
                .get("sub")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            groups,
            extra,
        })
    }

    // Dex puts the connector under `federated_claims.connector_id`
    fn tenant_id(&self, claims: &Map<String, Value>) -> Option<String> {
        match claims.get(&self.tenant_id_claim)? {
            Value::String(tenant) if !tenant.is_empty() => Some(tenant.clone()),
            Value::Object(obj) => obj
                .get("connector_id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn mapping() -> ClaimMapping {
        ClaimMapping::from(&OidcConfig::default())
    }

    fn claims(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn maps_default_claims() {
        // GIVEN: a dex style ID token payload
        let claims = claims(json!({
            "sub": "CgVhZG1pbhIFbG9jYWw",
            "name": "admin",
            "groups": ["system:masters", "dev"],
            "federated_claims": {"connector_id": "default", "user_id": "admin"}
        }));

        // WHEN: mapped with defaults
        let identity = mapping().map(&claims).unwrap();

        // THEN: every attribute is populated
        assert_eq!(identity.name, "admin");
        assert_eq!(identity.uid, "CgVhZG1pbhIFbG9jYWw");
        assert_eq!(identity.groups, vec!["system:masters", "dev"]);
        assert_eq!(identity.extra[TENANT_ID_KEY], vec!["default"]);
    }

    #[test]
    fn applies_prefixes_and_string_group() {
        let mut mapping = mapping();
        mapping.username_prefix = "oidc:".to_string();
        mapping.groups_prefix = "oidc:".to_string();
        let claims = claims(json!({"sub": "1", "name": "alice", "groups": "ops"}));

        let identity = mapping.map(&claims).unwrap();

        assert_eq!(identity.name, "oidc:alice");
        assert_eq!(identity.groups, vec!["oidc:ops"]);
        assert!(identity.extra.is_empty());
    }

    #[test]
    fn string_tenant_claim() {
        let mut mapping = mapping();
        mapping.tenant_id_claim = "tenant".to_string();
        let claims = claims(json!({"sub": "1", "name": "bob", "tenant": "t-1"}));
        let identity = mapping.map(&claims).unwrap();
        assert_eq!(identity.extra[TENANT_ID_KEY], vec!["t-1"]);
    }

    #[test]
    fn missing_username_is_unauthenticated() {
        let no_name = claims(json!({"sub": "1", "email": "a@b.c"}));
        assert!(mapping().map(&no_name).is_none());
        let empty_name = claims(json!({"sub": "1", "name": ""}));
        assert!(mapping().map(&empty_name).is_none());
    }

    #[test]
    fn identity_serializes_for_info_endpoint() {
        let identity = Identity {
            name: "admin".to_string(),
            uid: "42".to_string(),
            groups: vec![],
            extra: BTreeMap::new(),
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json, json!({"name": "admin", "uid": "42", "groups": [], "extra": {}}));
    }
}
