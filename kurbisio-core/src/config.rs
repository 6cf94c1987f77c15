//! The declarative backend configuration.
//!
//! A [`BackendConfig`] is the single input the resource engine consumes: it
//! enumerates collections, singletons, relations between them and URL
//! shortcuts. The engine derives the relational schema, the SQL statement
//! family and the HTTP route graph from it; nothing else in the system issues
//! schema-altering SQL.

use serde::{Deserialize, Serialize};

use crate::capability::Permit;
use crate::ident;

/// A collection resource: zero or more rows per parent chain.
///
/// `resource` is a slash-separated path of singular names, parents first
/// (`"b/c/d"`). External indices become dedicated `VARCHAR` columns that can
/// be used as equality filters on collection listings; unique ones carry a
/// unique constraint. Extra properties are required static `VARCHAR` columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub resource: String,
    #[serde(default)]
    pub external_indices: Vec<String>,
    #[serde(default)]
    pub external_unique_indices: Vec<String>,
    #[serde(default)]
    pub searchable_properties: Vec<String>,
    #[serde(default)]
    pub extra_properties: Vec<String>,
    #[serde(default)]
    pub permits: Vec<Permit>,
    /// When set, the implicit admin allow-all rule does not apply to this
    /// resource; `admin` is evaluated like any other role.
    #[serde(default)]
    pub restrict_admin: bool,
}

/// A singleton resource: at most one row per immediate parent, enforced by a
/// unique constraint on the parent id and upsert write semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SingletonConfig {
    pub resource: String,
    #[serde(default)]
    pub extra_properties: Vec<String>,
    #[serde(default)]
    pub permits: Vec<Permit>,
    #[serde(default)]
    pub restrict_admin: bool,
}

/// A named many-to-many relation between two resources, realized as an
/// association table with cascading deletes to both sides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationConfig {
    /// The resource path the relation routes nest under.
    pub resource: String,
    /// The origin resource path the relation points at.
    pub origin: String,
    #[serde(default)]
    pub permits: Vec<Permit>,
}

/// A URL-path synonym substituted at dispatch time using a selector from the
/// caller's capability: `/user/…` → `/users/{user_id}/…`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortcutConfig {
    /// The bare prefix segment, e.g. `"user"`.
    pub shortcut: String,
    /// The target resource whose selector fills the id, e.g. `"user"`.
    pub resource: String,
}

/// The full declarative input of the resource engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
    #[serde(default)]
    pub singletons: Vec<SingletonConfig>,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
    #[serde(default)]
    pub shortcuts: Vec<ShortcutConfig>,
}

/// Configuration rejected before any DDL or route is generated.
#[derive(Debug)]
pub enum ConfigError {
    /// A resource path is empty or contains an empty segment.
    InvalidResourcePath(String),
    /// A column name is not a plain lowercase identifier.
    InvalidColumnName { resource: String, column: String },
    /// Two resources map to the same table.
    DuplicateResource(String),
    /// A relation references a resource path that is not configured.
    UnknownRelationEndpoint { relation: String, endpoint: String },
    /// A shortcut references a resource that is not configured.
    UnknownShortcutResource(String),
    /// The configuration document failed to parse.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidResourcePath(path) => {
                write!(f, "invalid resource path: {path:?}")
            }
            ConfigError::InvalidColumnName { resource, column } => {
                write!(f, "invalid column name {column:?} on resource {resource:?}")
            }
            ConfigError::DuplicateResource(path) => {
                write!(f, "duplicate resource: {path:?}")
            }
            ConfigError::UnknownRelationEndpoint { relation, endpoint } => {
                write!(f, "relation {relation:?} references unknown resource {endpoint:?}")
            }
            ConfigError::UnknownShortcutResource(resource) => {
                write!(f, "shortcut references unknown resource {resource:?}")
            }
            ConfigError::Parse(msg) => write!(f, "configuration parse error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn validate_path(path: &str) -> Result<Vec<String>, ConfigError> {
    let segments = ident::split(path);
    if segments.iter().any(|s| !valid_segment(s)) {
        return Err(ConfigError::InvalidResourcePath(path.to_owned()));
    }
    Ok(segments)
}

impl BackendConfig {
    /// Parse a configuration document from JSON.
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        let config: BackendConfig =
            serde_json::from_str(doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate paths, column names and cross-references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();

        let mut check_columns =
            |resource: &str, columns: &[Vec<String>]| -> Result<(), ConfigError> {
                for group in columns {
                    for column in group {
                        if !valid_segment(column) {
                            return Err(ConfigError::InvalidColumnName {
                                resource: resource.to_owned(),
                                column: column.clone(),
                            });
                        }
                    }
                }
                Ok(())
            };

        for c in &self.collections {
            let segments = validate_path(&c.resource)?;
            if !seen.insert(ident::table_name(&segments)) {
                return Err(ConfigError::DuplicateResource(c.resource.clone()));
            }
            check_columns(
                &c.resource,
                &[
                    c.external_indices.clone(),
                    c.external_unique_indices.clone(),
                    c.searchable_properties.clone(),
                    c.extra_properties.clone(),
                ],
            )?;
        }
        for s in &self.singletons {
            let segments = validate_path(&s.resource)?;
            if !seen.insert(ident::table_name(&segments)) {
                return Err(ConfigError::DuplicateResource(s.resource.clone()));
            }
            check_columns(&s.resource, &[s.extra_properties.clone()])?;
        }
        for r in &self.relations {
            for endpoint in [&r.resource, &r.origin] {
                let segments = validate_path(endpoint)?;
                if !seen.contains(&ident::table_name(&segments)) {
                    return Err(ConfigError::UnknownRelationEndpoint {
                        relation: format!("{}<->{}", r.resource, r.origin),
                        endpoint: endpoint.clone(),
                    });
                }
            }
        }
        for s in &self.shortcuts {
            let segments = validate_path(&s.resource)?;
            if !seen.contains(&ident::table_name(&segments)) {
                return Err(ConfigError::UnknownShortcutResource(s.resource.clone()));
            }
        }
        Ok(())
    }

    /// Look up a collection by resource path.
    pub fn collection(&self, resource: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.resource == resource)
    }

    /// Ensure the built-in `device` collection needed by the credential
    /// service and the device twin exists, injecting it when absent.
    ///
    /// The device row carries the `thing` identity (unique), the
    /// provisioning `status` (`waiting` or `provisioned`) and the device
    /// bearer `token`.
    pub fn ensure_device_collection(&mut self) {
        if self.collection("device").is_none() {
            self.collections.push(CollectionConfig {
                resource: "device".to_owned(),
                external_unique_indices: vec!["thing".to_owned()],
                external_indices: vec!["token".to_owned()],
                extra_properties: vec!["status".to_owned()],
                ..CollectionConfig::default()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_document() {
        let config = BackendConfig::from_json(
            r#"{
                "collections": [
                    {"resource": "a", "external_indices": ["external_id"], "extra_properties": ["extra_prop"]},
                    {"resource": "b"},
                    {"resource": "b/c"}
                ],
                "singletons": [
                    {"resource": "b/settings"}
                ],
                "relations": [
                    {"resource": "a", "origin": "b"}
                ],
                "shortcuts": [
                    {"shortcut": "b", "resource": "b"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.collections.len(), 3);
        assert_eq!(config.singletons.len(), 1);
        assert_eq!(config.collections[0].external_indices, vec!["external_id"]);
    }

    #[test]
    fn rejects_empty_segments() {
        let err = BackendConfig::from_json(r#"{"collections": [{"resource": "a//b"}]}"#);
        assert!(matches!(err, Err(ConfigError::InvalidResourcePath(_))));
    }

    #[test]
    fn rejects_duplicate_resources() {
        let err = BackendConfig::from_json(
            r#"{"collections": [{"resource": "a"}, {"resource": "a"}]}"#,
        );
        assert!(matches!(err, Err(ConfigError::DuplicateResource(_))));
    }

    #[test]
    fn rejects_relations_to_unknown_resources() {
        let err = BackendConfig::from_json(
            r#"{"collections": [{"resource": "a"}], "relations": [{"resource": "a", "origin": "x"}]}"#,
        );
        assert!(matches!(err, Err(ConfigError::UnknownRelationEndpoint { .. })));
    }

    #[test]
    fn injects_the_device_collection_once() {
        let mut config = BackendConfig::default();
        config.ensure_device_collection();
        config.ensure_device_collection();
        assert_eq!(config.collections.len(), 1);
        let device = config.collection("device").unwrap();
        assert!(device.external_unique_indices.contains(&"thing".to_owned()));
        assert!(device.extra_properties.contains(&"status".to_owned()));
    }

    #[test]
    fn permits_deserialize_with_operations() {
        let config = BackendConfig::from_json(
            r#"{"collections": [{
                "resource": "a",
                "permits": [{"role": "userrole", "operations": ["read", "list"], "selectors": ["user"]}]
            }]}"#,
        )
        .unwrap();
        let permits = &config.collections[0].permits;
        assert_eq!(permits.len(), 1);
        assert_eq!(
            permits[0].operations,
            vec![crate::Operation::Read, crate::Operation::List]
        );
    }
}
