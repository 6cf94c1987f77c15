//! Resource specifications: the compiled form of the configuration.
//!
//! [`ResourceSpec`] is what the engine works with at request time: the
//! split path, the derived table and column names, the routes and the
//! pre-built SQL statement family. Specs are compiled once at startup,
//! wrapped in `Arc` and captured by the generated handlers.
//!
//! Parameter numbering convention, used consistently by every statement:
//! parent ids come first in path order (`$1 = b_id, $2 = c_id, …`), the
//! leaf id follows, and statement-specific values come last.

use kurbisio_core::config::{CollectionConfig, SingletonConfig};
use kurbisio_core::{ident, ConfigError, Permit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Collection,
    Singleton,
}

/// An external index column: a dedicated string column usable as an
/// equality filter on listings, optionally unique across the table.
#[derive(Debug, Clone)]
pub struct IndexColumn {
    pub name: String,
    pub unique: bool,
}

/// The pre-built statement family of one resource.
#[derive(Debug, Clone)]
pub struct Statements {
    /// `SELECT <cols> FROM <table>`; listings compose their WHERE clause
    /// onto this at request time (filter, cursor, limit).
    pub select_from: String,
    /// Single-row read by the full id tuple (parents, then the leaf for
    /// collections; parents only for singletons).
    pub read_one: String,
    /// Insert with explicit leaf id, returning the leaf id.
    pub insert: String,
    /// Insert-or-update. Collections conflict on the leaf id; singletons
    /// conflict on the immediate parent id, which is what makes "at most
    /// one row per parent" hold under concurrent writes.
    pub upsert: String,
    /// Full update by id tuple.
    pub update: String,
    /// Delete by id tuple.
    pub delete: String,
    /// Delete everything in the parent scope (the `clear` operation).
    pub clear: String,
    /// Existence probe for the immediate parent row; `None` for top-level
    /// resources.
    pub parent_check: Option<String>,
}

/// The compiled form of one configured resource.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    /// The configured path, e.g. `"b/c/d"`.
    pub resource: String,
    /// Split path segments, parents first.
    pub path: Vec<String>,
    pub kind: ResourceKind,
    /// The schema every table lives in.
    pub schema: String,
    /// Schema-qualified, quoted table reference.
    pub table: String,
    /// Bare table name (used for constraint naming).
    pub table_name: String,
    pub indices: Vec<IndexColumn>,
    pub searchable: Vec<String>,
    pub static_props: Vec<String>,
    pub permits: Vec<Permit>,
    pub restrict_admin: bool,
    pub statements: Statements,
    pub collection_route: String,
    pub item_route: String,
}

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

impl ResourceSpec {
    pub fn leaf(&self) -> &str {
        self.path.last().expect("resource path is never empty")
    }

    /// The leaf id column, `d_id`.
    pub fn id_col(&self) -> String {
        ident::id_column(self.leaf())
    }

    /// Parent id columns in path order, `[b_id, c_id]`.
    pub fn parent_cols(&self) -> Vec<String> {
        self.path[..self.path.len() - 1]
            .iter()
            .map(|p| ident::id_column(p))
            .collect()
    }

    /// The id tuple identifying one row: parents in path order, then the
    /// leaf (collections only; a singleton row is identified by its
    /// parents).
    pub fn key_cols(&self) -> Vec<String> {
        let mut cols = self.parent_cols();
        if self.kind == ResourceKind::Collection {
            cols.push(self.id_col());
        }
        cols
    }

    /// All string-valued columns: external indices, searchable properties,
    /// extra static properties. Every one of them is `VARCHAR NOT NULL` and
    /// required in write bodies.
    pub fn string_cols(&self) -> Vec<String> {
        self.indices
            .iter()
            .map(|i| i.name.clone())
            .chain(self.searchable.iter().cloned())
            .chain(self.static_props.iter().cloned())
            .collect()
    }

    /// Columns a listing may filter on by equality.
    pub fn filterable_cols(&self) -> Vec<String> {
        self.indices
            .iter()
            .map(|i| i.name.clone())
            .chain(self.searchable.iter().cloned())
            .collect()
    }

    /// The full select list in table order.
    pub fn select_cols(&self) -> Vec<String> {
        let mut cols = vec![self.id_col()];
        cols.extend(self.parent_cols());
        cols.push("created_at".to_owned());
        cols.push("properties".to_owned());
        cols.extend(self.string_cols());
        cols
    }

    /// The WHERE clause of the key tuple, `$1..$N` in [`key_cols`] order.
    /// Statement-family statements embed it already; request-time composed
    /// statements (compact property update) reuse it.
    ///
    /// [`key_cols`]: ResourceSpec::key_cols
    pub fn key_where(&self) -> String {
        self.key_cols()
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", quote(c), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// The chain tuple `(leaf_id, parents reversed)`: the unique key child
    /// tables reference with their composite foreign key.
    pub fn chain_cols(&self) -> Vec<String> {
        let mut cols = vec![self.id_col()];
        let mut parents = self.parent_cols();
        parents.reverse();
        cols.extend(parents);
        cols
    }
}

fn build_statements(
    schema: &str,
    path: &[String],
    kind: ResourceKind,
    string_cols: &[String],
) -> Statements {
    let table_name = ident::table_name(path);
    let table = format!("{}.{}", quote(schema), quote(&table_name));
    let leaf_col = ident::id_column(path.last().expect("non-empty path"));
    let parent_cols: Vec<String> = path[..path.len() - 1]
        .iter()
        .map(|p| ident::id_column(p))
        .collect();

    let mut select_cols = vec![leaf_col.clone()];
    select_cols.extend(parent_cols.iter().cloned());
    select_cols.push("created_at".to_owned());
    select_cols.push("properties".to_owned());
    select_cols.extend(string_cols.iter().cloned());
    let select_list = select_cols
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let select_from = format!("SELECT {select_list} FROM {table}");

    // Key tuple: parents in path order, leaf last (collections only).
    let mut key_cols = parent_cols.clone();
    if kind == ResourceKind::Collection {
        key_cols.push(leaf_col.clone());
    }
    let key_where = key_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");

    let read_one = if key_cols.is_empty() {
        select_from.clone()
    } else {
        format!("{select_from} WHERE {key_where}")
    };

    // Insert: leaf id, parents, properties, strings.
    let mut insert_cols = vec![leaf_col.clone()];
    insert_cols.extend(parent_cols.iter().cloned());
    insert_cols.push("properties".to_owned());
    insert_cols.extend(string_cols.iter().cloned());
    let placeholders = (1..=insert_cols.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_list = insert_cols
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let insert = format!(
        "INSERT INTO {table} ({insert_list}) VALUES ({placeholders}) RETURNING {}",
        quote(&leaf_col)
    );

    // Upsert: conflict target depends on the kind.
    let conflict_col = match kind {
        ResourceKind::Collection => leaf_col.clone(),
        ResourceKind::Singleton => parent_cols
            .last()
            .cloned()
            .expect("singletons always have a parent"),
    };
    let mut updates = vec!["properties = EXCLUDED.properties".to_owned()];
    updates.extend(
        string_cols
            .iter()
            .map(|c| format!("{} = EXCLUDED.{}", quote(c), quote(c))),
    );
    let upsert = format!(
        "INSERT INTO {table} ({insert_list}) VALUES ({placeholders}) \
         ON CONFLICT ({}) DO UPDATE SET {} RETURNING {}",
        quote(&conflict_col),
        updates.join(", "),
        quote(&leaf_col)
    );

    // Update by key tuple; values follow the key parameters.
    let mut set_clauses = Vec::new();
    let mut param = key_cols.len() + 1;
    set_clauses.push(format!("properties = ${param}"));
    param += 1;
    for col in string_cols {
        set_clauses.push(format!("{} = ${param}", quote(col)));
        param += 1;
    }
    let update = if key_where.is_empty() {
        format!("UPDATE {table} SET {}", set_clauses.join(", "))
    } else {
        format!("UPDATE {table} SET {} WHERE {key_where}", set_clauses.join(", "))
    };

    let delete = if key_where.is_empty() {
        format!("DELETE FROM {table}")
    } else {
        format!("DELETE FROM {table} WHERE {key_where}")
    };

    let parent_where = parent_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let clear = if parent_where.is_empty() {
        format!("DELETE FROM {table}")
    } else {
        format!("DELETE FROM {table} WHERE {parent_where}")
    };

    let parent_check = if path.len() > 1 {
        let parent_table = ident::table_name(&path[..path.len() - 1]);
        Some(format!(
            "SELECT 1 FROM {}.{} WHERE {parent_where}",
            quote(schema),
            quote(&parent_table)
        ))
    } else {
        None
    };

    Statements {
        select_from,
        read_one,
        insert,
        upsert,
        update,
        delete,
        clear,
        parent_check,
    }
}

fn compile(
    schema: &str,
    resource: &str,
    kind: ResourceKind,
    indices: Vec<IndexColumn>,
    searchable: Vec<String>,
    static_props: Vec<String>,
    permits: Vec<Permit>,
    restrict_admin: bool,
) -> Result<ResourceSpec, ConfigError> {
    let path = ident::split(resource);
    if kind == ResourceKind::Singleton && path.len() < 2 {
        // A singleton is keyed by its parent; a top-level one has none.
        return Err(ConfigError::InvalidResourcePath(resource.to_owned()));
    }
    let string_cols: Vec<String> = indices
        .iter()
        .map(|i| i.name.clone())
        .chain(searchable.iter().cloned())
        .chain(static_props.iter().cloned())
        .collect();
    let statements = build_statements(schema, &path, kind, &string_cols);
    let table_name = ident::table_name(&path);
    let (collection_route, item_route) = match kind {
        ResourceKind::Collection => (ident::collection_route(&path), ident::item_route(&path)),
        ResourceKind::Singleton => {
            let route = ident::singleton_route(&path);
            (route.clone(), route)
        }
    };
    Ok(ResourceSpec {
        resource: resource.to_owned(),
        path,
        kind,
        schema: schema.to_owned(),
        table: format!("{}.{}", quote(schema), quote(&table_name)),
        table_name,
        indices,
        searchable,
        static_props,
        permits,
        restrict_admin,
        statements,
        collection_route,
        item_route,
    })
}

impl ResourceSpec {
    pub fn from_collection(schema: &str, config: &CollectionConfig) -> Result<Self, ConfigError> {
        let indices = config
            .external_unique_indices
            .iter()
            .map(|name| IndexColumn {
                name: name.clone(),
                unique: true,
            })
            .chain(config.external_indices.iter().map(|name| IndexColumn {
                name: name.clone(),
                unique: false,
            }))
            .collect();
        compile(
            schema,
            &config.resource,
            ResourceKind::Collection,
            indices,
            config.searchable_properties.clone(),
            config.extra_properties.clone(),
            config.permits.clone(),
            config.restrict_admin,
        )
    }

    pub fn from_singleton(schema: &str, config: &SingletonConfig) -> Result<Self, ConfigError> {
        compile(
            schema,
            &config.resource,
            ResourceKind::Singleton,
            Vec::new(),
            Vec::new(),
            config.extra_properties.clone(),
            config.permits.clone(),
            config.restrict_admin,
        )
    }
}

/// The compiled form of a relation: the association table and its statement
/// family, nested under the resource side's item route.
#[derive(Debug, Clone)]
pub struct RelationSpec {
    pub resource_path: Vec<String>,
    pub origin_path: Vec<String>,
    pub table: String,
    pub table_name: String,
    pub permits: Vec<Permit>,
    /// Origin rows associated with one resource row.
    pub list: String,
    /// One associated origin row.
    pub read_one: String,
    /// Create the association (idempotent).
    pub attach: String,
    /// Remove the association.
    pub detach: String,
    pub list_route: String,
    pub item_route: String,
}

impl RelationSpec {
    pub fn new(
        schema: &str,
        resource: &str,
        origin: &str,
        permits: Vec<Permit>,
        origin_string_cols: &[String],
    ) -> Result<Self, ConfigError> {
        let resource_path = ident::split(resource);
        let origin_path = ident::split(origin);
        let resource_leaf = resource_path.last().expect("non-empty path");
        let origin_leaf = origin_path.last().expect("non-empty path");
        if resource_leaf == origin_leaf {
            return Err(ConfigError::InvalidResourcePath(format!(
                "{resource} <-> {origin}"
            )));
        }

        let table_name = format!("{resource_leaf}_{origin_leaf}");
        let table = format!("{}.{}", quote(schema), quote(&table_name));
        let resource_col = ident::id_column(resource_leaf);
        let origin_col = ident::id_column(origin_leaf);
        let origin_table = format!(
            "{}.{}",
            quote(schema),
            quote(&ident::table_name(&origin_path))
        );

        let mut origin_cols = vec![origin_col.clone()];
        origin_cols.extend(
            origin_path[..origin_path.len() - 1]
                .iter()
                .map(|p| ident::id_column(p)),
        );
        origin_cols.push("created_at".to_owned());
        origin_cols.push("properties".to_owned());
        origin_cols.extend(origin_string_cols.iter().cloned());
        let origin_select = origin_cols
            .iter()
            .map(|c| format!("o.{}", quote(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let join = format!(
            "FROM {origin_table} o JOIN {table} r ON r.{oc} = o.{oc}",
            oc = quote(&origin_col)
        );
        let list = format!(
            "SELECT {origin_select} {join} WHERE r.{} = $1 \
             ORDER BY o.\"created_at\", o.{}",
            quote(&resource_col),
            quote(&origin_col)
        );
        let read_one = format!(
            "SELECT {origin_select} {join} WHERE r.{} = $1 AND r.{} = $2",
            quote(&resource_col),
            quote(&origin_col)
        );
        let attach = format!(
            "INSERT INTO {table} ({}, {}) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            quote(&resource_col),
            quote(&origin_col)
        );
        let detach = format!(
            "DELETE FROM {table} WHERE {} = $1 AND {} = $2",
            quote(&resource_col),
            quote(&origin_col)
        );

        let item = ident::item_route(&resource_path);
        let list_route = format!("{item}/{}", ident::plural(origin_leaf));
        let item_route = format!("{list_route}/{{{origin_col}}}");

        Ok(Self {
            resource_path,
            origin_path,
            table,
            table_name,
            permits,
            list,
            read_one,
            attach,
            detach,
            list_route,
            item_route,
        })
    }

    pub fn resource_col(&self) -> String {
        ident::id_column(self.resource_path.last().expect("non-empty path"))
    }

    pub fn origin_col(&self) -> String {
        ident::id_column(self.origin_path.last().expect("non-empty path"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbisio_core::config::CollectionConfig;

    fn spec(resource: &str) -> ResourceSpec {
        ResourceSpec::from_collection(
            "backend",
            &CollectionConfig {
                resource: resource.to_owned(),
                ..CollectionConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn nested_statement_family() {
        let s = spec("b/c/d");
        assert_eq!(
            s.statements.read_one,
            "SELECT \"d_id\", \"b_id\", \"c_id\", \"created_at\", \"properties\" \
             FROM \"backend\".\"b_c_d\" WHERE \"b_id\" = $1 AND \"c_id\" = $2 AND \"d_id\" = $3"
        );
        assert_eq!(
            s.statements.insert,
            "INSERT INTO \"backend\".\"b_c_d\" (\"d_id\", \"b_id\", \"c_id\", \"properties\") \
             VALUES ($1, $2, $3, $4) RETURNING \"d_id\""
        );
        assert_eq!(
            s.statements.delete,
            "DELETE FROM \"backend\".\"b_c_d\" WHERE \"b_id\" = $1 AND \"c_id\" = $2 AND \"d_id\" = $3"
        );
        assert_eq!(
            s.statements.clear,
            "DELETE FROM \"backend\".\"b_c_d\" WHERE \"b_id\" = $1 AND \"c_id\" = $2"
        );
        assert_eq!(
            s.statements.parent_check.as_deref(),
            Some("SELECT 1 FROM \"backend\".\"b_c\" WHERE \"b_id\" = $1 AND \"c_id\" = $2")
        );
    }

    #[test]
    fn external_indices_become_columns() {
        let s = ResourceSpec::from_collection(
            "backend",
            &CollectionConfig {
                resource: "a".to_owned(),
                external_unique_indices: vec!["external_id".to_owned()],
                extra_properties: vec!["extra_prop".to_owned()],
                ..CollectionConfig::default()
            },
        )
        .unwrap();
        assert_eq!(
            s.statements.insert,
            "INSERT INTO \"backend\".\"a\" (\"a_id\", \"properties\", \"external_id\", \"extra_prop\") \
             VALUES ($1, $2, $3, $4) RETURNING \"a_id\""
        );
        assert!(s
            .statements
            .upsert
            .contains("ON CONFLICT (\"a_id\") DO UPDATE SET properties = EXCLUDED.properties, \
                       \"external_id\" = EXCLUDED.\"external_id\", \"extra_prop\" = EXCLUDED.\"extra_prop\""));
        assert_eq!(s.filterable_cols(), vec!["external_id"]);
    }

    #[test]
    fn singleton_upserts_on_the_parent_id() {
        let s = ResourceSpec::from_singleton(
            "backend",
            &kurbisio_core::config::SingletonConfig {
                resource: "user/profile".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(s.statements.upsert.contains("ON CONFLICT (\"user_id\")"));
        assert_eq!(
            s.statements.read_one,
            "SELECT \"profile_id\", \"user_id\", \"created_at\", \"properties\" \
             FROM \"backend\".\"user_profile\" WHERE \"user_id\" = $1"
        );
        assert_eq!(s.collection_route, "/users/{user_id}/profile");
    }

    #[test]
    fn top_level_singletons_are_rejected() {
        let err = ResourceSpec::from_singleton(
            "backend",
            &kurbisio_core::config::SingletonConfig {
                resource: "settings".to_owned(),
                ..Default::default()
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn relation_statements_join_the_origin() {
        let r = RelationSpec::new("backend", "a", "b", Vec::new(), &[]).unwrap();
        assert_eq!(r.table_name, "a_b");
        assert_eq!(r.list_route, "/as/{a_id}/bs");
        assert_eq!(r.item_route, "/as/{a_id}/bs/{b_id}");
        assert!(r.list.contains("JOIN \"backend\".\"a_b\" r"));
        assert!(r.attach.contains("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn self_relations_are_rejected() {
        assert!(RelationSpec::new("backend", "a", "a", Vec::new(), &[]).is_err());
    }
}
