//! DDL synthesis.
//!
//! All schema-altering SQL in the system comes from this module. Creation is
//! additive only (`IF NOT EXISTS` throughout); there is no migration story
//! beyond adding new resources.
//!
//! Dependency order matters: parents before children (the composite foreign
//! key targets the parent's chain tuple), resources before the relations
//! that reference them. [`crate::engine::Backend`] sorts resources by path
//! length then lexicographic order and emits relation DDL in a second pass.

use kurbisio_core::ident;

use crate::spec::{RelationSpec, ResourceKind, ResourceSpec};

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

/// The CREATE TABLE and CREATE INDEX statements of one resource.
pub fn resource_ddl(spec: &ResourceSpec) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    columns.push(format!(
        "{} UUID PRIMARY KEY DEFAULT uuid_generate_v4()",
        quote(&spec.id_col())
    ));
    for parent in spec.parent_cols() {
        columns.push(format!("{} UUID NOT NULL", quote(&parent)));
    }
    columns.push("\"created_at\" TIMESTAMP NOT NULL DEFAULT now()".to_owned());
    columns.push("\"properties\" JSONB NOT NULL DEFAULT '{}'::jsonb".to_owned());
    for col in spec.string_cols() {
        columns.push(format!("{} VARCHAR NOT NULL", quote(&col)));
    }

    let mut constraints: Vec<String> = Vec::new();
    if spec.path.len() > 1 {
        // Composite foreign key onto the parent's chain tuple; deleting any
        // ancestor cascades down the whole subtree.
        let parent_path = &spec.path[..spec.path.len() - 1];
        let parent_table = ident::table_name(parent_path);
        let mut fk_cols = vec![ident::id_column(&parent_path[parent_path.len() - 1])];
        let mut ancestors: Vec<String> = parent_path[..parent_path.len() - 1]
            .iter()
            .map(|p| ident::id_column(p))
            .collect();
        ancestors.reverse();
        fk_cols.extend(ancestors);
        let fk_list = fk_cols.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        constraints.push(format!(
            "FOREIGN KEY ({fk_list}) REFERENCES {}.{} ({fk_list}) ON DELETE CASCADE",
            quote(&spec.schema),
            quote(&parent_table)
        ));
        // The chain tuple this table exposes to its own children.
        let chain = spec
            .chain_cols()
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        constraints.push(format!("UNIQUE ({chain})"));
    }
    if spec.kind == ResourceKind::Singleton {
        let parent = spec
            .parent_cols()
            .last()
            .cloned()
            .expect("singletons always have a parent");
        constraints.push(format!("UNIQUE ({})", quote(&parent)));
    }

    let mut body = columns;
    body.extend(constraints);
    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        spec.table,
        body.join(", ")
    )];

    for index in &spec.indices {
        let unique = if index.unique { "UNIQUE " } else { "" };
        statements.push(format!(
            "CREATE {unique}INDEX IF NOT EXISTS {} ON {} ({})",
            quote(&format!("{}_{}_idx", spec.table_name, index.name)),
            spec.table,
            quote(&index.name)
        ));
    }
    for col in &spec.searchable {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote(&format!("{}_{}_idx", spec.table_name, col)),
            spec.table,
            quote(col)
        ));
    }
    if spec.path.len() > 1 {
        // Listings are always scoped by the parent chain.
        let parents = spec
            .parent_cols()
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({parents})",
            quote(&format!("{}_parents_idx", spec.table_name)),
            spec.table
        ));
    }
    statements
}

/// The association-table DDL of one relation. Runs after all resource DDL.
pub fn relation_ddl(relation: &RelationSpec, schema: &str) -> Vec<String> {
    let resource_col = relation.resource_col();
    let origin_col = relation.origin_col();
    let resource_table = format!(
        "{}.{}",
        quote(schema),
        quote(&ident::table_name(&relation.resource_path))
    );
    let origin_table = format!(
        "{}.{}",
        quote(schema),
        quote(&ident::table_name(&relation.origin_path))
    );
    vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         {rc} UUID NOT NULL REFERENCES {resource_table} ({rc}) ON DELETE CASCADE, \
         {oc} UUID NOT NULL REFERENCES {origin_table} ({oc}) ON DELETE CASCADE, \
         PRIMARY KEY ({rc}, {oc}))",
        relation.table,
        rc = quote(&resource_col),
        oc = quote(&origin_col),
    )]
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
    fn top_level_table() {
        let ddl = resource_ddl(&spec("a"));
        assert_eq!(ddl.len(), 1);
        assert_eq!(
            ddl[0],
            "CREATE TABLE IF NOT EXISTS \"backend\".\"a\" (\
             \"a_id\" UUID PRIMARY KEY DEFAULT uuid_generate_v4(), \
             \"created_at\" TIMESTAMP NOT NULL DEFAULT now(), \
             \"properties\" JSONB NOT NULL DEFAULT '{}'::jsonb)"
        );
    }

    #[test]
    fn nested_table_carries_the_cascade() {
        let ddl = resource_ddl(&spec("b/c/d"));
        let table = &ddl[0];
        assert!(table.contains("\"b_id\" UUID NOT NULL"));
        assert!(table.contains("\"c_id\" UUID NOT NULL"));
        assert!(table.contains(
            "FOREIGN KEY (\"c_id\", \"b_id\") REFERENCES \"backend\".\"b_c\" (\"c_id\", \"b_id\") \
             ON DELETE CASCADE"
        ));
        assert!(table.contains("UNIQUE (\"d_id\", \"c_id\", \"b_id\")"));
        // Parent-scope index for listings.
        assert!(ddl.iter().any(|s| s.contains("b_c_d_parents_idx")));
    }

    #[test]
    fn unique_external_index() {
        let spec = ResourceSpec::from_collection(
            "backend",
            &CollectionConfig {
                resource: "a".to_owned(),
                external_unique_indices: vec!["external_id".to_owned()],
                ..CollectionConfig::default()
            },
        )
        .unwrap();
        let ddl = resource_ddl(&spec);
        assert!(ddl[0].contains("\"external_id\" VARCHAR NOT NULL"));
        assert!(ddl
            .iter()
            .any(|s| s.starts_with("CREATE UNIQUE INDEX IF NOT EXISTS \"a_external_id_idx\"")));
    }

    #[test]
    fn singleton_unique_parent() {
        let spec = ResourceSpec::from_singleton(
            "backend",
            &kurbisio_core::config::SingletonConfig {
                resource: "user/profile".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();
        let ddl = resource_ddl(&spec);
        assert!(ddl[0].contains("UNIQUE (\"user_id\")"));
    }

    #[test]
    fn relation_table_references_both_sides() {
        let relation = RelationSpec::new("backend", "a", "b", Vec::new(), &[]).unwrap();
        let ddl = relation_ddl(&relation, "backend");
        assert!(ddl[0].contains("\"a_id\" UUID NOT NULL REFERENCES \"backend\".\"a\" (\"a_id\") ON DELETE CASCADE"));
        assert!(ddl[0].contains("PRIMARY KEY (\"a_id\", \"b_id\")"));
    }
}
