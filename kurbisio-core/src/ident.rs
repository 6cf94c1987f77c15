//! Identifier algebra — pluralization, resource-path splitting and route
//! template construction.
//!
//! Everything in this module is pure and deterministic. Resource names are
//! singular (`"user"`, `"device"`); routes and table columns are derived
//! from them with the rules below and never stored in configuration.

/// Pluralize a singular resource name for use in URL paths.
///
/// The rules are applied in order, first match wins:
///
/// * `…ey` → `…eys` (`key` → `keys`)
/// * `…y` → `…ies` (`company` → `companies`)
/// * `…child` → `…children`
/// * `…lysis` → `…lyses` (`analysis` → `analyses`)
/// * `…s` → `…ses` (`bus` → `buses`)
/// * otherwise append `s`
pub fn plural(name: &str) -> String {
    if name.ends_with("ey") {
        format!("{name}s")
    } else if let Some(stem) = name.strip_suffix('y') {
        format!("{stem}ies")
    } else if name.ends_with("child") {
        format!("{name}ren")
    } else if let Some(stem) = name.strip_suffix("lysis") {
        format!("{stem}lyses")
    } else if name.ends_with('s') {
        format!("{name}es")
    } else {
        format!("{name}s")
    }
}

/// Split a slash-separated resource path into its segments, parents first,
/// leaf last. `"b/c/d"` → `["b", "c", "d"]`.
pub fn split(path: &str) -> Vec<String> {
    path.split('/').map(str::to_owned).collect()
}

/// The id column name for a resource segment: `user` → `user_id`.
pub fn id_column(segment: &str) -> String {
    format!("{segment}_id")
}

/// The id path-parameter template for a segment: `user` → `{user_id}`.
fn id_param(segment: &str) -> String {
    format!("{{{segment}_id}}")
}

/// The table name for a resource path: the underscore-joined path.
/// `"b/c/d"` → `"b_c_d"`. Joining on underscore keeps nested resources with
/// the same leaf name apart.
pub fn table_name(path: &[String]) -> String {
    path.join("_")
}

/// The collection route for a resource path:
/// `/plural(r1)/{r1_id}/…/plural(rN)`.
pub fn collection_route(path: &[String]) -> String {
    let mut route = String::new();
    for (i, segment) in path.iter().enumerate() {
        route.push('/');
        route.push_str(&plural(segment));
        if i + 1 < path.len() {
            route.push('/');
            route.push_str(&id_param(segment));
        }
    }
    route
}

/// The item route for a collection resource: the collection route with the
/// leaf id appended.
pub fn item_route(path: &[String]) -> String {
    let leaf = path.last().expect("resource path is never empty");
    format!("{}/{}", collection_route(path), id_param(leaf))
}

/// The route of a singleton resource: parents as in a collection route, the
/// leaf as a bare singular segment without an id.
/// `["user", "profile"]` → `/users/{user_id}/profile`.
pub fn singleton_route(path: &[String]) -> String {
    let mut route = String::new();
    let (leaf, parents) = path.split_last().expect("resource path is never empty");
    for segment in parents {
        route.push('/');
        route.push_str(&plural(segment));
        route.push('/');
        route.push_str(&id_param(segment));
    }
    route.push('/');
    route.push_str(leaf);
    route
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plural_rules() {
        assert_eq!(plural("key"), "keys");
        assert_eq!(plural("journey"), "journeys");
        assert_eq!(plural("company"), "companies");
        assert_eq!(plural("child"), "children");
        assert_eq!(plural("grandchild"), "grandchildren");
        assert_eq!(plural("analysis"), "analyses");
        assert_eq!(plural("bus"), "buses");
        assert_eq!(plural("device"), "devices");
        assert_eq!(plural("a"), "as");
    }

    #[test]
    fn split_keeps_order() {
        assert_eq!(split("b/c/d"), vec!["b", "c", "d"]);
        assert_eq!(split("user"), vec!["user"]);
    }

    #[test]
    fn collection_and_item_routes() {
        let path = split("b/c/d");
        assert_eq!(collection_route(&path), "/bs/{b_id}/cs/{c_id}/ds");
        assert_eq!(item_route(&path), "/bs/{b_id}/cs/{c_id}/ds/{d_id}");
    }

    #[test]
    fn top_level_routes() {
        let path = split("device");
        assert_eq!(collection_route(&path), "/devices");
        assert_eq!(item_route(&path), "/devices/{device_id}");
    }

    #[test]
    fn singleton_route_has_no_leaf_id() {
        let path = split("user/profile");
        assert_eq!(singleton_route(&path), "/users/{user_id}/profile");
    }

    #[test]
    fn table_names_join_the_path() {
        assert_eq!(table_name(&split("b/c/d")), "b_c_d");
        assert_eq!(table_name(&split("device")), "device");
    }
}
