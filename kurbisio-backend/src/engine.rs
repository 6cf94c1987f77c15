//! The resource engine.
//!
//! [`Backend`] compiles the declarative configuration into resource
//! specifications, owns all DDL, and registers the generated route graph on
//! an axum router. Handlers are closures over `Arc<ResourceSpec>` plus the
//! shared [`BackendState`]; nothing is resolved dynamically at request time
//! beyond the statement composition listings need.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::MethodRouter;
use axum::Router;
use tracing::info;

use kurbisio_access::Auth;
use kurbisio_core::{BackendConfig, ConfigError, Publisher};
use kurbisio_db::{DbError, Driver, TwinStore};

use crate::credentials::CredentialService;
use crate::ddl;
use crate::handlers;
use crate::row::IdPolicy;
use crate::spec::{RelationSpec, ResourceKind, ResourceSpec};
use crate::twin::{self, TwinSide};
use crate::{credentials, pipeline};

/// Shared state of every generated handler.
#[derive(Clone)]
pub struct BackendState {
    pub driver: Arc<Driver>,
    pub twin: TwinStore,
    pub publisher: Arc<dyn Publisher>,
    /// When false, permit evaluation is skipped entirely.
    pub enforce: bool,
    pub credentials: Option<Arc<CredentialService>>,
}

type RouteMap = BTreeMap<String, MethodRouter<BackendState>>;

fn with_route(
    routes: &mut RouteMap,
    path: &str,
    f: impl FnOnce(MethodRouter<BackendState>) -> MethodRouter<BackendState>,
) {
    let router = routes.remove(path).unwrap_or_default();
    routes.insert(path.to_owned(), f(router));
}

/// The compiled engine.
pub struct Backend {
    driver: Arc<Driver>,
    resources: Vec<Arc<ResourceSpec>>,
    relations: Vec<Arc<RelationSpec>>,
}

impl Backend {
    /// Compile the configuration. Resources are ordered for DDL: parents
    /// before children (path length, then lexicographic).
    pub fn new(driver: Arc<Driver>, config: &BackendConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let schema = driver.schema().to_owned();

        let mut resources: Vec<Arc<ResourceSpec>> = Vec::new();
        for collection in &config.collections {
            resources.push(Arc::new(ResourceSpec::from_collection(&schema, collection)?));
        }
        for singleton in &config.singletons {
            resources.push(Arc::new(ResourceSpec::from_singleton(&schema, singleton)?));
        }
        resources.sort_by(|a, b| {
            a.path
                .len()
                .cmp(&b.path.len())
                .then_with(|| a.resource.cmp(&b.resource))
        });

        let mut relations = Vec::new();
        for relation in &config.relations {
            let origin = resources
                .iter()
                .find(|s| s.resource == relation.origin)
                .ok_or_else(|| ConfigError::UnknownRelationEndpoint {
                    relation: format!("{}<->{}", relation.resource, relation.origin),
                    endpoint: relation.origin.clone(),
                })?;
            relations.push(Arc::new(RelationSpec::new(
                &schema,
                &relation.resource,
                &relation.origin,
                relation.permits.clone(),
                &origin.string_cols(),
            )?));
        }

        info!(
            resources = resources.len(),
            relations = relations.len(),
            "backend compiled"
        );
        Ok(Self {
            driver,
            resources,
            relations,
        })
    }

    pub fn resources(&self) -> &[Arc<ResourceSpec>] {
        &self.resources
    }

    pub fn relations(&self) -> &[Arc<RelationSpec>] {
        &self.relations
    }

    fn has_device_collection(&self) -> bool {
        self.resources.iter().any(|s| s.resource == "device")
    }

    /// Create the schema namespace, auxiliary tables and every resource
    /// table in dependency order, relations in a second pass. Additive and
    /// idempotent.
    pub async fn create_schema(&self) -> Result<(), DbError> {
        self.driver.bootstrap().await?;
        for spec in &self.resources {
            for sql in ddl::resource_ddl(spec) {
                self.driver.execute(&sql, &[]).await?;
            }
        }
        for relation in &self.relations {
            for sql in ddl::relation_ddl(relation, self.driver.schema()) {
                self.driver.execute(&sql, &[]).await?;
            }
        }
        Ok(())
    }

    /// Build the route graph. The returned router still needs the pipeline
    /// middleware ([`pipeline::apply`]) around it.
    pub fn router(&self, state: BackendState) -> Router {
        let mut routes = RouteMap::new();

        for spec in &self.resources {
            match spec.kind {
                ResourceKind::Collection => register_collection(&mut routes, spec),
                ResourceKind::Singleton => register_singleton(&mut routes, spec),
            }
        }
        for relation in &self.relations {
            register_relation(&mut routes, relation);
        }
        if self.has_device_collection() {
            register_twin(&mut routes);
        }
        if state.credentials.is_some() {
            with_route(&mut routes, "/credentials", |mr| {
                mr.get(
                    |State(state): State<BackendState>, Auth(cap): Auth| async move {
                        credentials::download(state, cap).await
                    },
                )
            });
        }
        with_route(&mut routes, "/version", |mr| {
            mr.get(|| async { pipeline::version().await })
        });

        let mut router: Router<BackendState> = Router::new();
        for (path, method_router) in routes {
            router = router.route(&path, method_router);
        }
        router.with_state(state)
    }
}

fn register_collection(routes: &mut RouteMap, spec: &Arc<ResourceSpec>) {
    let collection = spec.collection_route.clone();
    let item = spec.item_route.clone();

    with_route(routes, &collection, |mr| {
        let list_spec = spec.clone();
        let create_spec = spec.clone();
        let put_spec = spec.clone();
        let clear_spec = spec.clone();
        mr.get(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Query(query): Query<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let spec = list_spec.clone();
                async move { handlers::list(state, spec, params, query, cap).await }
            },
        )
        .post(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth,
                  body: Bytes| {
                let spec = create_spec.clone();
                async move { handlers::create(state, spec, params, cap, body).await }
            },
        )
        .put(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth,
                  body: Bytes| {
                let spec = put_spec.clone();
                async move {
                    handlers::put(state, spec, params, cap, body, IdPolicy::RequireBody).await
                }
            },
        )
        .delete(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let spec = clear_spec.clone();
                async move { handlers::clear(state, spec, params, cap).await }
            },
        )
    });

    with_route(routes, &item, |mr| {
        let read_spec = spec.clone();
        let put_spec = spec.clone();
        let patch_spec = spec.clone();
        let delete_spec = spec.clone();
        mr.get(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let spec = read_spec.clone();
                async move { handlers::read(state, spec, params, cap).await }
            },
        )
        .put(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth,
                  body: Bytes| {
                let spec = put_spec.clone();
                async move {
                    let id = crate::row::parse_id(&params, &spec.id_col())?;
                    handlers::put(state, spec, params, cap, body, IdPolicy::FromPath(id)).await
                }
            },
        )
        .patch(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth,
                  body: Bytes| {
                let spec = patch_spec.clone();
                async move { handlers::patch(state, spec, params, cap, body).await }
            },
        )
        .delete(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let spec = delete_spec.clone();
                async move { handlers::delete(state, spec, params, cap).await }
            },
        )
    });

    // Compact single-property update, one route per static property.
    for column in &spec.static_props {
        let path = format!("{item}/{column}/{{value}}");
        with_route(routes, &path, |mr| {
            let spec = spec.clone();
            let column = column.clone();
            mr.put(
                move |State(state): State<BackendState>,
                      Path(params): Path<HashMap<String, String>>,
                      Auth(cap): Auth| {
                    let spec = spec.clone();
                    let column = column.clone();
                    async move {
                        handlers::put_property(state, spec, params, cap, column).await
                    }
                },
            )
        });
    }
}

fn register_singleton(routes: &mut RouteMap, spec: &Arc<ResourceSpec>) {
    let route = spec.item_route.clone();
    with_route(routes, &route, |mr| {
        let read_spec = spec.clone();
        let put_spec = spec.clone();
        let patch_spec = spec.clone();
        let delete_spec = spec.clone();
        mr.get(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let spec = read_spec.clone();
                async move { handlers::read(state, spec, params, cap).await }
            },
        )
        .put(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth,
                  body: Bytes| {
                let spec = put_spec.clone();
                async move {
                    handlers::put(state, spec, params, cap, body, IdPolicy::Generate).await
                }
            },
        )
        .patch(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth,
                  body: Bytes| {
                let spec = patch_spec.clone();
                async move { handlers::patch(state, spec, params, cap, body).await }
            },
        )
        .delete(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let spec = delete_spec.clone();
                async move { handlers::delete(state, spec, params, cap).await }
            },
        )
    });
}

fn register_relation(routes: &mut RouteMap, relation: &Arc<RelationSpec>) {
    let list_route = relation.list_route.clone();
    let item_route = relation.item_route.clone();
    with_route(routes, &list_route, |mr| {
        let relation = relation.clone();
        mr.get(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let relation = relation.clone();
                async move { handlers::relation_list(state, relation, params, cap).await }
            },
        )
    });
    with_route(routes, &item_route, |mr| {
        let read_relation = relation.clone();
        let attach_relation = relation.clone();
        let detach_relation = relation.clone();
        mr.get(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let relation = read_relation.clone();
                async move { handlers::relation_read(state, relation, params, cap).await }
            },
        )
        .put(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let relation = attach_relation.clone();
                async move { handlers::relation_attach(state, relation, params, cap).await }
            },
        )
        .delete(
            move |State(state): State<BackendState>,
                  Path(params): Path<HashMap<String, String>>,
                  Auth(cap): Auth| {
                let relation = detach_relation.clone();
                async move { handlers::relation_detach(state, relation, params, cap).await }
            },
        )
    });
}

fn register_twin(routes: &mut RouteMap) {
    with_route(routes, "/devices/{device_id}/twin", |mr| {
        mr.get(
            |State(state): State<BackendState>,
             Path(params): Path<HashMap<String, String>>,
             Auth(cap): Auth| async move { twin::list(state, params, cap).await },
        )
    });
    with_route(routes, "/devices/{device_id}/twin/{key}", |mr| {
        mr.get(
            |State(state): State<BackendState>,
             Path(params): Path<HashMap<String, String>>,
             Auth(cap): Auth| async move { twin::get(state, params, cap).await },
        )
    });
    with_route(routes, "/devices/{device_id}/twin/{key}/request", |mr| {
        mr.get(
            |State(state): State<BackendState>,
             Path(params): Path<HashMap<String, String>>,
             Auth(cap): Auth| async move {
                twin::get_fragment(state, params, cap, TwinSide::Request).await
            },
        )
        .put(
            |State(state): State<BackendState>,
             Path(params): Path<HashMap<String, String>>,
             Auth(cap): Auth,
             body: Bytes| async move { twin::put_request(state, params, cap, body).await },
        )
    });
    with_route(routes, "/devices/{device_id}/twin/{key}/report", |mr| {
        mr.get(
            |State(state): State<BackendState>,
             Path(params): Path<HashMap<String, String>>,
             Auth(cap): Auth| async move {
                twin::get_fragment(state, params, cap, TwinSide::Report).await
            },
        )
        .put(
            |State(state): State<BackendState>,
             Path(params): Path<HashMap<String, String>>,
             Auth(cap): Auth,
             body: Bytes| async move { twin::put_report(state, params, cap, body).await },
        )
    });
}
