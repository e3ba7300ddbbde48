//! Primary-candidate discovery.
//!
//! Standalone and replicated objects follow the StatefulSet naming
//! convention, so their candidates are computed without any API call.
//! Sharded objects are reached through a router pod picked from the live
//! pod list.

use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::database::{Candidate, DatabaseObject, PodInfo, RouterSelector, Topology};
use crate::{Error, Result};

/// Turns a database object into its ordered list of primary candidates.
pub struct TopologyResolver<'a> {
    api: &'a dyn ClusterApi,
}

impl<'a> TopologyResolver<'a> {
    pub fn new(api: &'a dyn ClusterApi) -> Self {
        Self { api }
    }

    /// Candidates in ascending ordinal order.
    ///
    /// Fails with [`Error::ResourceNotReady`] before any pod listing when the
    /// object is not `Ready`.
    pub async fn resolve(&self, db: &DatabaseObject) -> Result<Vec<Candidate>> {
        if !db.is_ready() {
            return Err(Error::ResourceNotReady {
                kind: db.engine.kind().to_string(),
                namespace: db.namespace.clone(),
                name: db.name.clone(),
                phase: db.phase.to_string(),
            });
        }

        let candidates = match &db.topology {
            Topology::Standalone => vec![Candidate::new(db.ordinal_pod(0), 0)],
            Topology::Replicated { replicas } => replica_candidates(db, *replicas)?,
            Topology::Sharded { router } => {
                let pods = self
                    .api
                    .list_pods(&db.namespace, &db.pod_selector())
                    .await?;
                vec![pick_router(db, &pods, router)?]
            }
        };

        debug!(
            name = %db.name,
            candidates = ?candidates.iter().map(|c| c.pod_name.as_str()).collect::<Vec<_>>(),
            "Resolved candidates"
        );
        Ok(candidates)
    }
}

fn replica_candidates(db: &DatabaseObject, replicas: u32) -> Result<Vec<Candidate>> {
    if replicas == 0 {
        return Err(Error::invalid_topology(
            &db.name,
            "replicated topology declares zero replicas",
        ));
    }
    Ok((0..replicas)
        .map(|ordinal| Candidate::new(db.ordinal_pod(ordinal), ordinal))
        .collect())
}

/// Pick one router among the matching pods.
///
/// Routers are interchangeable, but the choice is kept stable: ready pods
/// first, then by name.
fn pick_router(
    db: &DatabaseObject,
    pods: &[PodInfo],
    router: &RouterSelector,
) -> Result<Candidate> {
    let mut matching: Vec<&PodInfo> = pods.iter().filter(|p| router.matches(p)).collect();
    matching.sort_by(|a, b| b.ready.cmp(&a.ready).then_with(|| a.name.cmp(&b.name)));

    let chosen = matching.first().ok_or_else(|| Error::PodNotFound {
        namespace: db.namespace.clone(),
        name: format!("{} pod for {} ({})", db.engine.kind(), db.name, router),
    })?;

    info!(
        pod = %chosen.name,
        matched = matching.len(),
        "Selected router pod"
    );
    Ok(Candidate::from_pod_name(&chosen.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::database::Phase;
    use crate::engine::Engine;

    fn db(engine: Engine, name: &str, topology: Topology) -> DatabaseObject {
        DatabaseObject {
            engine,
            name: name.to_string(),
            namespace: "demo".to_string(),
            phase: Phase::Ready,
            topology,
            auth_secret: None,
            auth_disabled: false,
        }
    }

    fn pod(name: &str, ready: bool) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            namespace: "demo".to_string(),
            ready,
            ..Default::default()
        }
    }

    fn names(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.pod_name.as_str()).collect()
    }

    #[tokio::test]
    async fn standalone_needs_no_pod_listing() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods().never();

        let candidates = TopologyResolver::new(&api)
            .resolve(&db(Engine::Postgres, "pg-demo", Topology::Standalone))
            .await
            .unwrap();
        assert_eq!(names(&candidates), vec!["pg-demo-0"]);
    }

    #[tokio::test]
    async fn replicated_candidates_are_ordinal_ordered() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods().never();

        let candidates = TopologyResolver::new(&api)
            .resolve(&db(
                Engine::MongoDb,
                "mydb",
                Topology::Replicated { replicas: 3 },
            ))
            .await
            .unwrap();
        assert_eq!(names(&candidates), vec!["mydb-0", "mydb-1", "mydb-2"]);
        assert_eq!(
            candidates.iter().map(|c| c.ordinal).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn zero_replicas_is_an_error() {
        let api = MockClusterApi::new();
        let result = TopologyResolver::new(&api)
            .resolve(&db(
                Engine::MongoDb,
                "mydb",
                Topology::Replicated { replicas: 0 },
            ))
            .await;
        assert!(matches!(result, Err(Error::InvalidTopology { .. })));
    }

    #[tokio::test]
    async fn not_ready_fails_before_listing() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods().never();

        let mut object = db(
            Engine::MongoDb,
            "x",
            Topology::Sharded {
                router: RouterSelector::NamePrefix("x-mongos".to_string()),
            },
        );
        object.phase = Phase::Provisioning;

        let result = TopologyResolver::new(&api).resolve(&object).await;
        assert!(matches!(result, Err(Error::ResourceNotReady { .. })));
    }

    #[tokio::test]
    async fn sharded_resolves_router_by_prefix() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods()
            .withf(|ns, selector| {
                ns == "demo" && selector.contains("app.kubernetes.io/instance=x")
            })
            .times(1)
            .returning(|_, _| Ok(vec![pod("x-mongos-0", true), pod("x-shard0-0", true)]));

        let candidates = TopologyResolver::new(&api)
            .resolve(&db(
                Engine::MongoDb,
                "x",
                Topology::Sharded {
                    router: RouterSelector::NamePrefix("x-mongos".to_string()),
                },
            ))
            .await
            .unwrap();
        assert_eq!(names(&candidates), vec!["x-mongos-0"]);
    }

    #[tokio::test]
    async fn router_choice_prefers_ready_then_name() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods().returning(|_, _| {
            Ok(vec![
                pod("x-mongos-2", true),
                pod("x-mongos-0", false),
                pod("x-mongos-1", true),
            ])
        });

        let candidates = TopologyResolver::new(&api)
            .resolve(&db(
                Engine::MongoDb,
                "x",
                Topology::Sharded {
                    router: RouterSelector::NamePrefix("x-mongos".to_string()),
                },
            ))
            .await
            .unwrap();
        assert_eq!(names(&candidates), vec!["x-mongos-1"]);
        assert_eq!(candidates[0].ordinal, 1);
    }

    #[tokio::test]
    async fn no_matching_router_is_pod_not_found() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods()
            .returning(|_, _| Ok(vec![pod("x-shard0-0", true)]));

        let result = TopologyResolver::new(&api)
            .resolve(&db(
                Engine::MongoDb,
                "x",
                Topology::Sharded {
                    router: RouterSelector::NamePrefix("x-mongos".to_string()),
                },
            ))
            .await;
        assert!(matches!(result, Err(Error::PodNotFound { .. })));
    }
}
