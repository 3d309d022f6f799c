// ============================================================================
// ENTITY CATALOG
// ============================================================================
// Paginated discovery of monitored entities and per-domain metric collection.
// Every upstream call goes through the shared `QueryExecutor`.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::error::{FailureKind, IngestError, IngestResult, QueryFailure};
use crate::executor::{QueryExecutor, QueryOutcome};
use crate::types::{Entity, EntityDomain, MetricBundle, ObservationWindow};

const ENTITY_SEARCH_DOCUMENT: &str = "query($query: String!, $cursor: String) { actor { entitySearch(query: $query) { results(cursor: $cursor) { entities { guid name domain entityType reporting tags { key values } } nextCursor } } } }";

// ----------------------------------------------------------------------------
// Metric Groups
// ----------------------------------------------------------------------------

/// One metric collected for an entity. `{guid}` is substituted per entity;
/// the window clause is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricQuery {
    pub metric: &'static str,
    pub template: &'static str,
}

const fn metric(metric: &'static str, template: &'static str) -> MetricQuery {
    MetricQuery { metric, template }
}

const APPLICATION_METRICS: [MetricQuery; 5] = [
    metric("apdex", "SELECT apdexScore as score FROM Metric WHERE entity.guid = '{guid}'"),
    metric(
        "response_time_max",
        "SELECT max(duration) as 'max.duration' FROM Transaction WHERE entity.guid = '{guid}'",
    ),
    metric(
        "error_rate",
        "SELECT latest(errorRate) as 'error_rate' FROM Metric WHERE entity.guid = '{guid}'",
    ),
    metric(
        "recent_error",
        "SELECT count(*), error.message, error.class, httpResponseCode FROM TransactionError WHERE entity.guid = '{guid}'",
    ),
    metric(
        "throughput",
        "SELECT average(newRelic.throughput) as 'avg.qps' FROM Metric WHERE entity.guid = '{guid}'",
    ),
];

const BROWSER_METRICS: [MetricQuery; 3] = [
    metric("apdex", "SELECT apdexScore as score FROM Metric WHERE entity.guid = '{guid}'"),
    metric(
        "page_load_time",
        "SELECT average(pageLoadTime) as 'avg.loadTime' FROM PageView WHERE entity.guid = '{guid}'",
    ),
    metric(
        "js_errors",
        "SELECT count(*) as 'error_count', errorMessage FROM JavaScriptError WHERE entity.guid = '{guid}'",
    ),
];

const INFRASTRUCTURE_METRICS: [MetricQuery; 3] = [
    metric(
        "cpu_usage",
        "SELECT average(cpuPercent) as 'avg.cpu' FROM Metric WHERE entity.guid = '{guid}'",
    ),
    metric(
        "memory_usage",
        "SELECT average(memoryUsedBytes)/average(memoryTotalBytes)*100 as 'memory_percent' FROM Metric WHERE entity.guid = '{guid}'",
    ),
    metric(
        "disk_usage",
        "SELECT average(diskUsedPercent) as 'disk_percent' FROM Metric WHERE entity.guid = '{guid}'",
    ),
];

const DATABASE_METRICS: [MetricQuery; 2] = [
    metric(
        "query_duration",
        "SELECT average(query.duration) as 'avg.duration' FROM DatastoreSample WHERE entityGuid = '{guid}'",
    ),
    metric(
        "throughput",
        "SELECT average(queriesPerSecond) as 'avg.qps' FROM DatastoreSample WHERE entityGuid = '{guid}'",
    ),
];

const GENERIC_METRICS: [MetricQuery; 1] = [metric(
    "generic",
    "SELECT * FROM Metric WHERE entity.guid = '{guid}'",
)];

/// Metric groups collected for a domain
pub fn metric_queries(domain: EntityDomain) -> &'static [MetricQuery] {
    match domain {
        EntityDomain::Application => &APPLICATION_METRICS,
        EntityDomain::Browser => &BROWSER_METRICS,
        EntityDomain::Infrastructure => &INFRASTRUCTURE_METRICS,
        EntityDomain::Database => &DATABASE_METRICS,
        _ => &GENERIC_METRICS,
    }
}

/// Row-listing queries get a LIMIT after the window clause
fn needs_limit(query: &MetricQuery) -> bool {
    matches!(query.metric, "recent_error" | "js_errors" | "generic")
}

pub fn build_nrql(query: &MetricQuery, guid: &str, window: ObservationWindow) -> String {
    let escaped = guid.replace('\\', "\\\\").replace('\'', "\\'");
    let mut nrql = format!("{} {}", query.template.replace("{guid}", &escaped), window.since_clause());
    if needs_limit(query) {
        nrql.push_str(" LIMIT 10");
    }
    nrql
}

// ----------------------------------------------------------------------------
// Discovery Wire Format
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchData {
    actor: SearchActor,
}

#[derive(Debug, Deserialize)]
struct SearchActor {
    #[serde(rename = "entitySearch")]
    entity_search: SearchBody,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    results: SearchPage,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    guid: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(rename = "entityType", default)]
    entity_type: Option<String>,
    #[serde(default)]
    reporting: Option<bool>,
    #[serde(default)]
    tags: Option<Vec<RawTag>>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    key: String,
    #[serde(default)]
    values: Vec<String>,
}

impl RawEntity {
    /// `None` for entities without a guid or outside the supported domains
    fn into_entity(self) -> Option<Entity> {
        let guid = self.guid.filter(|g| !g.is_empty())?;
        let domain = EntityDomain::from_code(self.domain.as_deref()?)?;
        let tags: BTreeMap<String, Vec<String>> = self
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|tag| (tag.key, tag.values))
            .collect();
        Some(Entity {
            name: self.name.unwrap_or_else(|| guid.clone()),
            guid,
            domain,
            entity_type: self.entity_type.unwrap_or_default(),
            reporting: self.reporting.unwrap_or(false),
            tags,
        })
    }
}

// ----------------------------------------------------------------------------
// Catalog
// ----------------------------------------------------------------------------

/// Counters exposed through diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub discovery_pages: u64,
    pub entities_discovered: u64,
    pub queries_issued: u64,
    pub queries_failed: u64,
}

#[derive(Debug, Default)]
struct CatalogCounters {
    discovery_pages: AtomicU64,
    entities_discovered: AtomicU64,
    queries_issued: AtomicU64,
    queries_failed: AtomicU64,
}

#[derive(Debug)]
pub struct EntityCatalog {
    executor: Arc<QueryExecutor>,
    config: CatalogConfig,
    request_timeout: Duration,
    counters: CatalogCounters,
}

impl EntityCatalog {
    pub fn new(executor: Arc<QueryExecutor>, config: CatalogConfig, request_timeout: Duration) -> Self {
        Self {
            executor,
            config,
            request_timeout,
            counters: CatalogCounters::default(),
        }
    }

    pub fn windows(&self) -> &[ObservationWindow] {
        &self.config.windows
    }

    /// Entities to collect in parallel during a refresh
    pub fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            discovery_pages: self.counters.discovery_pages.load(AtomicOrdering::Relaxed),
            entities_discovered: self.counters.entities_discovered.load(AtomicOrdering::Relaxed),
            queries_issued: self.counters.queries_issued.load(AtomicOrdering::Relaxed),
            queries_failed: self.counters.queries_failed.load(AtomicOrdering::Relaxed),
        }
    }

    fn search_query(&self) -> String {
        let domains = EntityDomain::ALL
            .iter()
            .map(|d| format!("'{}'", d.code()))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "accountId = {} AND domain IN ({})",
            self.executor.account_id(),
            domains
        )
    }

    /// Walk every discovery page. Any failed page fails the whole pass.
    pub async fn discover_entities(&self) -> IngestResult<Vec<Entity>> {
        let search = self.search_query();
        let mut seen = AHashSet::new();
        let mut entities = Vec::new();
        let mut skipped = 0usize;
        let mut cursor: Option<String> = None;

        for page in 1..=self.config.page_limit {
            let variables = json!({ "query": search, "cursor": cursor });
            let data = self
                .executor
                .execute_graphql(ENTITY_SEARCH_DOCUMENT, Some(variables), self.request_timeout)
                .await
                .map_err(|source| IngestError::Discovery { page, source })?;
            self.counters.discovery_pages.fetch_add(1, AtomicOrdering::Relaxed);

            let results = parse_search_page(data).map_err(|source| IngestError::Discovery { page, source })?;

            for raw in results.entities {
                match raw.into_entity() {
                    Some(entity) => {
                        if seen.insert(entity.guid.clone()) {
                            entities.push(entity);
                        }
                    }
                    None => skipped += 1,
                }
            }

            cursor = results.next_cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
            if page == self.config.page_limit {
                warn!(
                    target: "cerebro::catalog",
                    page_limit = self.config.page_limit,
                    "Discovery page limit reached, remaining pages ignored"
                );
            }
        }

        self.counters
            .entities_discovered
            .fetch_add(entities.len() as u64, AtomicOrdering::Relaxed);
        info!(
            target: "cerebro::catalog",
            entities = entities.len(),
            skipped,
            "Entity discovery complete"
        );
        Ok(entities)
    }

    /// One query per metric group per window. Failed queries leave their
    /// metric out; credential and circuit failures end the collection.
    pub async fn collect_metrics(
        &self,
        entity: &Entity,
        windows: &[ObservationWindow],
    ) -> IngestResult<MetricBundle> {
        let mut bundle = MetricBundle::new();
        let queries = metric_queries(entity.domain);

        for &window in windows {
            bundle.ensure_window(window);
            for query in queries {
                let nrql = build_nrql(query, &entity.guid, window);
                self.counters.queries_issued.fetch_add(1, AtomicOrdering::Relaxed);

                match self.executor.execute(&nrql, self.request_timeout).await {
                    QueryOutcome::Success(rows) => bundle.insert(window, query.metric, rows),
                    QueryOutcome::Failure(failure) => {
                        self.counters.queries_failed.fetch_add(1, AtomicOrdering::Relaxed);
                        if failure.kind.is_cycle_fatal() {
                            return Err(IngestError::Query(failure));
                        }
                        debug!(
                            target: "cerebro::catalog",
                            entity = %entity.name,
                            metric = query.metric,
                            window = %window,
                            kind = %failure.kind,
                            "Metric omitted"
                        );
                    }
                }
            }
        }

        Ok(bundle)
    }
}

fn parse_search_page(data: JsonValue) -> Result<SearchPage, QueryFailure> {
    serde_json::from_value::<SearchData>(data)
        .map(|d| d.actor.entity_search.results)
        .map_err(|e| QueryFailure::new(FailureKind::Decode, format!("malformed entitySearch page: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::{AdmissionConfig, RetryConfig};
    use crate::transport::stub::{self, StubTransport};
    use crate::transport::RequestEnvelope;
    use pretty_assertions::assert_eq;

    fn catalog(stub: Arc<StubTransport>, config: CatalogConfig) -> EntityCatalog {
        let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()));
        let executor = Arc::new(QueryExecutor::new(stub, admission, RetryConfig::default(), 7));
        EntityCatalog::new(executor, config, Duration::from_secs(30))
    }

    fn cursor_of(envelope: &RequestEnvelope) -> Option<String> {
        envelope
            .variables
            .as_ref()
            .and_then(|v| v.get("cursor"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }

    fn raw(guid: &str, domain: &str) -> JsonValue {
        json!({
            "guid": guid,
            "name": format!("{}-name", guid),
            "domain": domain,
            "entityType": "APPLICATION",
            "reporting": true,
            "tags": [{ "key": "env", "values": ["prod", "eu"] }],
        })
    }

    #[test]
    fn test_metric_groups_per_domain() {
        let names = |d| metric_queries(d).iter().map(|q| q.metric).collect::<Vec<_>>();
        assert_eq!(
            names(EntityDomain::Application),
            vec!["apdex", "response_time_max", "error_rate", "recent_error", "throughput"]
        );
        assert_eq!(names(EntityDomain::Browser), vec!["apdex", "page_load_time", "js_errors"]);
        assert_eq!(
            names(EntityDomain::Infrastructure),
            vec!["cpu_usage", "memory_usage", "disk_usage"]
        );
        assert_eq!(names(EntityDomain::Database), vec!["query_duration", "throughput"]);
        assert_eq!(names(EntityDomain::Mobile), vec!["generic"]);
        assert_eq!(names(EntityDomain::Synthetic), vec!["generic"]);
    }

    #[test]
    fn test_build_nrql() {
        let nrql = build_nrql(&APPLICATION_METRICS[0], "MXxBUE18", ObservationWindow::Last24Hours);
        assert_eq!(
            nrql,
            "SELECT apdexScore as score FROM Metric WHERE entity.guid = 'MXxBUE18' SINCE 24 HOURS AGO"
        );
        let nrql = build_nrql(&GENERIC_METRICS[0], "a'b", ObservationWindow::Last30Days);
        assert_eq!(
            nrql,
            "SELECT * FROM Metric WHERE entity.guid = 'a\\'b' SINCE 30 DAYS AGO LIMIT 10"
        );
    }

    #[test]
    fn test_raw_entity_conversion() {
        let entity: RawEntity = serde_json::from_value(raw("g1", "APM")).unwrap();
        let entity = entity.into_entity().unwrap();
        assert_eq!(entity.domain, EntityDomain::Application);
        assert_eq!(entity.tags["env"], vec!["prod".to_string(), "eu".to_string()]);
        assert!(entity.reporting);

        let viz: RawEntity = serde_json::from_value(raw("g2", "VIZ")).unwrap();
        assert!(viz.into_entity().is_none());
        let no_guid: RawEntity = serde_json::from_value(json!({ "domain": "APM" })).unwrap();
        assert!(no_guid.into_entity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_follows_cursor_and_dedupes() {
        let stub = Arc::new(StubTransport::from_fn(|envelope, _| {
            Ok(match cursor_of(envelope).as_deref() {
                None => stub::entity_page(json!([raw("g1", "APM"), raw("g2", "INFRA")]), Some("c2")),
                Some("c2") => stub::entity_page(
                    json!([raw("g2", "INFRA"), raw("g3", "BROWSER"), raw("g4", "DASHBOARD")]),
                    None,
                ),
                Some(other) => panic!("unexpected cursor {}", other),
            })
        }));
        let catalog = catalog(Arc::clone(&stub), CatalogConfig::default());

        let entities = catalog.discover_entities().await.unwrap();
        let guids = entities.iter().map(|e| e.guid.as_str()).collect::<Vec<_>>();
        assert_eq!(guids, vec!["g1", "g2", "g3"]);
        assert_eq!(stub.calls(), 2);

        let first = &stub.requests()[0];
        assert!(stub::is_discovery(first));
        let search = first.variables.as_ref().unwrap()["query"].as_str().unwrap().to_string();
        assert!(search.starts_with("accountId = 7 AND domain IN ('APM',"));

        let stats = catalog.stats();
        assert_eq!(stats.discovery_pages, 2);
        assert_eq!(stats.entities_discovered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_respects_page_limit() {
        let stub = Arc::new(StubTransport::from_fn(|_, index| {
            Ok(stub::entity_page(
                json!([raw(&format!("g{}", index), "APM")]),
                Some("more"),
            ))
        }));
        let config = CatalogConfig {
            page_limit: 3,
            ..CatalogConfig::default()
        };
        let catalog = catalog(Arc::clone(&stub), config);

        let entities = catalog.discover_entities().await.unwrap();
        assert_eq!(entities.len(), 3);
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_fails_on_any_page() {
        let stub = Arc::new(StubTransport::scripted(vec![
            Ok(stub::entity_page(json!([raw("g1", "APM")]), Some("c2"))),
            Ok(stub::graphql_error("cursor expired", None)),
        ]));
        let catalog = catalog(Arc::clone(&stub), CatalogConfig::default());

        match catalog.discover_entities().await {
            Err(IngestError::Discovery { page, source }) => {
                assert_eq!(page, 2);
                assert_eq!(source.kind, FailureKind::QueryRejected);
            }
            other => panic!("expected discovery failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_page_is_discovery_error() {
        let stub = Arc::new(StubTransport::scripted(vec![Ok(stub::ok_json(
            json!({ "data": { "actor": { "somethingElse": {} } } }),
        ))]));
        let catalog = catalog(Arc::clone(&stub), CatalogConfig::default());

        let err = catalog.discover_entities().await.unwrap_err();
        assert!(matches!(err, IngestError::Discovery { page: 1, .. }));
        assert_eq!(err.category(), "discovery");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_metric_does_not_stop_others() {
        let stub = Arc::new(StubTransport::from_fn(|envelope, _| {
            let nrql = envelope.variables.as_ref().unwrap()["nrql"].as_str().unwrap().to_string();
            if nrql.contains("errorRate") {
                Ok(stub::graphql_error("unknown attribute", None))
            } else {
                Ok(stub::nrql_rows(json!([{ "value": 1 }])))
            }
        }));
        let catalog = catalog(Arc::clone(&stub), CatalogConfig::default());
        let entity = Entity::new("g1", "checkout", EntityDomain::Application);
        let windows = [ObservationWindow::Last30Minutes, ObservationWindow::Last7Days];

        let bundle = catalog.collect_metrics(&entity, &windows).await.unwrap();
        assert_eq!(stub.calls(), 10);
        for window in windows {
            let metrics = bundle.window(window).unwrap();
            assert_eq!(metrics.len(), 4);
            assert!(!metrics.contains_key("error_rate"));
            assert!(metrics.contains_key("throughput"));
        }

        let stats = catalog.stats();
        assert_eq!(stats.queries_issued, 10);
        assert_eq!(stats.queries_failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_ends_collection() {
        let stub = Arc::new(StubTransport::scripted(vec![
            Ok(stub::nrql_rows(json!([{ "cpu": 3 }]))),
            Ok(stub::status(403)),
        ]));
        let catalog = catalog(Arc::clone(&stub), CatalogConfig::default());
        let entity = Entity::new("h1", "db-host", EntityDomain::Infrastructure);

        let err = catalog
            .collect_metrics(&entity, &ObservationWindow::ALL)
            .await
            .unwrap_err();
        assert!(err.is_cycle_fatal());
        assert_eq!(err.category(), "authentication");
        assert_eq!(stub.calls(), 2);
    }
}
