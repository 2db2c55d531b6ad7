//! Literal end-to-end scenarios, one test per scenario in the testable
//! properties suite (E1-E8): cache hit rewriting, multi-fragment
//! intersection, miss passthrough, duplicate-enqueue priority bump,
//! datatype conflict, decomposer star-join, fragment-execution timeout
//! recovery, and lazy intersection round-trip.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use partition_cache::cache::backends::array::SortedArrayStore;
use partition_cache::cache::{CacheStore, Datatype, Identifier};
use partition_cache::catalog::PartitionRegistry;
use partition_cache::decompose::{DecomposerConfig, QueryDecomposer};
use partition_cache::hasher::FragmentHasher;
use partition_cache::intersect::{Intersection, LazyIntersector};
use partition_cache::processor::{FragmentExecutor, ProcessorConfig, ProcessorPool};
use partition_cache::queue::{MemoryQueue, Queue};
use partition_cache::rewrite::{IntegrationMethod, QueryRewriter};
use partition_cache::PartitionCacheError;

fn ids(vals: &[i64]) -> Vec<Identifier> {
    vals.iter().map(|v| Identifier::Integer(*v)).collect()
}

// E1: single-table exact hit.
#[tokio::test]
async fn e1_single_table_exact_hit_rewrites_with_in_list() {
    let store = SortedArrayStore::new();
    store.register_partition("city_id", Datatype::Integer).await.unwrap();

    let hasher = FragmentHasher::new();
    let fragment = hasher.hash_fragment("SELECT DISTINCT city_id FROM pois WHERE type='restaurant'").unwrap();
    store.put_set("city_id", &fragment.hash, ids(&[1, 5, 10])).await.unwrap();

    let intersector = LazyIntersector::new(&store);
    let intersection = intersector.intersect("city_id", &[fragment.hash]).await.unwrap();
    assert_eq!(intersection.hits(), 1);

    let rewriter = QueryRewriter::new(IntegrationMethod::InList);
    let result = rewriter.rewrite(
        "SELECT * FROM pois WHERE type='restaurant'",
        "pois",
        "city_id",
        &intersection,
    );

    assert!(result.enhanced);
    assert_eq!(result.hits, 1);
    assert!(result.sql.contains("type='restaurant'"));
    assert!(result.sql.contains("city_id IN (1, 5, 10)"));
}

// E2: intersection of two fragments.
#[tokio::test]
async fn e2_intersection_of_two_fragments_restricts_to_overlap() {
    let store = SortedArrayStore::new();
    store.register_partition("city_id", Datatype::Integer).await.unwrap();
    store.put_set("city_id", "f1", ids(&[1, 2, 3, 4, 5])).await.unwrap();
    store.put_set("city_id", "f2", ids(&[3, 4, 5, 6, 7])).await.unwrap();

    let intersector = LazyIntersector::new(&store);
    let intersection =
        intersector.intersect("city_id", &["f1".to_string(), "f2".to_string()]).await.unwrap();

    assert_eq!(intersection.ids(), Some(ids(&[3, 4, 5]).as_slice()));

    let rewriter = QueryRewriter::new(IntegrationMethod::InList);
    let result = rewriter.rewrite("SELECT * FROM orders o", "o", "city_id", &intersection);
    assert!(result.sql.contains("city_id IN (3, 4, 5)"));
}

// E3: miss. Decomposer emits three fragment hashes over an empty cache.
#[tokio::test]
async fn e3_miss_leaves_the_query_untouched() {
    let store = SortedArrayStore::new();
    store.register_partition("city_id", Datatype::Integer).await.unwrap();

    let registry = PartitionRegistry::new();
    registry.register("city_id", Datatype::Integer).unwrap();
    registry.bind_column("city_id", "a", "city_id").unwrap();
    registry.bind_column("city_id", "b", "city_id").unwrap();
    registry.bind_column("city_id", "c", "city_id").unwrap();
    let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry);

    let sql = "SELECT * FROM a, b, c WHERE a.age > 25 AND b.age > 30 AND c.age > 40";
    let fragments = decomposer.decompose(sql, "city_id", &DecomposerConfig::default()).unwrap();
    assert_eq!(fragments.len(), 3);

    let hashes: Vec<String> = fragments.iter().map(|f| f.hash.clone()).collect();
    let intersector = LazyIntersector::new(&store);
    let intersection = intersector.intersect("city_id", &hashes).await.unwrap();
    assert_eq!(intersection.hits(), 0);

    let rewriter = QueryRewriter::new(IntegrationMethod::InList);
    let result = rewriter.rewrite(sql, "a", "city_id", &intersection);
    assert_eq!(result.sql, sql);
    assert!(!result.enhanced);
}

// E4: duplicate enqueue priority bump.
#[tokio::test]
async fn e4_duplicate_enqueue_bumps_priority_without_a_second_row() {
    let queue = MemoryQueue::new();
    queue.push_original("SELECT * FROM orders", "city_id", None, 1).await.unwrap();
    queue.push_original("SELECT * FROM orders", "city_id", None, 1).await.unwrap();

    assert_eq!(queue.lengths().await.unwrap().original, 1);
    let item = queue.pop_original().await.unwrap().unwrap();
    assert!(item.priority >= 2);
}

// E5: datatype conflict.
#[tokio::test]
async fn e5_datatype_conflict_on_mismatched_identifier() {
    let store = SortedArrayStore::new();
    store.register_partition("city_id", Datatype::Integer).await.unwrap();

    let err = store.put_set("city_id", "h1", vec![Identifier::Text("NYC".to_string())]).await.unwrap_err();
    assert!(matches!(err, PartitionCacheError::DatatypeConflict { .. }));
}

// E6: decomposer star-join re-addition.
#[tokio::test]
async fn e6_star_join_table_is_readded_to_every_variant() {
    let registry = PartitionRegistry::new();
    registry.register("city_id", Datatype::Integer).unwrap();
    registry.bind_column("city_id", "users", "city_id").unwrap();
    registry.bind_column("city_id", "orders", "city_id").unwrap();
    registry.bind_column("city_id", "p0_city", "city_id").unwrap();

    let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry);
    let sql = "SELECT * FROM users u, orders o, p0_city p0 \
               WHERE u.city_id = p0.city_id AND o.city_id = p0.city_id \
               AND u.age > 25 AND o.total > 100";
    let fragments = decomposer.decompose(sql, "city_id", &DecomposerConfig::default()).unwrap();

    assert_eq!(fragments.len(), 3);
    assert!(fragments.iter().all(|f| f.aliases.contains(&"p0".to_string())));

    let base_only: Vec<Vec<String>> = fragments
        .iter()
        .map(|f| {
            let mut others: Vec<String> = f.aliases.iter().filter(|a| a.as_str() != "p0").cloned().collect();
            others.sort();
            others
        })
        .collect();
    assert!(base_only.contains(&vec!["u".to_string()]));
    assert!(base_only.contains(&vec!["o".to_string()]));
    assert!(base_only.contains(&vec!["o".to_string(), "u".to_string()]));
}

// E7: fragment-execution timeout is reclaimed by housekeeping.
struct NeverReturns;

#[async_trait]
impl FragmentExecutor for NeverReturns {
    async fn execute(&self, _fragment_sql: &str, _partition_key: &str) -> partition_cache::Result<Vec<Identifier>> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn e7_timed_out_fragment_is_reclaimed_and_absent_on_reread() {
    let registry = PartitionRegistry::new();
    registry.register("city_id", Datatype::Integer).unwrap();
    let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry.clone());
    let store = Arc::new(SortedArrayStore::new());
    let queue = Arc::new(MemoryQueue::new());

    let pool = ProcessorPool::new(
        queue.clone(),
        store.clone(),
        registry,
        decomposer,
        Arc::new(NeverReturns),
        ProcessorConfig { fragment_timeout: Duration::from_millis(10), ..ProcessorConfig::default() },
    );

    // A worker crashes mid-execution without ever reporting back: simulate
    // it by claiming the job directly rather than going through
    // run_executor_once (which, on its own timeout, cleans up synchronously).
    assert!(pool.active_jobs().try_start("h1", "city_id", "crashed-worker", Duration::from_millis(10)));

    tokio::time::advance(Duration::from_millis(50)).await;

    let reclaimed = pool.sweep_timeouts().await.unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(pool.active_jobs().active_count(), 0);
    assert_eq!(pool.queue().lengths().await.unwrap().fragment, 1);

    let value = pool.store().get("city_id", "h1").await.unwrap();
    assert!(value.is_absent(), "timeout status must read back as Absent, not Null-marker");
}

// E8: lazy intersection agrees with materialized intersection.
fn test_url() -> Option<String> {
    std::env::var("TEST_POSTGRES_URL").ok()
}

#[tokio::test]
#[ignore = "requires TEST_POSTGRES_URL"]
async fn e8_lazy_intersection_matches_materialized_intersection() {
    use partition_cache::cache::backends::postgres::PostgresStore;

    let url = test_url().expect("TEST_POSTGRES_URL must be set to run this test");
    let store = PostgresStore::connect(&url).await.unwrap();
    store.register_partition("e8_city_id", Datatype::Integer).await.unwrap();
    store.put_set("e8_city_id", "h1", ids(&[1, 2, 3, 4, 5])).await.unwrap();
    store.put_set("e8_city_id", "h2", ids(&[3, 4, 5, 6, 7])).await.unwrap();

    let intersector = LazyIntersector::new(&store);
    let lazy = intersector.intersect("e8_city_id", &["h1".to_string(), "h2".to_string()]).await.unwrap();
    let materialized = store.intersect("e8_city_id", &["h1".to_string(), "h2".to_string()]).await.unwrap();

    match lazy {
        Intersection::Lazy { subquery_sql, hits } => {
            assert_eq!(hits, materialized.hits);
            let rows = sqlx::query(&subquery_sql)
                .fetch_all(store.pool())
                .await
                .unwrap();
            assert_eq!(rows.len(), materialized.ids.len());
        }
        Intersection::Materialized(_) => panic!("PostgresStore must answer intersect_lazy with a subquery"),
    }

    // A requested hash with no cached row must not collapse the lazy
    // subquery to empty: both paths intersect over the present fragments
    // only, never over the full requested set.
    let requested = vec!["h1".to_string(), "h2".to_string(), "missing".to_string()];
    let lazy_partial = intersector.intersect("e8_city_id", &requested).await.unwrap();
    let materialized_partial = store.intersect("e8_city_id", &requested).await.unwrap();

    match lazy_partial {
        Intersection::Lazy { subquery_sql, hits } => {
            assert_eq!(hits, 2, "only h1 and h2 are present");
            assert_eq!(hits, materialized_partial.hits);
            let rows = sqlx::query(&subquery_sql)
                .fetch_all(store.pool())
                .await
                .unwrap();
            assert_eq!(rows.len(), materialized_partial.ids.len());
            assert_eq!(rows.len(), 3, "h1 INTERSECT h2 over {{3,4,5,6,7}}∩{{1..5}} = {{3,4,5}}");
        }
        Intersection::Materialized(_) => panic!("PostgresStore must answer intersect_lazy with a subquery"),
    }
}
