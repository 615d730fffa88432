//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p row-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use row_store::{
    ChildLookup, ChildRecord, NaturalId, OtherRecord, ParentRecord, PostgresRowStore, Repository,
    RevisionRepository, StoreError, UnitOfWork, UpsertableRecord, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresRowStore {
    init_tracing();
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE child, parent, other, revision RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .unwrap();

    PostgresRowStore::new(pool)
}

fn nid(value: &str) -> NaturalId {
    NaturalId::from(value)
}

async fn find_parent(store: &PostgresRowStore, id: &str) -> Option<ParentRecord> {
    Repository::<ParentRecord>::find_by_natural_id(store, &nid(id))
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
async fn insert_then_unchanged_update_keeps_version() {
    let store = get_test_store().await;

    let saved = Repository::<OtherRecord>::upsert(&store, &OtherRecord::new(nid("o")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.version, Version::first());
    assert!(saved.id.is_some());

    let again = Repository::<OtherRecord>::upsert(&store, &saved)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again, saved);
}

#[tokio::test]
#[serial]
async fn stale_upsert_returns_no_row() {
    let store = get_test_store().await;
    let first = Repository::<ParentRecord>::upsert(&store, &ParentRecord::new(nid("p")))
        .await
        .unwrap()
        .unwrap();

    let mut winner = first.clone();
    winner.value = Some("winner".into());
    let winner = Repository::<ParentRecord>::upsert(&store, &winner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(winner.version, Version::new(2));

    let mut loser = first;
    loser.value = Some("loser".into());
    let rejected = Repository::<ParentRecord>::upsert(&store, &loser)
        .await
        .unwrap();
    assert!(rejected.is_none());
}

#[tokio::test]
#[serial]
async fn child_round_trips_all_columns() {
    let store = get_test_store().await;
    Repository::<OtherRecord>::upsert(&store, &OtherRecord::new(nid("o")))
        .await
        .unwrap();
    Repository::<ParentRecord>::upsert(&store, &ParentRecord::new(nid("p")))
        .await
        .unwrap();

    let mut child = ChildRecord::new(nid("c"));
    child.other_natural_id = Some(nid("o"));
    child.parent_natural_id = Some(nid("p"));
    child.value = Some("v".into());
    child.side_values = ["x".to_string(), "y".to_string()].into();
    child.default_side_values = ["d".to_string()].into();

    let saved = Repository::<ChildRecord>::upsert(&store, &child)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.stamped(None, Version::initial()), child);

    let found = store.find_by_parent_natural_id(&nid("p")).await.unwrap();
    assert_eq!(found, vec![saved]);
}

#[tokio::test]
#[serial]
async fn child_assignment_bumps_parent_version() {
    let store = get_test_store().await;
    Repository::<ParentRecord>::upsert(&store, &ParentRecord::new(nid("p")))
        .await
        .unwrap();
    let child = Repository::<ChildRecord>::upsert(&store, &ChildRecord::new(nid("c")))
        .await
        .unwrap()
        .unwrap();

    let mut assigned = child;
    assigned.parent_natural_id = Some(nid("p"));
    let assigned = Repository::<ChildRecord>::upsert(&store, &assigned)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assigned.version, Version::new(2));
    assert_eq!(find_parent(&store, "p").await.unwrap().version, Version::new(2));

    let mut unassigned = assigned;
    unassigned.parent_natural_id = None;
    Repository::<ChildRecord>::upsert(&store, &unassigned)
        .await
        .unwrap();
    assert_eq!(find_parent(&store, "p").await.unwrap().version, Version::new(3));
}

#[tokio::test]
#[serial]
async fn child_update_under_the_same_parent_leaves_parent_version() {
    let store = get_test_store().await;
    Repository::<ParentRecord>::upsert(&store, &ParentRecord::new(nid("p")))
        .await
        .unwrap();
    let mut child = ChildRecord::new(nid("c"));
    child.parent_natural_id = Some(nid("p"));
    let mut child = Repository::<ChildRecord>::upsert(&store, &child)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(find_parent(&store, "p").await.unwrap().version, Version::new(2));

    child.value = Some("retimed".into());
    let child = Repository::<ChildRecord>::upsert(&store, &child)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.version, Version::new(2));
    assert_eq!(find_parent(&store, "p").await.unwrap().version, Version::new(2));

    Repository::<ChildRecord>::delete(&store, &child).await.unwrap();
    assert_eq!(find_parent(&store, "p").await.unwrap().version, Version::new(3));
}

#[tokio::test]
#[serial]
async fn missing_and_still_referenced_rows_are_reported() {
    let store = get_test_store().await;
    let mut orphan = ChildRecord::new(nid("c"));
    orphan.parent_natural_id = Some(nid("nobody"));
    let missing = Repository::<ChildRecord>::upsert(&store, &orphan).await;
    assert!(matches!(missing, Err(StoreError::MissingReference { .. })));

    Repository::<ParentRecord>::upsert(&store, &ParentRecord::new(nid("p")))
        .await
        .unwrap();
    let mut child = ChildRecord::new(nid("c"));
    child.parent_natural_id = Some(nid("p"));
    Repository::<ChildRecord>::upsert(&store, &child)
        .await
        .unwrap();

    let parent = find_parent(&store, "p").await.unwrap();
    let referenced = Repository::<ParentRecord>::delete(&store, &parent).await;
    assert!(matches!(referenced, Err(StoreError::StillReferenced { .. })));
}

#[tokio::test]
#[serial]
async fn delete_is_version_checked() {
    let store = get_test_store().await;
    let saved = Repository::<OtherRecord>::upsert(&store, &OtherRecord::new(nid("o")))
        .await
        .unwrap()
        .unwrap();

    let mut stale = saved.clone();
    stale.version = Version::new(7);
    let conflict = Repository::<OtherRecord>::delete(&store, &stale).await;
    assert!(matches!(conflict, Err(StoreError::Conflict { .. })));

    Repository::<OtherRecord>::delete(&store, &saved)
        .await
        .unwrap();
    let gone = Repository::<OtherRecord>::find_by_natural_id(&store, &nid("o"))
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
#[serial]
async fn rolled_back_unit_of_work_leaves_no_rows() {
    let store = get_test_store().await;

    store.begin().await.unwrap();
    let revision = store.begin_revision("discarded").await.unwrap();
    Repository::<OtherRecord>::upsert(&store, &OtherRecord::new(nid("o")))
        .await
        .unwrap();
    store.delete_revision(revision).await.unwrap();
    store.rollback().await.unwrap();

    let gone = Repository::<OtherRecord>::find_by_natural_id(&store, &nid("o"))
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
#[serial]
async fn completed_revision_is_recorded() {
    let store = get_test_store().await;

    store.begin().await.unwrap();
    let revision = store.begin_revision("kept").await.unwrap();
    Repository::<OtherRecord>::upsert(&store, &OtherRecord::new(nid("o")))
        .await
        .unwrap();
    store.complete_revision().await.unwrap();
    store.commit().await.unwrap();

    let completed: Option<bool> =
        sqlx::query_scalar("SELECT completed_at IS NOT NULL FROM revision WHERE id = $1")
            .bind(revision.as_i32())
            .fetch_optional(store.pool())
            .await
            .unwrap();
    assert_eq!(completed, Some(true));
}
