use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    PgPool, Postgres, Row, Transaction,
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::Query,
};
use tokio::sync::Mutex;

use crate::{
    ChildRecord, KnownState, NaturalId, OtherRecord, ParentRecord, Result, StoreConfig,
    StoreError, UpsertableRecord, Version,
    store::{ChildLookup, RecordStream, Repository, RevisionId, RevisionRepository, UnitOfWork},
};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// PostgreSQL-backed row store implementation.
///
/// While a unit of work is open every statement runs on its transaction;
/// otherwise statements run directly on the pool.
#[derive(Clone)]
pub struct PostgresRowStore {
    pool: PgPool,
    tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl PostgresRowStore {
    /// Creates a new PostgreSQL row store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Connects a pool using the given configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::InvalidData("DATABASE_URL is not set".into()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_optional(&self, query: PgQuery<'_>) -> Result<Option<PgRow>> {
        let mut tx = self.tx.lock().await;
        let row = match tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }

    async fn fetch_all(&self, query: PgQuery<'_>) -> Result<Vec<PgRow>> {
        let mut tx = self.tx.lock().await;
        let rows = match tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    async fn execute(&self, query: PgQuery<'_>) -> Result<u64> {
        let mut tx = self.tx.lock().await;
        let done = match tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(done.rows_affected())
    }

    fn stream_of<R: Send + 'static>(rows: Vec<R>) -> RecordStream<R> {
        use futures_util::stream;

        Box::pin(stream::iter(rows.into_iter().map(Ok)))
    }

    fn row_to_other(row: PgRow) -> Result<OtherRecord> {
        Ok(OtherRecord {
            id: Some(row.try_get("id")?),
            natural_id: NaturalId::new(row.try_get::<String, _>("natural_id")?),
            value: row.try_get("value")?,
            version: Version::new(row.try_get("version")?),
        })
    }

    fn row_to_parent(row: PgRow) -> Result<ParentRecord> {
        Ok(ParentRecord {
            id: Some(row.try_get("id")?),
            natural_id: NaturalId::new(row.try_get::<String, _>("natural_id")?),
            other_natural_id: optional_id(&row, "other_natural_id")?,
            state: state(&row)?,
            value: row.try_get("value")?,
            side_values: text_set(&row, "side_values")?,
            version: Version::new(row.try_get("version")?),
        })
    }

    fn row_to_child(row: PgRow) -> Result<ChildRecord> {
        Ok(ChildRecord {
            id: Some(row.try_get("id")?),
            natural_id: NaturalId::new(row.try_get::<String, _>("natural_id")?),
            other_natural_id: optional_id(&row, "other_natural_id")?,
            parent_natural_id: optional_id(&row, "parent_natural_id")?,
            state: state(&row)?,
            at: row.try_get("at")?,
            value: row.try_get("value")?,
            default_side_values: text_set(&row, "default_side_values")?,
            side_values: text_set(&row, "side_values")?,
            version: Version::new(row.try_get("version")?),
        })
    }
}

fn optional_id(row: &PgRow, column: &str) -> Result<Option<NaturalId>> {
    Ok(row.try_get::<Option<String>, _>(column)?.map(NaturalId::new))
}

fn state(row: &PgRow) -> Result<KnownState> {
    let raw: String = row.try_get("state")?;
    raw.parse()
        .map_err(|e: common::UnknownState| StoreError::InvalidData(e.to_string()))
}

fn text_set(row: &PgRow, column: &str) -> Result<BTreeSet<String>> {
    Ok(row.try_get::<Vec<String>, _>(column)?.into_iter().collect())
}

fn text_array(values: &BTreeSet<String>) -> Vec<String> {
    values.iter().cloned().collect()
}

fn optional_str(id: &Option<NaturalId>) -> Option<&str> {
    id.as_ref().map(NaturalId::as_str)
}

/// Maps referential-integrity failures raised by a write.
fn map_write_error<R: UpsertableRecord>(
    record: &R,
    deleting: bool,
) -> impl FnOnce(StoreError) -> StoreError + '_ {
    move |e| {
        if let StoreError::Database(sqlx::Error::Database(ref db_err)) = e
            && db_err.is_foreign_key_violation()
        {
            let constraint = db_err.constraint().unwrap_or("foreign key").to_owned();
            return if deleting {
                StoreError::StillReferenced {
                    entity: R::ENTITY,
                    natural_id: record.natural_id().clone(),
                    referrer: constraint,
                }
            } else {
                StoreError::MissingReference {
                    entity: R::ENTITY,
                    natural_id: record.natural_id().clone(),
                    reference: constraint,
                }
            };
        }
        e
    }
}

impl PostgresRowStore {
    async fn delete_row<R: UpsertableRecord>(&self, table: &'static str, record: &R) -> Result<()> {
        let sql = format!("DELETE FROM {table} WHERE natural_id = $1 AND version = $2");
        let deleted = self
            .execute(
                sqlx::query(&sql)
                    .bind(record.natural_id().as_str())
                    .bind(record.version().as_i64()),
            )
            .await
            .map_err(map_write_error(record, true))?;
        if deleted == 0 {
            return Err(StoreError::Conflict {
                entity: R::ENTITY,
                natural_id: record.natural_id().clone(),
                expected: record.version(),
            });
        }
        tracing::debug!(entity = R::ENTITY, natural_id = %record.natural_id(), "row deleted");
        Ok(())
    }
}

#[async_trait]
impl Repository<OtherRecord> for PostgresRowStore {
    async fn find_all(&self) -> Result<RecordStream<OtherRecord>> {
        let rows = self
            .fetch_all(sqlx::query("SELECT * FROM other ORDER BY natural_id"))
            .await?;
        let records = rows
            .into_iter()
            .map(Self::row_to_other)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::stream_of(records))
    }

    async fn find_by_natural_id(&self, natural_id: &NaturalId) -> Result<Option<OtherRecord>> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM other WHERE natural_id = $1").bind(natural_id.as_str()),
        )
        .await?
        .map(Self::row_to_other)
        .transpose()
    }

    async fn upsert(&self, record: &OtherRecord) -> Result<Option<OtherRecord>> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM upsert_other($1, $2, $3)")
                .bind(record.natural_id.as_str())
                .bind(record.value.as_deref())
                .bind(record.version.as_i64()),
        )
        .await
        .map_err(map_write_error(record, false))?
        .map(Self::row_to_other)
        .transpose()
    }

    async fn delete(&self, record: &OtherRecord) -> Result<()> {
        self.delete_row("other", record).await
    }
}

#[async_trait]
impl Repository<ParentRecord> for PostgresRowStore {
    async fn find_all(&self) -> Result<RecordStream<ParentRecord>> {
        let rows = self
            .fetch_all(sqlx::query("SELECT * FROM parent ORDER BY natural_id"))
            .await?;
        let records = rows
            .into_iter()
            .map(Self::row_to_parent)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::stream_of(records))
    }

    async fn find_by_natural_id(&self, natural_id: &NaturalId) -> Result<Option<ParentRecord>> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM parent WHERE natural_id = $1").bind(natural_id.as_str()),
        )
        .await?
        .map(Self::row_to_parent)
        .transpose()
    }

    async fn upsert(&self, record: &ParentRecord) -> Result<Option<ParentRecord>> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM upsert_parent($1, $2, $3, $4, $5, $6)")
                .bind(record.natural_id.as_str())
                .bind(optional_str(&record.other_natural_id))
                .bind(record.state.as_str())
                .bind(record.value.as_deref())
                .bind(text_array(&record.side_values))
                .bind(record.version.as_i64()),
        )
        .await
        .map_err(map_write_error(record, false))?
        .map(Self::row_to_parent)
        .transpose()
    }

    async fn delete(&self, record: &ParentRecord) -> Result<()> {
        self.delete_row("parent", record).await
    }
}

#[async_trait]
impl Repository<ChildRecord> for PostgresRowStore {
    async fn find_all(&self) -> Result<RecordStream<ChildRecord>> {
        let rows = self
            .fetch_all(sqlx::query("SELECT * FROM child ORDER BY natural_id"))
            .await?;
        let records = rows
            .into_iter()
            .map(Self::row_to_child)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::stream_of(records))
    }

    async fn find_by_natural_id(&self, natural_id: &NaturalId) -> Result<Option<ChildRecord>> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM child WHERE natural_id = $1").bind(natural_id.as_str()),
        )
        .await?
        .map(Self::row_to_child)
        .transpose()
    }

    async fn upsert(&self, record: &ChildRecord) -> Result<Option<ChildRecord>> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM upsert_child($1, $2, $3, $4, $5, $6, $7, $8, $9)")
                .bind(record.natural_id.as_str())
                .bind(optional_str(&record.other_natural_id))
                .bind(optional_str(&record.parent_natural_id))
                .bind(record.state.as_str())
                .bind(record.at)
                .bind(record.value.as_deref())
                .bind(text_array(&record.default_side_values))
                .bind(text_array(&record.side_values))
                .bind(record.version.as_i64()),
        )
        .await
        .map_err(map_write_error(record, false))?
        .map(Self::row_to_child)
        .transpose()
    }

    async fn delete(&self, record: &ChildRecord) -> Result<()> {
        self.delete_row("child", record).await
    }
}

#[async_trait]
impl ChildLookup for PostgresRowStore {
    async fn find_by_parent_natural_id(
        &self,
        parent_natural_id: &NaturalId,
    ) -> Result<Vec<ChildRecord>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM child WHERE parent_natural_id = $1 ORDER BY natural_id")
                .bind(parent_natural_id.as_str()),
        )
        .await?
        .into_iter()
        .map(Self::row_to_child)
        .collect()
    }
}

#[async_trait]
impl RevisionRepository for PostgresRowStore {
    async fn begin_revision(&self, name: &str) -> Result<RevisionId> {
        let row = self
            .fetch_optional(sqlx::query("SELECT begin_revision($1) AS id").bind(name))
            .await?
            .ok_or_else(|| StoreError::Revision(format!("no id returned for revision {name}")))?;
        Ok(RevisionId::new(row.try_get("id")?))
    }

    async fn complete_revision(&self) -> Result<()> {
        self.execute(sqlx::query("SELECT complete_revision()")).await?;
        Ok(())
    }

    async fn delete_revision(&self, revision: RevisionId) -> Result<()> {
        self.execute(sqlx::query("SELECT delete_revision($1)").bind(revision.as_i32()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for PostgresRowStore {
    async fn begin(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.is_some() {
            return Err(StoreError::Transaction(
                "a transaction is already in progress".into(),
            ));
        }
        *tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| StoreError::Transaction("no transaction to commit".into()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| StoreError::Transaction("no transaction to roll back".into()))?;
        tx.rollback().await?;
        Ok(())
    }
}
