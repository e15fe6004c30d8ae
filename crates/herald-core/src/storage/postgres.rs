//! Postgres implementation of every repository trait.
//!
//! Partition joins lock the owning resource row with `SELECT … FOR UPDATE`.
//! Document upserts and ledger decisions take transaction-scoped advisory
//! locks keyed by document id and (subscription, document) pair, so several
//! service instances can share one database.

use std::sync::Arc;

use futures::StreamExt;
use sqlx::{postgres::PgRow, types::Json, PgPool, Postgres, Row, Transaction};
use tokio::sync::{mpsc, Mutex};

use super::{
    DocumentRepository, DocumentWrite, ResourceRepository, StoreConfig, SubscriptionRepository,
    SubscriptionStream, STREAM_BUFFER,
};
use crate::{
    error::{CoreError, Result},
    ledger::{self, DeliverFn, LedgerEntry, LedgerKey, LedgerStore, TriggerOutcome},
    models::{
        Action, ChangeDetection, Document, DocumentId, PartitionId, Resource, ResourceId,
        Subscription, SubscriptionId,
    },
    resolver,
    time::Clock,
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS resources (
        id UUID PRIMARY KEY,
        addresses JSONB NOT NULL,
        path TEXT NOT NULL,
        change_field TEXT NOT NULL,
        change_format TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS resource_routes (
        route TEXT PRIMARY KEY,
        resource_id UUID NOT NULL REFERENCES resources(id) ON DELETE CASCADE
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS resource_partitions (
        resource_id UUID NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
        partition_id UUID NOT NULL,
        subscribers INTEGER NOT NULL CHECK (subscribers >= 0),
        PRIMARY KEY (resource_id, partition_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS subscriptions (
        id UUID PRIMARY KEY,
        resource_id UUID NOT NULL REFERENCES resources(id),
        partition_id UUID NOT NULL,
        endpoint JSONB NOT NULL,
        delivery JSONB NOT NULL,
        content JSONB NOT NULL,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_subscriptions_partition
    ON subscriptions(resource_id, partition_id, created_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        resource_id UUID NOT NULL,
        content JSONB NOT NULL,
        revision BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_ledger (
        subscription_id UUID NOT NULL,
        document_id TEXT NOT NULL,
        last_revision BIGINT NOT NULL,
        next_retry_at TIMESTAMPTZ,
        retry_count INTEGER NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (subscription_id, document_id)
    )
    ",
];

const RESOURCE_COLUMNS: &str = "id, addresses, path, change_field, change_format, created_at";
const SUBSCRIPTION_COLUMNS: &str =
    "id, resource_id, partition_id, endpoint, delivery, content, data, created_at";
const DOCUMENT_COLUMNS: &str = "id, resource_id, content, revision, updated_at";

/// Creates the tables if they do not exist yet.
///
/// # Errors
///
/// Returns `Database` if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Repository backend over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl PgStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self { pool, config, clock }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_partitions(&self, resource: &mut Resource) -> Result<()> {
        let rows = sqlx::query(
            "SELECT partition_id, subscribers FROM resource_partitions \
             WHERE resource_id = $1 AND subscribers > 0 ORDER BY partition_id",
        )
        .bind(resource.id)
        .fetch_all(&self.pool)
        .await?;

        resource.partitions = rows
            .iter()
            .map(|row| -> std::result::Result<(PartitionId, u32), sqlx::Error> {
                let partition: PartitionId = row.try_get("partition_id")?;
                let count: i32 = row.try_get("subscribers")?;
                Ok((partition, u32::try_from(count).unwrap_or_default()))
            })
            .collect::<std::result::Result<_, sqlx::Error>>()?;
        Ok(())
    }

    async fn lock_resource(
        tx: &mut Transaction<'static, Postgres>,
        id: ResourceId,
    ) -> Result<()> {
        sqlx::query("SELECT id FROM resources WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("resource {id}")))?;
        Ok(())
    }
}

async fn advisory_lock(tx: &mut Transaction<'static, Postgres>, key: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn resource_from_row(row: &PgRow) -> Result<Resource> {
    Ok(Resource {
        id: row.try_get("id")?,
        addresses: row.try_get::<Json<Vec<String>>, _>("addresses")?.0,
        path: row.try_get("path")?,
        change: ChangeDetection {
            field: row.try_get("change_field")?,
            format: row.try_get("change_format")?,
        },
        partitions: Default::default(),
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        partition: row.try_get("partition_id")?,
        endpoint: row.try_get::<Json<_>, _>("endpoint")?.0,
        delivery: row.try_get::<Json<_>, _>("delivery")?.0,
        content: row.try_get::<Json<_>, _>("content")?.0,
        data: row.try_get::<Json<_>, _>("data")?.0,
        created_at: row.try_get("created_at")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<Document> {
    Ok(Document {
        id: DocumentId(row.try_get("id")?),
        resource_id: row.try_get("resource_id")?,
        content: row.try_get::<Json<_>, _>("content")?.0,
        revision: row.try_get("revision")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait::async_trait]
impl ResourceRepository for PgStore {
    async fn create(&self, resource: &Resource) -> Result<()> {
        let routes = resolver::route_keys(resource)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO resources ({RESOURCE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(resource.id)
        .bind(Json(&resource.addresses))
        .bind(&resource.path)
        .bind(&resource.change.field)
        .bind(&resource.change.format)
        .bind(resource.created_at)
        .execute(&mut *tx)
        .await?;

        for route in routes {
            sqlx::query("INSERT INTO resource_routes (route, resource_id) VALUES ($1, $2)")
                .bind(&route)
                .bind(resource.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| match CoreError::from(e) {
                    CoreError::AlreadyExists(_) => CoreError::already_exists(format!("route {route}")),
                    other => other,
                })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: ResourceId) -> Result<Resource> {
        let row = sqlx::query(&format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("resource {id}")))?;

        let mut resource = resource_from_row(&row)?;
        self.load_partitions(&mut resource).await?;
        Ok(resource)
    }

    async fn find_by_uri(&self, uri: &str) -> Result<Resource> {
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        let candidates = rows.iter().map(resource_from_row).collect::<Result<Vec<_>>>()?;

        let id = resolver::resolve(&candidates, uri)
            .map(|resource| resource.id)
            .ok_or_else(|| CoreError::not_found(format!("no resource matches {uri}")))?;
        ResourceRepository::find_by_id(self, id).await
    }

    async fn partitions(&self, id: ResourceId) -> Result<Vec<PartitionId>> {
        let resource = ResourceRepository::find_by_id(self, id).await?;
        Ok(resource.partitions.keys().copied().collect())
    }

    async fn join_partition(&self, id: ResourceId) -> Result<PartitionId> {
        let mut tx = self.pool.begin().await?;
        Self::lock_resource(&mut tx, id).await?;

        let limit = i32::try_from(self.config.partition_limit).unwrap_or(i32::MAX);
        let open: Option<PartitionId> = sqlx::query_scalar(
            "SELECT partition_id FROM resource_partitions \
             WHERE resource_id = $1 AND subscribers < $2 ORDER BY partition_id LIMIT 1",
        )
        .bind(id)
        .bind(limit)
        .fetch_optional(&mut *tx)
        .await?;

        let partition = match open {
            Some(partition) => {
                sqlx::query(
                    "UPDATE resource_partitions SET subscribers = subscribers + 1 \
                     WHERE resource_id = $1 AND partition_id = $2",
                )
                .bind(id)
                .bind(partition)
                .execute(&mut *tx)
                .await?;
                partition
            },
            None => {
                let partition = PartitionId::new();
                sqlx::query(
                    "INSERT INTO resource_partitions (resource_id, partition_id, subscribers) \
                     VALUES ($1, $2, 1)",
                )
                .bind(id)
                .bind(partition)
                .execute(&mut *tx)
                .await?;
                partition
            },
        };

        tx.commit().await?;
        tracing::debug!(resource_id = %id, partition = %partition, "joined partition");
        Ok(partition)
    }

    async fn leave_partition(&self, id: ResourceId, partition: PartitionId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_resource(&mut tx, id).await?;

        let remaining: i32 = sqlx::query_scalar(
            "UPDATE resource_partitions SET subscribers = subscribers - 1 \
             WHERE resource_id = $1 AND partition_id = $2 AND subscribers > 0 \
             RETURNING subscribers",
        )
        .bind(id)
        .bind(partition)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("partition {partition} of resource {id}")))?;

        if remaining == 0 {
            sqlx::query(
                "DELETE FROM resource_partitions WHERE resource_id = $1 AND partition_id = $2",
            )
            .bind(id)
            .bind(partition)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(resource_id = %id, partition = %partition, "left partition");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SubscriptionRepository for PgStore {
    async fn create(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(subscription.id)
        .bind(subscription.resource_id)
        .bind(subscription.partition)
        .bind(Json(&subscription.endpoint))
        .bind(Json(&subscription.delivery))
        .bind(Json(&subscription.content))
        .bind(Json(&subscription.data))
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: SubscriptionId) -> Result<Subscription> {
        let row =
            sqlx::query(&format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("subscription {id}")))?;
        subscription_from_row(&row)
    }

    async fn delete(&self, id: SubscriptionId) -> Result<Subscription> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "DELETE FROM subscriptions WHERE id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("subscription {id}")))?;

        sqlx::query("DELETE FROM delivery_ledger WHERE subscription_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        subscription_from_row(&row)
    }

    async fn find_by_partition(
        &self,
        resource_id: ResourceId,
        partition: PartitionId,
    ) -> Result<SubscriptionStream> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let sql = format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
                 WHERE resource_id = $1 AND partition_id = $2 ORDER BY created_at, id"
            );
            let mut rows = sqlx::query(&sql).bind(resource_id).bind(partition).fetch(&pool);

            while let Some(row) = rows.next().await {
                let item = row.map_err(CoreError::from).and_then(|row| subscription_from_row(&row));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn trigger<'a>(
        &'a self,
        action: Action,
        document: &'a Document,
        subscription: &'a Subscription,
        deliver: DeliverFn<'a>,
    ) -> Result<TriggerOutcome> {
        let key = LedgerKey::new(subscription.id, document.id.clone());
        let mut tx = self.pool.begin().await?;
        advisory_lock(&mut tx, &format!("ledger:{key}")).await?;

        let ledger = PgLedger { tx: Mutex::new(tx) };
        let outcome =
            ledger::trigger(&ledger, self.clock.as_ref(), action, document, subscription, deliver)
                .await;

        // Failure bookkeeping is written even when the delivery failed.
        ledger.tx.into_inner().commit().await?;
        outcome
    }
}

#[async_trait::async_trait]
impl DocumentRepository for PgStore {
    async fn upsert(&self, document: Document) -> Result<DocumentWrite> {
        let mut tx = self.pool.begin().await?;
        advisory_lock(&mut tx, &format!("document:{}", document.id)).await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM documents WHERE id = $1")
                .bind(document.id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        let write = match current {
            None => DocumentWrite::Created,
            Some(current) if document.revision > current => {
                DocumentWrite::Advanced { previous: current }
            },
            Some(current) if document.revision == current => DocumentWrite::Unchanged,
            Some(current) => DocumentWrite::Stale { current },
        };

        if matches!(write, DocumentWrite::Created | DocumentWrite::Advanced { .. }) {
            sqlx::query(&format!(
                "INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO UPDATE SET resource_id = EXCLUDED.resource_id, \
                 content = EXCLUDED.content, revision = EXCLUDED.revision, \
                 updated_at = EXCLUDED.updated_at"
            ))
            .bind(document.id.as_str())
            .bind(document.resource_id)
            .bind(Json(&document.content))
            .bind(document.revision)
            .bind(document.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(write)
    }

    async fn find_by_id(&self, id: &DocumentId) -> Result<Document> {
        let row = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("document {id}")))?;
        document_from_row(&row)
    }

    async fn delete(&self, id: &DocumentId) -> Result<Document> {
        let row = sqlx::query(&format!(
            "DELETE FROM documents WHERE id = $1 RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("document {id}")))?;
        document_from_row(&row)
    }
}

/// Ledger access bound to the transaction holding the pair's advisory lock.
struct PgLedger {
    tx: Mutex<Transaction<'static, Postgres>>,
}

#[async_trait::async_trait]
impl LedgerStore for PgLedger {
    async fn find_document(&self, id: &DocumentId) -> Result<Document> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("document {id}")))?;
        document_from_row(&row)
    }

    async fn find_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        let mut tx = self.tx.lock().await;
        let row = sqlx::query(
            "SELECT subscription_id, document_id, last_revision, next_retry_at, retry_count, \
             updated_at FROM delivery_ledger WHERE subscription_id = $1 AND document_id = $2",
        )
        .bind(key.subscription_id)
        .bind(key.document_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| -> Result<LedgerEntry> {
            let retry_count: i32 = row.try_get("retry_count")?;
            Ok(LedgerEntry {
                subscription_id: row.try_get("subscription_id")?,
                document_id: DocumentId(row.try_get("document_id")?),
                last_revision: row.try_get("last_revision")?,
                next_retry_at: row.try_get("next_retry_at")?,
                retry_count: u32::try_from(retry_count).unwrap_or_default(),
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let mut tx = self.tx.lock().await;
        sqlx::query(
            "INSERT INTO delivery_ledger \
             (subscription_id, document_id, last_revision, next_retry_at, retry_count, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (subscription_id, document_id) DO UPDATE SET \
             last_revision = EXCLUDED.last_revision, next_retry_at = EXCLUDED.next_retry_at, \
             retry_count = EXCLUDED.retry_count, updated_at = EXCLUDED.updated_at",
        )
        .bind(entry.subscription_id)
        .bind(entry.document_id.as_str())
        .bind(entry.last_revision)
        .bind(entry.next_retry_at)
        .bind(i32::try_from(entry.retry_count).unwrap_or(i32::MAX))
        .bind(entry.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn remove_entry(&self, key: &LedgerKey) -> Result<()> {
        let mut tx = self.tx.lock().await;
        sqlx::query("DELETE FROM delivery_ledger WHERE subscription_id = $1 AND document_id = $2")
            .bind(key.subscription_id)
            .bind(key.document_id.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
