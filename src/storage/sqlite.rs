//! SQLite storage backend.
//!
//! Claims and state changes are single conditional `UPDATE` statements, so
//! any number of processes may share the database file. Timestamps are
//! stored as unix milliseconds.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{
    sqlite::{
        SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    query::Query,
    QueryBuilder, Sqlite, SqlitePool,
};
use tokio_stream::StreamExt;

use crate::{
    config::Config,
    error::{Error, Result},
    message::{MediumMessage, MessageId, MessageKind, Status},
    serializer::{JsonSerializer, Serializer},
    state::to_chrono,
};

use super::{
    DataStorage, DelayedQuery, MessageQuery, RetryQuery, ScheduleCallback, StateGuard,
    Statistics, StoreOutcome,
};

const COLUMNS: &str = "id, content, retries, added, expires_at, due_at, status, exception";

fn table(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Published => "published",
        MessageKind::Received => "received",
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| Error::decode(format!("timestamp {ms}")))
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    content: Vec<u8>,
    retries: i64,
    added: i64,
    expires_at: Option<i64>,
    due_at: i64,
    status: Status,
    exception: Option<String>,
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    serializer: Arc<dyn Serializer>,
}

impl SqliteStorage {
    /// Opens (creating if missing) the database at `config.db_path()` and
    /// runs migrations.
    pub async fn connect(config: &Config) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(Duration::from_secs(5))
            .optimize_on_close(true, None);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::from_pool(pool).await
    }

    /// Uses an existing pool. Migrations are applied before returning.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            serializer: Arc::new(JsonSerializer),
        })
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode(&self, row: MessageRow) -> Result<MediumMessage> {
        Ok(MediumMessage {
            id: MessageId::new(row.id),
            origin: self.serializer.deserialize_content(&row.content)?,
            content: row.content.into(),
            added: from_millis(row.added)?,
            expires_at: row.expires_at.map(from_millis).transpose()?,
            due_at: from_millis(row.due_at)?,
            retries: u32::try_from(row.retries).unwrap_or_default(),
            status: row.status,
            exception: row.exception,
        })
    }

    fn decode_all(&self, rows: Vec<MessageRow>) -> Result<Vec<MediumMessage>> {
        rows.into_iter().map(|row| self.decode(row)).collect()
    }
}

fn bind_published<'q>(
    sql: &'q str,
    message: &'q MediumMessage,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    sqlx::query(sql)
        .bind(message.id.get())
        .bind(message.name())
        .bind(message.group())
        .bind(&message.content[..])
        .bind(i64::from(message.retries))
        .bind(to_millis(message.added))
        .bind(message.expires_at.map(to_millis))
        .bind(to_millis(message.due_at))
        .bind(message.status)
        .bind(message.exception.as_deref())
}

const INSERT_PUBLISHED: &str = "
    INSERT INTO published
        (id, name, group_name, content, retries, added, expires_at, due_at, status, exception)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
";

const INSERT_RECEIVED: &str = "
    INSERT INTO received
        (id, name, group_name, content, retries, added, expires_at, due_at, status, exception, message_id)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (message_id, group_name) DO NOTHING
";

impl SqliteStorage {
    async fn insert_received(&self, message: &MediumMessage) -> Result<bool> {
        let origin = message.origin.id().ok().map(MessageId::get);
        let result = bind_published(INSERT_RECEIVED, message)
            .bind(origin)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl DataStorage for SqliteStorage {
    type Transaction = sqlx::Transaction<'static, Sqlite>;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Transaction>> {
        Box::pin(async move { Ok(self.pool.begin().await?) })
    }

    fn commit(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Ok(tx.commit().await?) })
    }

    fn rollback(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Ok(tx.rollback().await?) })
    }

    fn store_message<'a>(
        &'a self,
        message: &'a MediumMessage,
        tx: Option<&'a mut Self::Transaction>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query = bind_published(INSERT_PUBLISHED, message);
            match tx {
                Some(tx) => query.execute(&mut **tx).await?,
                None => query.execute(&self.pool).await?,
            };
            Ok(())
        })
    }

    fn store_received_message<'a>(
        &'a self,
        message: &'a MediumMessage,
    ) -> BoxFuture<'a, Result<StoreOutcome>> {
        Box::pin(async move {
            message.origin.id()?;
            Ok(if self.insert_received(message).await? {
                StoreOutcome::Stored
            } else {
                StoreOutcome::Duplicate
            })
        })
    }

    fn store_received_exception_message<'a>(
        &'a self,
        message: &'a MediumMessage,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.insert_received(message).await? {
                tracing::debug!(message_id = %message.id, "Exception row already recorded");
            }
            Ok(())
        })
    }

    fn claim<'a>(
        &'a self,
        kind: MessageKind,
        id: MessageId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<MediumMessage>>> {
        Box::pin(async move {
            let sql = format!(
                "
                UPDATE {table}
                SET status = $1, due_at = $2, expires_at = NULL
                WHERE id = $3
                    AND status IN ('scheduled', 'queued', 'delayed', 'processing')
                    AND due_at <= $4
                RETURNING {COLUMNS}
                ",
                table = table(kind),
            );

            let row: Option<MessageRow> = sqlx::query_as(&sql)
                .bind(Status::Processing)
                .bind(to_millis(lease_until))
                .bind(id.get())
                .bind(to_millis(now))
                .fetch_optional(&self.pool)
                .await?;

            row.map(|row| self.decode(row)).transpose()
        })
    }

    fn change_state<'a>(
        &'a self,
        kind: MessageKind,
        message: &'a MediumMessage,
        guard: StateGuard,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let sql = format!(
                "
                UPDATE {table}
                SET status = $1,
                    retries = MAX(retries, $2),
                    expires_at = $3,
                    due_at = $4,
                    exception = $5
                WHERE id = $6
                    AND status = $7
                    AND due_at = $8
                    AND status NOT IN ('succeeded', 'failed')
                ",
                table = table(kind),
            );

            let result = sqlx::query(&sql)
                .bind(message.status)
                .bind(i64::from(message.retries))
                .bind(message.expires_at.map(to_millis))
                .bind(to_millis(message.due_at))
                .bind(message.exception.as_deref())
                .bind(message.id.get())
                .bind(guard.status)
                .bind(to_millis(guard.due_at))
                .execute(&self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn get_messages_of_need_retry(
        &self,
        kind: MessageKind,
        query: RetryQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>> {
        Box::pin(async move {
            let sql = format!(
                "
                SELECT {COLUMNS} FROM {table}
                WHERE status IN ('scheduled', 'processing')
                    AND due_at <= $1
                    AND retries < $2
                    AND added <= $3
                ORDER BY id
                LIMIT $4
                ",
                table = table(kind),
            );

            let mut stream = sqlx::query_as::<_, MessageRow>(&sql)
                .bind(to_millis(query.now))
                .bind(i64::from(query.max_retries))
                .bind(to_millis(query.added_before))
                .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
                .fetch(&self.pool);

            // One corrupt row must not stall the whole sweep.
            let mut messages = Vec::new();
            while let Some(row) = stream.next().await.transpose()? {
                let id = row.id;
                match self.decode(row) {
                    Ok(message) => messages.push(message),
                    Err(e) => tracing::error!(message_id = id, %kind, error = %e, "Skipping undecodable row"),
                }
            }

            Ok(messages)
        })
    }

    fn delete_expires(
        &self,
        kind: MessageKind,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let sql = format!(
                "
                DELETE FROM {table} WHERE id IN (
                    SELECT id FROM {table}
                    WHERE status IN ('succeeded', 'failed') AND expires_at < $1
                    LIMIT $2
                )
                ",
                table = table(kind),
            );

            let result = sqlx::query(&sql)
                .bind(to_millis(now))
                .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
                .execute(&self.pool)
                .await?;

            Ok(result.rows_affected())
        })
    }

    fn schedule_messages_of_delayed<'a>(
        &'a self,
        query: DelayedQuery,
        callback: ScheduleCallback<'a>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let rows: Vec<MessageRow> = sqlx::query_as(&format!(
                "
                SELECT {COLUMNS} FROM published
                WHERE (status = 'delayed' AND due_at <= $1)
                    OR (status = 'queued' AND due_at < $2)
                ORDER BY id
                LIMIT $3
                "
            ))
            .bind(to_millis(query.lookahead_until))
            .bind(to_millis(query.queued_stale_before))
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

            let mut promoted = Vec::with_capacity(rows.len());
            for row in rows {
                let mut message = self.decode(row)?;
                let next = match message.status {
                    Status::Delayed if message.due_at > query.now => Status::Queued,
                    _ => Status::Scheduled,
                };

                let result = sqlx::query(
                    "UPDATE published SET status = $1, expires_at = NULL WHERE id = $2 AND status = $3",
                )
                .bind(next)
                .bind(message.id.get())
                .bind(message.status)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() > 0 {
                    message.status = next;
                    message.expires_at = None;
                    promoted.push(message);
                }
            }

            tx.commit().await?;

            let count = promoted.len();
            for message in promoted {
                callback(message);
            }
            Ok(count)
        })
    }

    fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        instance: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let now = Utc::now();
            let result = sqlx::query(
                "
                INSERT INTO locks (key, instance, expires_at) VALUES ($1, $2, $3)
                ON CONFLICT (key) DO UPDATE
                SET instance = excluded.instance, expires_at = excluded.expires_at
                WHERE locks.instance = excluded.instance OR locks.expires_at <= $4
                ",
            )
            .bind(key)
            .bind(instance)
            .bind(to_millis(now + to_chrono(ttl)))
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn renew_lock<'a>(
        &'a self,
        key: &'a str,
        instance: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let result =
                sqlx::query("UPDATE locks SET expires_at = $1 WHERE key = $2 AND instance = $3")
                    .bind(to_millis(Utc::now() + to_chrono(ttl)))
                    .bind(key)
                    .bind(instance)
                    .execute(&self.pool)
                    .await?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn release_lock<'a>(&'a self, key: &'a str, instance: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM locks WHERE key = $1 AND instance = $2")
                .bind(key)
                .bind(instance)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn get_message(
        &self,
        kind: MessageKind,
        id: MessageId,
    ) -> BoxFuture<'_, Result<Option<MediumMessage>>> {
        Box::pin(async move {
            let row: Option<MessageRow> = sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM {table} WHERE id = $1",
                table = table(kind)
            ))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;

            row.map(|row| self.decode(row)).transpose()
        })
    }

    fn query_messages(
        &self,
        kind: MessageKind,
        query: MessageQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>> {
        Box::pin(async move {
            let mut builder =
                QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM {} WHERE 1 = 1", table(kind)));

            if let Some(status) = query.status {
                builder.push(" AND status = ").push_bind(status);
            }
            if let Some(name) = query.name {
                builder.push(" AND name = ").push_bind(name);
            }
            if let Some(group) = query.group {
                builder.push(" AND group_name = ").push_bind(group);
            }
            builder.push(" ORDER BY id DESC");
            if let Some(limit) = query.limit {
                builder
                    .push(" LIMIT ")
                    .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
            }

            let rows: Vec<MessageRow> = builder.build_query_as().fetch_all(&self.pool).await?;

            self.decode_all(rows)
        })
    }

    fn statistics(&self) -> BoxFuture<'_, Result<Statistics>> {
        Box::pin(async move {
            let mut stats = Statistics::default();
            for kind in [MessageKind::Published, MessageKind::Received] {
                let counts: Vec<(Status, i64)> = sqlx::query_as(&format!(
                    "SELECT status, COUNT(*) FROM {} GROUP BY status",
                    table(kind)
                ))
                .fetch_all(&self.pool)
                .await?;

                let target = match kind {
                    MessageKind::Published => &mut stats.published,
                    MessageKind::Received => &mut stats.received,
                };
                target.extend(
                    counts
                        .into_iter()
                        .map(|(status, count)| (status, u64::try_from(count).unwrap_or_default())),
                );
            }
            Ok(stats)
        })
    }
}
