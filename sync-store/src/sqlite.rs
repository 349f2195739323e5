//! SQLite storage backend.

use crate::config::StorageConfig;
use crate::error::{DbError, DbResult};
use crate::events::{Event, EventBus};
use crate::store::{CommitCallback, MessageStore, Transaction};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Sqlite;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use sync_types::{
    ClientId, ContactId, Group, GroupId, Message, MessageId, MessageState, Metadata,
};

/// SQLite-based message storage.
///
/// Uses WAL mode for concurrent reads/writes. Cheap to clone; clones share
/// the connection pool and event bus.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    events: EventBus,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("connections", &self.pool.size())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// An open SQLite transaction.
pub struct SqliteTransaction {
    inner: sqlx::Transaction<'static, Sqlite>,
    read_only: bool,
    on_commit: Vec<CommitCallback>,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("read_only", &self.read_only)
            .field("on_commit", &self.on_commit.len())
            .finish_non_exhaustive()
    }
}

impl Transaction for SqliteTransaction {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn attach(&mut self, callback: CommitCallback) {
        self.on_commit.push(callback);
    }
}

impl SqliteTransaction {
    fn ensure_writable(&self) -> DbResult<()> {
        if self.read_only {
            Err(DbError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl SqliteStore {
    /// Open (or create) the database file named in the configuration.
    pub async fn new(config: &StorageConfig, events: EventBus) -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.database)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool, events };
        store.run_migrations().await?;
        tracing::info!("Opened message store at {}", config.database.display());
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    ///
    /// Uses a single connection that is never recycled, since every
    /// in-memory connection is its own database.
    pub async fn in_memory(events: EventBus) -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let store = Self { pool, events };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> DbResult<()> {
        // Create tables
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                group_id BLOB PRIMARY KEY,
                client_id TEXT NOT NULL,
                major_version INTEGER NOT NULL,
                descriptor BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id BLOB PRIMARY KEY,
                group_id BLOB NOT NULL REFERENCES groups (group_id) ON DELETE CASCADE,
                timestamp INTEGER NOT NULL,
                state INTEGER NOT NULL,
                shared INTEGER NOT NULL DEFAULT 0,
                body BLOB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_metadata (
                message_id BLOB NOT NULL REFERENCES messages (message_id) ON DELETE CASCADE,
                meta_key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (message_id, meta_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // dependency_id is not a foreign key: dependencies may arrive later
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_dependencies (
                group_id BLOB NOT NULL,
                message_id BLOB NOT NULL REFERENCES messages (message_id) ON DELETE CASCADE,
                dependency_id BLOB NOT NULL,
                PRIMARY KEY (message_id, dependency_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_state ON messages(state)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_group_id ON messages(group_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dependencies_dependency_id ON message_dependencies(dependency_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn attach_event(&self, txn: &mut SqliteTransaction, event: Event) {
        let events = self.events.clone();
        txn.attach(Box::new(move || events.broadcast(&event)));
    }

    /// Store a group. Adding an existing group is a no-op.
    pub async fn add_group(&self, txn: &mut SqliteTransaction, group: &Group) -> DbResult<()> {
        txn.ensure_writable()?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO groups (group_id, client_id, major_version, descriptor)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(group.id.as_bytes().as_slice())
        .bind(group.client_id.as_str())
        .bind(i64::from(group.major_version))
        .bind(group.descriptor.as_slice())
        .execute(&mut *txn.inner)
        .await?;
        Ok(())
    }

    /// Remove a group with all of its messages, metadata and edges.
    pub async fn remove_group(&self, txn: &mut SqliteTransaction, id: &GroupId) -> DbResult<()> {
        txn.ensure_writable()?;
        let result = sqlx::query("DELETE FROM groups WHERE group_id = ?1")
            .bind(id.as_bytes().as_slice())
            .execute(&mut *txn.inner)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NoSuchGroup(*id));
        }

        // Edges recorded by messages of this group are removed by the cascade
        // on messages; nothing else references the group.
        Ok(())
    }

    /// Store a locally authored message as already delivered.
    ///
    /// Broadcasts [`Event::MessageAdded`] with no origin after commit.
    pub async fn add_local_message(
        &self,
        txn: &mut SqliteTransaction,
        message: &Message,
        metadata: &Metadata,
        shared: bool,
    ) -> DbResult<()> {
        txn.ensure_writable()?;
        // Fail with NoSuchGroup rather than a foreign key error
        self.get_group(txn, &message.group_id).await?;

        let inserted = self
            .insert_message(txn, message, MessageState::Delivered, shared)
            .await?;
        if inserted {
            self.merge_message_metadata(txn, &message.id, metadata)
                .await?;
            self.attach_event(
                txn,
                Event::MessageAdded {
                    message: message.clone(),
                    origin: None,
                },
            );
        }
        Ok(())
    }

    /// Store a message received from a peer, unvalidated.
    ///
    /// Returns false if the message was already stored. A new message
    /// broadcasts [`Event::MessageAdded`] with its origin after commit.
    pub async fn receive_message(
        &self,
        txn: &mut SqliteTransaction,
        message: &Message,
        origin: ContactId,
    ) -> DbResult<bool> {
        txn.ensure_writable()?;
        self.get_group(txn, &message.group_id).await?;

        let inserted = self
            .insert_message(txn, message, MessageState::Unknown, false)
            .await?;
        if inserted {
            self.attach_event(
                txn,
                Event::MessageAdded {
                    message: message.clone(),
                    origin: Some(origin),
                },
            );
        } else {
            tracing::debug!("Duplicate message {:?} from contact {}", message.id, origin);
        }
        Ok(inserted)
    }

    async fn insert_message(
        &self,
        txn: &mut SqliteTransaction,
        message: &Message,
        state: MessageState,
        shared: bool,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (message_id, group_id, timestamp, state, shared, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(message.id.as_bytes().as_slice())
        .bind(message.group_id.as_bytes().as_slice())
        .bind(message.timestamp as i64)
        .bind(i64::from(state.code()))
        .bind(i64::from(shared))
        .bind(message.body.as_slice())
        .execute(&mut *txn.inner)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Metadata of a delivered message, as seen by applications.
    ///
    /// Messages in any other state report empty metadata.
    pub async fn get_message_metadata(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<Metadata> {
        if self.get_message_state(txn, id).await? != MessageState::Delivered {
            return Ok(Metadata::new());
        }
        self.get_message_metadata_for_validator(txn, id).await
    }

    /// Whether a message has been marked shared.
    pub async fn is_message_shared(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<bool> {
        let shared: Option<i64> =
            sqlx::query_scalar("SELECT shared FROM messages WHERE message_id = ?1")
                .bind(id.as_bytes().as_slice())
                .fetch_optional(&mut *txn.inner)
                .await?;

        shared
            .map(|flag| flag != 0)
            .ok_or(DbError::NoSuchMessage(*id))
    }

    /// Whether a message row exists (its body may have been erased).
    pub async fn contains_message(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE message_id = ?1")
            .bind(id.as_bytes().as_slice())
            .fetch_one(&mut *txn.inner)
            .await?;
        Ok(count > 0)
    }

    async fn messages_in_state(
        &self,
        txn: &mut SqliteTransaction,
        state: MessageState,
    ) -> DbResult<Vec<MessageId>> {
        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT message_id FROM messages
            WHERE state = ?1 AND body IS NOT NULL
            ORDER BY rowid ASC
            "#,
        )
        .bind(i64::from(state.code()))
        .fetch_all(&mut *txn.inner)
        .await?;

        rows.iter().map(|bytes| decode_message_id(bytes)).collect()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    type Txn = SqliteTransaction;

    async fn begin(&self, read_only: bool) -> DbResult<SqliteTransaction> {
        // A deferred write transaction that upgrades its read lock gets
        // SQLITE_BUSY without waiting on busy_timeout
        let inner = if read_only {
            self.pool.begin().await?
        } else {
            self.pool.begin_with("BEGIN IMMEDIATE").await?
        };
        Ok(SqliteTransaction {
            inner,
            read_only,
            on_commit: Vec::new(),
        })
    }

    async fn commit(&self, txn: SqliteTransaction) -> DbResult<()> {
        let SqliteTransaction {
            inner, on_commit, ..
        } = txn;
        inner.commit().await?;
        for callback in on_commit {
            callback();
        }
        Ok(())
    }

    async fn messages_to_validate(&self, txn: &mut SqliteTransaction) -> DbResult<Vec<MessageId>> {
        self.messages_in_state(txn, MessageState::Unknown).await
    }

    async fn pending_messages(&self, txn: &mut SqliteTransaction) -> DbResult<Vec<MessageId>> {
        self.messages_in_state(txn, MessageState::Pending).await
    }

    async fn messages_to_share(&self, txn: &mut SqliteTransaction) -> DbResult<Vec<MessageId>> {
        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT m.message_id FROM messages AS m
            JOIN message_dependencies AS d ON m.message_id = d.dependency_id
            JOIN messages AS m1 ON d.message_id = m1.message_id
            WHERE m.state = ?1 AND m.shared = 0 AND m1.shared = 1
            "#,
        )
        .bind(i64::from(MessageState::Delivered.code()))
        .fetch_all(&mut *txn.inner)
        .await?;

        rows.iter().map(|bytes| decode_message_id(bytes)).collect()
    }

    async fn get_message(&self, txn: &mut SqliteTransaction, id: &MessageId) -> DbResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT message_id, group_id, timestamp, body
            FROM messages
            WHERE message_id = ?1
            "#,
        )
        .bind(id.as_bytes().as_slice())
        .fetch_optional(&mut *txn.inner)
        .await?
        .ok_or(DbError::NoSuchMessage(*id))?;

        row.try_into()
    }

    async fn get_group(&self, txn: &mut SqliteTransaction, id: &GroupId) -> DbResult<Group> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT group_id, client_id, major_version, descriptor
            FROM groups
            WHERE group_id = ?1
            "#,
        )
        .bind(id.as_bytes().as_slice())
        .fetch_optional(&mut *txn.inner)
        .await?
        .ok_or(DbError::NoSuchGroup(*id))?;

        row.try_into()
    }

    async fn get_message_state(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<MessageState> {
        let code: Option<i64> =
            sqlx::query_scalar("SELECT state FROM messages WHERE message_id = ?1")
                .bind(id.as_bytes().as_slice())
                .fetch_optional(&mut *txn.inner)
                .await?;

        decode_state(code.ok_or(DbError::NoSuchMessage(*id))?)
    }

    async fn set_message_state(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
        state: MessageState,
    ) -> DbResult<()> {
        txn.ensure_writable()?;
        let result = sqlx::query("UPDATE messages SET state = ?1 WHERE message_id = ?2")
            .bind(i64::from(state.code()))
            .bind(id.as_bytes().as_slice())
            .execute(&mut *txn.inner)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NoSuchMessage(*id));
        }

        self.attach_event(
            txn,
            Event::MessageStateChanged {
                message_id: *id,
                state,
            },
        );
        Ok(())
    }

    async fn get_message_dependencies(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<HashMap<MessageId, MessageState>> {
        // Missing dependencies and those in other groups have no joined state
        let rows = sqlx::query_as::<_, (Vec<u8>, Option<i64>)>(
            r#"
            SELECT d.dependency_id, m.state
            FROM message_dependencies AS d
            LEFT JOIN messages AS m
              ON m.message_id = d.dependency_id AND m.group_id = d.group_id
            WHERE d.message_id = ?1
            "#,
        )
        .bind(id.as_bytes().as_slice())
        .fetch_all(&mut *txn.inner)
        .await?;

        rows.into_iter()
            .map(|(dependency, code)| {
                let state = match code {
                    Some(code) => decode_state(code)?,
                    None => MessageState::Unknown,
                };
                Ok((decode_message_id(&dependency)?, state))
            })
            .collect()
    }

    async fn get_message_dependents(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<HashMap<MessageId, MessageState>> {
        // Only edges whose dependency exists in the dependent's group
        let rows = sqlx::query_as::<_, (Vec<u8>, i64)>(
            r#"
            SELECT d.message_id, m.state
            FROM message_dependencies AS d
            JOIN messages AS m ON m.message_id = d.message_id
            JOIN messages AS dep
              ON dep.message_id = d.dependency_id AND dep.group_id = d.group_id
            WHERE d.dependency_id = ?1
            "#,
        )
        .bind(id.as_bytes().as_slice())
        .fetch_all(&mut *txn.inner)
        .await?;

        rows.into_iter()
            .map(|(dependent, code)| Ok((decode_message_id(&dependent)?, decode_state(code)?)))
            .collect()
    }

    async fn get_message_metadata_for_validator(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<Metadata> {
        let rows = sqlx::query_as::<_, (String, Vec<u8>)>(
            "SELECT meta_key, value FROM message_metadata WHERE message_id = ?1",
        )
        .bind(id.as_bytes().as_slice())
        .fetch_all(&mut *txn.inner)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn merge_message_metadata(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
        metadata: &Metadata,
    ) -> DbResult<()> {
        txn.ensure_writable()?;
        // Fail with NoSuchMessage rather than a foreign key error
        self.get_message_state(txn, id).await?;

        for (key, value) in metadata.iter() {
            if value.is_empty() {
                sqlx::query("DELETE FROM message_metadata WHERE message_id = ?1 AND meta_key = ?2")
                    .bind(id.as_bytes().as_slice())
                    .bind(key)
                    .execute(&mut *txn.inner)
                    .await?;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO message_metadata (message_id, meta_key, value)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(message_id, meta_key) DO UPDATE SET value = excluded.value
                    "#,
                )
                .bind(id.as_bytes().as_slice())
                .bind(key)
                .bind(value)
                .execute(&mut *txn.inner)
                .await?;
            }
        }
        Ok(())
    }

    async fn set_message_shared(&self, txn: &mut SqliteTransaction, id: &MessageId) -> DbResult<()> {
        txn.ensure_writable()?;
        self.get_message_state(txn, id).await?;

        let result =
            sqlx::query("UPDATE messages SET shared = 1 WHERE message_id = ?1 AND shared = 0")
                .bind(id.as_bytes().as_slice())
                .execute(&mut *txn.inner)
                .await?;

        if result.rows_affected() == 1 {
            self.attach_event(txn, Event::MessageShared { message_id: *id });
        }
        Ok(())
    }

    async fn delete_message(&self, txn: &mut SqliteTransaction, id: &MessageId) -> DbResult<()> {
        txn.ensure_writable()?;
        sqlx::query("UPDATE messages SET body = NULL WHERE message_id = ?1")
            .bind(id.as_bytes().as_slice())
            .execute(&mut *txn.inner)
            .await?;
        Ok(())
    }

    async fn delete_message_metadata(
        &self,
        txn: &mut SqliteTransaction,
        id: &MessageId,
    ) -> DbResult<()> {
        txn.ensure_writable()?;
        sqlx::query("DELETE FROM message_metadata WHERE message_id = ?1")
            .bind(id.as_bytes().as_slice())
            .execute(&mut *txn.inner)
            .await?;
        Ok(())
    }

    async fn add_message_dependencies(
        &self,
        txn: &mut SqliteTransaction,
        dependent: &Message,
        dependencies: &BTreeSet<MessageId>,
    ) -> DbResult<()> {
        txn.ensure_writable()?;
        self.get_message_state(txn, &dependent.id).await?;

        for dependency in dependencies {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO message_dependencies (group_id, message_id, dependency_id)
                VALUES (?1, ?2, ?3)
                "#,
            )
            .bind(dependent.group_id.as_bytes().as_slice())
            .bind(dependent.id.as_bytes().as_slice())
            .bind(dependency.as_bytes().as_slice())
            .execute(&mut *txn.inner)
            .await?;
        }
        Ok(())
    }
}

fn decode_message_id(bytes: &[u8]) -> DbResult<MessageId> {
    MessageId::from_bytes(bytes)
        .ok_or_else(|| DbError::Corrupt(format!("invalid message id: {}", hex::encode(bytes))))
}

fn decode_group_id(bytes: &[u8]) -> DbResult<GroupId> {
    GroupId::from_bytes(bytes)
        .ok_or_else(|| DbError::Corrupt(format!("invalid group id: {}", hex::encode(bytes))))
}

fn decode_state(code: i64) -> DbResult<MessageState> {
    u8::try_from(code)
        .ok()
        .and_then(|code| MessageState::try_from(code).ok())
        .ok_or_else(|| DbError::Corrupt(format!("invalid message state: {}", code)))
}

/// Internal row type for message queries.
#[derive(sqlx::FromRow)]
struct MessageRow {
    message_id: Vec<u8>,
    group_id: Vec<u8>,
    timestamp: i64,
    body: Option<Vec<u8>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = DbError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let id = decode_message_id(&row.message_id)?;
        Ok(Message {
            id,
            group_id: decode_group_id(&row.group_id)?,
            timestamp: row.timestamp as u64,
            body: row.body.ok_or(DbError::MessageDeleted(id))?,
        })
    }
}

/// Internal row type for group queries.
#[derive(sqlx::FromRow)]
struct GroupRow {
    group_id: Vec<u8>,
    client_id: String,
    major_version: i64,
    descriptor: Vec<u8>,
}

impl TryFrom<GroupRow> for Group {
    type Error = DbError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        Ok(Group {
            id: decode_group_id(&row.group_id)?,
            client_id: ClientId::new(row.client_id),
            major_version: u32::try_from(row.major_version).map_err(|_| {
                DbError::Corrupt(format!("invalid major version: {}", row.major_version))
            })?,
            descriptor: row.descriptor,
        })
    }
}
