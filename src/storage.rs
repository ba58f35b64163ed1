/// SQLite persistence layer
///
/// Stores deployments, process definitions, the append-only history log and
/// the state of running instances with their open tasks. Definitions,
/// instances and tasks are stored as JSON (like the rest of the engine state)
/// with indexed lookup columns; history events get a monotonically increasing
/// sequence number from SQLite.

use crate::process::types::{Deployment, ProcessDefinition};
use crate::runtime::history::{HistoryEvent, HistoryEventType};
use crate::runtime::tasks::Task;
use crate::runtime::types::ProcessInstance;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions},
    Row,
};
use std::str::FromStr;

/// Instance state written in the same transaction as a batch of history events
#[derive(Debug, Clone, Copy)]
pub struct InstanceSnapshot<'a> {
    pub instance: &'a ProcessInstance,
    /// Task finished by this transition
    pub removed_task: Option<&'a str>,
    pub created_tasks: &'a [Task],
}

/// SQLite-backed storage shared by the definition registry and history log
#[derive(Debug, Clone)]
pub struct ProcessStorage {
    /// SQLite connection pool
    pool: SqlitePool,
}

impl ProcessStorage {
    /// Open (creating if missing) the database at `url` and initialise the schema
    ///
    /// In-memory URLs get a single long-lived connection, otherwise every pooled
    /// connection would see its own empty database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| anyhow::anyhow!("Invalid database url '{}': {}", url, e))?
            .create_if_missing(true);

        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Fresh private in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Initialize the storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                deploy_time TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // UNIQUE(key, version) backs up the registry's deploy lock
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS process_definitions (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                version INTEGER NOT NULL,
                deployment_id TEXT NOT NULL REFERENCES deployments(id),
                definition JSON NOT NULL,
                UNIQUE(key, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_instance ON history_events(instance_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        // Running instances only; a row is dropped when its instance ends
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS process_instances (
                id TEXT PRIMARY KEY,
                definition_id TEXT NOT NULL,
                state JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                assignee TEXT,
                task JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_instance ON tasks(instance_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Persist a deployment together with all definitions it produced
    ///
    /// Runs in one transaction: either the whole deployment is stored or nothing.
    pub async fn save_deployment(
        &self,
        deployment: &Deployment,
        definitions: &[ProcessDefinition],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO deployments (id, name, deploy_time) VALUES (?, ?, ?)")
            .bind(&deployment.id)
            .bind(&deployment.name)
            .bind(deployment.deploy_time.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        for definition in definitions {
            let definition_json = serde_json::to_string(definition)?;
            sqlx::query(
                r#"
                INSERT INTO process_definitions (id, key, version, deployment_id, definition)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&definition.id)
            .bind(&definition.key)
            .bind(definition.version)
            .bind(&definition.deployment_id)
            .bind(&definition_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load every stored definition, ordered by key then version
    pub async fn load_definitions(&self) -> Result<Vec<ProcessDefinition>> {
        let rows = sqlx::query("SELECT definition FROM process_definitions ORDER BY key, version")
            .fetch_all(&self.pool)
            .await?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            let definition_json: String = row.get("definition");
            definitions.push(serde_json::from_str(&definition_json)?);
        }
        Ok(definitions)
    }

    /// Append history events in one transaction, returning them with sequence numbers
    ///
    /// With a snapshot, the instance row and its task rows are updated in the
    /// same transaction: upserted while running, deleted once the instance ended.
    pub async fn append_history(
        &self,
        events: Vec<HistoryEvent>,
        snapshot: Option<InstanceSnapshot<'_>>,
    ) -> Result<Vec<HistoryEvent>> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(events.len());

        for mut event in events {
            event.seq = insert_event(&mut *tx, &event).await?;
            stored.push(event);
        }

        if let Some(snapshot) = snapshot {
            save_snapshot(&mut *tx, snapshot).await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// Every instance that has not ended yet
    pub async fn load_running_instances(&self) -> Result<Vec<ProcessInstance>> {
        let rows = sqlx::query("SELECT state FROM process_instances ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.get("state");
            instances.push(serde_json::from_str(&state)?);
        }
        Ok(instances)
    }

    /// Every open user task
    pub async fn load_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT task FROM tasks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let task: String = row.get("task");
            tasks.push(serde_json::from_str(&task)?);
        }
        Ok(tasks)
    }

    /// All history events of one instance in insertion order
    pub async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, instance_id, event_type, timestamp, payload
            FROM history_events
            WHERE instance_id = ?
            ORDER BY seq
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_type: String = row.get("event_type");
            let timestamp: String = row.get("timestamp");
            let payload: String = row.get("payload");

            events.push(HistoryEvent {
                seq: row.get("seq"),
                instance_id: row.get("instance_id"),
                event_type: HistoryEventType::from_str(&event_type)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(events)
    }
}

async fn insert_event(conn: &mut SqliteConnection, event: &HistoryEvent) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO history_events (instance_id, event_type, timestamp, payload)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&event.instance_id)
    .bind(event.event_type.as_str())
    .bind(event.timestamp.to_rfc3339())
    .bind(serde_json::to_string(&event.payload)?)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn save_snapshot(conn: &mut SqliteConnection, snapshot: InstanceSnapshot<'_>) -> Result<()> {
    let instance = snapshot.instance;

    if let Some(task_id) = snapshot.removed_task {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
    }

    if instance.ended {
        sqlx::query("DELETE FROM tasks WHERE instance_id = ?")
            .bind(&instance.id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM process_instances WHERE id = ?")
            .bind(&instance.id)
            .execute(&mut *conn)
            .await?;
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO process_instances (id, definition_id, state)
        VALUES (?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET state = excluded.state
        "#,
    )
    .bind(&instance.id)
    .bind(&instance.definition_id)
    .bind(serde_json::to_string(instance)?)
    .execute(&mut *conn)
    .await?;

    for task in snapshot.created_tasks {
        sqlx::query("INSERT INTO tasks (id, instance_id, assignee, task) VALUES (?, ?, ?, ?)")
            .bind(&task.id)
            .bind(&task.process_instance_id)
            .bind(&task.assignee)
            .bind(serde_json::to_string(task)?)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}
