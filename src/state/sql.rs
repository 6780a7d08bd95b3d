//! Relational desired-state store.
//!
//! Desired state lives in an append-only `deployments` table. Every change to
//! a deployment appends a row; removing one appends a `decommissioned` row
//! holding its last configuration. The current state of a deployment is its
//! highest revision, if that revision is `active`. Rows are never updated or
//! deleted, so any earlier configuration can be read back for audit or
//! rollback.
//!
//! A write reads the current state, diffs it against the new state and
//! appends the resulting rows inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{ConvergeError, Result, StorageError};
use crate::model::{Cluster, ClusterKind, Defs, Deployment, DeploymentId, Deployments, State};

use super::store::{
    HistoryRow, Lifecycle, StateManager, User, WriteSummary, plan_write, prepare_write,
};

/// Default number of pooled connections.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS clusters (
    cluster_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    base_url TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS components (
    component_id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo TEXT NOT NULL,
    dir TEXT NOT NULL,
    flavor TEXT NOT NULL,
    UNIQUE (repo, dir, flavor)
);

CREATE TABLE IF NOT EXISTS owners (
    owner_id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS component_owners (
    component_id INTEGER NOT NULL REFERENCES components (component_id),
    owner_id INTEGER NOT NULL REFERENCES owners (owner_id),
    PRIMARY KEY (component_id, owner_id)
);

CREATE TABLE IF NOT EXISTS deployments (
    deployment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    component_id INTEGER NOT NULL REFERENCES components (component_id),
    cluster_id INTEGER NOT NULL REFERENCES clusters (cluster_id),
    versionstring TEXT NOT NULL,
    num_instances INTEGER NOT NULL,
    schedule_string TEXT NOT NULL,
    kind TEXT NOT NULL,
    lifecycle TEXT NOT NULL CHECK (lifecycle IN ('active', 'decommissioned')),
    config TEXT NOT NULL,
    written_by TEXT NOT NULL,
    written_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS deployments_by_component_cluster
    ON deployments (component_id, cluster_id, deployment_id);
";

const CURRENT_DEPLOYMENTS: &str = r"
SELECT d.config
FROM deployments d
JOIN (
    SELECT component_id, cluster_id, MAX(deployment_id) AS latest
    FROM deployments
    GROUP BY component_id, cluster_id
) l ON d.deployment_id = l.latest
WHERE d.lifecycle = 'active'
ORDER BY d.deployment_id
";

const UPSERT_CLUSTER: &str = r"
INSERT INTO clusters (name, kind, base_url) VALUES (?1, ?2, ?3)
ON CONFLICT (name) DO UPDATE SET kind = excluded.kind, base_url = excluded.base_url
WHERE clusters.kind <> excluded.kind OR clusters.base_url <> excluded.base_url
";

const INSERT_DEPLOYMENT: &str = r"
INSERT INTO deployments (
    component_id, cluster_id, versionstring, num_instances, schedule_string,
    kind, lifecycle, config, written_by, written_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
";

const HISTORY: &str = r"
SELECT d.deployment_id, d.lifecycle, d.config, d.written_by, d.written_at
FROM deployments d
JOIN components c ON c.component_id = d.component_id
JOIN clusters cl ON cl.cluster_id = d.cluster_id
WHERE cl.name = ?1 AND c.repo = ?2 AND c.dir = ?3 AND c.flavor = ?4
ORDER BY d.deployment_id
";

/// Desired-state store backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqlStateManager {
    pool: SqlitePool,
}

fn query_error(e: sqlx::Error) -> ConvergeError {
    StorageError::Query(e.to_string()).into()
}

fn corrupted(message: impl Into<String>) -> ConvergeError {
    StorageError::Corrupted(message.into()).into()
}

impl SqlStateManager {
    /// Connects to the database at `url` and creates the schema if needed.
    ///
    /// In-memory databases are limited to a single connection, since each
    /// SQLite connection would otherwise see its own empty database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn connect(url: &str, max_connections: Option<u32>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::Connection(format!("{url}: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);

        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(format!("{url}: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Connected to state store at {url}");
        Ok(store)
    }

    /// Creates the schema if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::transaction("creating schema", e))?;
        Ok(())
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn read_clusters(conn: &mut SqliteConnection) -> Result<BTreeMap<String, Cluster>> {
    let rows: Vec<(String, String, String)> =
        sqlx::query_as("SELECT name, kind, base_url FROM clusters ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?;

    rows.into_iter()
        .map(|(name, kind, base_url)| {
            let kind = ClusterKind::from_str(&kind).map_err(corrupted)?;
            Ok((
                name.clone(),
                Cluster {
                    name,
                    kind,
                    base_url,
                },
            ))
        })
        .collect()
}

async fn read_current(conn: &mut SqliteConnection) -> Result<Deployments> {
    let rows: Vec<(String,)> = sqlx::query_as(CURRENT_DEPLOYMENTS)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;

    let mut current = Deployments::new();
    for (config,) in rows {
        let deployment: Deployment = serde_json::from_str(&config)
            .map_err(|e| corrupted(format!("deployment config: {e}")))?;
        current.add(deployment)?;
    }
    Ok(current)
}

async fn upsert_cluster(conn: &mut SqliteConnection, cluster: &Cluster) -> Result<()> {
    sqlx::query(UPSERT_CLUSTER)
        .bind(&cluster.name)
        .bind(cluster.kind.to_string())
        .bind(&cluster.base_url)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::transaction(format!("writing cluster {}", cluster.name), e))?;
    Ok(())
}

async fn component_id(conn: &mut SqliteConnection, deployment: &Deployment) -> Result<i64> {
    let location = deployment.location();
    sqlx::query(
        "INSERT INTO components (repo, dir, flavor) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
    )
        .bind(&location.repo)
        .bind(&location.dir)
        .bind(&deployment.flavor)
        .execute(&mut *conn)
        .await
        .map_err(query_error)?;

    let (id,): (i64,) = sqlx::query_as(
        "SELECT component_id FROM components WHERE repo = ?1 AND dir = ?2 AND flavor = ?3",
    )
    .bind(&location.repo)
    .bind(&location.dir)
    .bind(&deployment.flavor)
    .fetch_one(&mut *conn)
    .await
    .map_err(query_error)?;
    Ok(id)
}

async fn register_owners(
    conn: &mut SqliteConnection,
    component_id: i64,
    deployment: &Deployment,
) -> Result<()> {
    for email in &deployment.owners {
        sqlx::query("INSERT INTO owners (email) VALUES (?1) ON CONFLICT DO NOTHING")
            .bind(email)
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        sqlx::query(
            "INSERT INTO component_owners (component_id, owner_id) \
             SELECT ?1, owner_id FROM owners WHERE email = ?2 \
             ON CONFLICT DO NOTHING",
        )
        .bind(component_id)
        .bind(email)
        .execute(&mut *conn)
        .await
        .map_err(query_error)?;
    }
    Ok(())
}

async fn append_row(
    conn: &mut SqliteConnection,
    deployment: &Deployment,
    lifecycle: Lifecycle,
    written_by: &str,
    written_at: DateTime<Utc>,
) -> Result<()> {
    let component = component_id(conn, deployment).await?;
    if lifecycle == Lifecycle::Active {
        register_owners(conn, component, deployment).await?;
    }

    let cluster: Option<(i64,)> = sqlx::query_as("SELECT cluster_id FROM clusters WHERE name = ?1")
        .bind(&deployment.cluster_name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;
    let Some((cluster,)) = cluster else {
        return Err(corrupted(format!(
            "cluster {} of {} is not defined",
            deployment.cluster_name,
            deployment.id()
        )));
    };

    let config = serde_json::to_string(deployment)
        .map_err(|e| corrupted(format!("encoding {}: {e}", deployment.id())))?;

    sqlx::query(INSERT_DEPLOYMENT)
        .bind(component)
        .bind(cluster)
        .bind(deployment.source_id.version.to_string())
        .bind(i64::from(deployment.num_instances))
        .bind(&deployment.schedule)
        .bind(deployment.kind.to_string())
        .bind(lifecycle.to_string())
        .bind(config)
        .bind(written_by)
        .bind(written_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::transaction(format!("writing {}", deployment.id()), e))?;

    debug!("Appended {lifecycle} row for {}", deployment.id());
    Ok(())
}

#[async_trait]
impl StateManager for SqlStateManager {
    async fn read_state(&self) -> Result<State> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::transaction("beginning read", e))?;
        let clusters = read_clusters(&mut tx).await?;
        let deployments = read_current(&mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::transaction("finishing read", e))?;

        Ok(State::new(Defs { clusters }, deployments))
    }

    async fn write_state(&self, state: &State, user: &User) -> Result<WriteSummary> {
        let state = prepare_write(state)?;
        let written_by = user.to_string();
        let now = Utc::now();

        // Dropping the transaction on any early return rolls it back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::transaction("beginning write", e))?;

        for cluster in state.defs.clusters.values() {
            upsert_cluster(&mut tx, cluster).await?;
        }

        let current = read_current(&mut tx).await?;
        let plan = plan_write(&current, &state.deployments);

        for deployment in &plan.updates {
            append_row(&mut tx, deployment, Lifecycle::Active, &written_by, now).await?;
        }
        for deployment in &plan.tombstones {
            append_row(&mut tx, deployment, Lifecycle::Decommissioned, &written_by, now).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::transaction("committing", e))?;

        let summary = plan.summary();
        if plan.is_empty() {
            debug!("Desired state unchanged");
        } else {
            info!(
                "Wrote desired state as {written_by}: {} updated, {} decommissioned",
                summary.updated, summary.decommissioned
            );
        }
        Ok(summary)
    }

    async fn history(&self, id: &DeploymentId) -> Result<Vec<HistoryRow>> {
        let rows: Vec<(i64, String, String, String, String)> = sqlx::query_as(HISTORY)
            .bind(&id.cluster)
            .bind(&id.location.repo)
            .bind(&id.location.dir)
            .bind(&id.flavor)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        rows.into_iter()
            .map(|(revision, lifecycle, config, written_by, written_at)| {
                Ok(HistoryRow {
                    revision,
                    lifecycle: Lifecycle::from_str(&lifecycle).map_err(corrupted)?,
                    deployment: serde_json::from_str(&config)
                        .map_err(|e| corrupted(format!("deployment config: {e}")))?,
                    written_by,
                    written_at: DateTime::parse_from_rfc3339(&written_at)
                        .map_err(|e| corrupted(format!("timestamp {written_at:?}: {e}")))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}
