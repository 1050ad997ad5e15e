use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recorder_core::RecordStore;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{
    AssignmentId, AssignmentRecord, NewAssignment, NewNode, NodeId, NodeRecord, TabId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Each in-memory connection is its own database, so keep exactly one
        // alive for the lifetime of the pool.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts an assignment on its own. Used by the admin tooling; the
    /// tracker always goes through [`Storage::create_assignment_with_node`].
    pub async fn create_assignment(&self, assignment: NewAssignment) -> Result<AssignmentRecord> {
        let rec = sqlx::query(
            "INSERT INTO assignments (title, description, created_at) VALUES (?, ?, ?) RETURNING local_id",
        )
        .bind(&assignment.title)
        .bind(&assignment.description)
        .bind(assignment.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(assignment.into_record(AssignmentId(rec.get::<i64, _>(0))))
    }

    /// Inserts the assignment, then the node referencing it, in one
    /// transaction. Dropping the transaction on any error rolls both back.
    pub async fn create_assignment_with_node(
        &self,
        assignment: NewAssignment,
        node: NewNode,
    ) -> Result<(AssignmentRecord, NodeRecord)> {
        let mut tx = self.pool.begin().await?;

        let assignment_id = sqlx::query(
            "INSERT INTO assignments (title, description, created_at) VALUES (?, ?, ?) RETURNING local_id",
        )
        .bind(&assignment.title)
        .bind(&assignment.description)
        .bind(assignment.created_at)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert assignment")?
        .get::<i64, _>(0);
        let assignment = assignment.into_record(AssignmentId(assignment_id));

        let node_id = sqlx::query(
            "INSERT INTO nodes (local_assignment_id, tab_id, title, url) VALUES (?, ?, ?, ?) RETURNING local_id",
        )
        .bind(assignment.local_id.0)
        .bind(node.tab_id.0)
        .bind(&node.title)
        .bind(&node.url)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert node")?
        .get::<i64, _>(0);
        let node = node.into_record(NodeId(node_id), assignment.local_id);

        tx.commit().await.context("failed to commit recording")?;
        debug!(
            assignment_id = %assignment.local_id,
            node_id = %node.local_id,
            tab_id = %node.tab_id,
            "stored assignment with node"
        );
        Ok((assignment, node))
    }

    pub async fn nodes_for_tab(&self, tab_id: TabId) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(
            "SELECT local_id, local_assignment_id, tab_id, title, url FROM nodes
             WHERE tab_id = ? ORDER BY local_id ASC",
        )
        .bind(tab_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn latest_node_for_tab(&self, tab_id: TabId) -> Result<Option<NodeRecord>> {
        let row = sqlx::query(
            "SELECT local_id, local_assignment_id, tab_id, title, url FROM nodes
             WHERE tab_id = ? ORDER BY local_id DESC LIMIT 1",
        )
        .bind(tab_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    pub async fn nodes_for_assignment(&self, assignment_id: AssignmentId) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(
            "SELECT local_id, local_assignment_id, tab_id, title, url FROM nodes
             WHERE local_assignment_id = ? ORDER BY local_id ASC",
        )
        .bind(assignment_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn assignment(&self, assignment_id: AssignmentId) -> Result<Option<AssignmentRecord>> {
        let row = sqlx::query(
            "SELECT local_id, title, description, created_at FROM assignments WHERE local_id = ?",
        )
        .bind(assignment_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    pub async fn list_assignments(&self) -> Result<Vec<AssignmentRecord>> {
        let rows = sqlx::query(
            "SELECT local_id, title, description, created_at FROM assignments ORDER BY local_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assignment_from_row).collect()
    }
}

fn assignment_from_row(row: &SqliteRow) -> Result<AssignmentRecord> {
    Ok(AssignmentRecord {
        local_id: AssignmentId(row.try_get("local_id")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn node_from_row(row: &SqliteRow) -> Result<NodeRecord> {
    Ok(NodeRecord {
        local_id: NodeId(row.try_get("local_id")?),
        local_assignment_id: AssignmentId(row.try_get("local_assignment_id")?),
        tab_id: TabId(row.try_get("tab_id")?),
        title: row.try_get("title")?,
        url: row.try_get("url")?,
    })
}

#[async_trait]
impl RecordStore for Storage {
    async fn create_assignment_with_node(
        &self,
        assignment: NewAssignment,
        node: NewNode,
    ) -> Result<(AssignmentRecord, NodeRecord)> {
        Storage::create_assignment_with_node(self, assignment, node).await
    }

    async fn nodes_for_tab(&self, tab_id: TabId) -> Result<Vec<NodeRecord>> {
        Storage::nodes_for_tab(self, tab_id).await
    }

    async fn latest_node_for_tab(&self, tab_id: TabId) -> Result<Option<NodeRecord>> {
        Storage::latest_node_for_tab(self, tab_id).await
    }

    async fn assignment(&self, assignment_id: AssignmentId) -> Result<Option<AssignmentRecord>> {
        Storage::assignment(self, assignment_id).await
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url == "sqlite::memory:" || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
