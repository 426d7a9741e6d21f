use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{from_millis, to_millis, RdbmsStore};
use crate::error::{CoordinationError, Result};
use crate::event::MembershipEventType;
use crate::node::{decode_properties, encode_properties, NodeDetail, PropertiesMap};

const SELECT_NODE_DETAILS: &str = r#"
    SELECT n.node_id,
           n.group_id,
           n.properties,
           n.is_new_node,
           h.last_heartbeat,
           CASE WHEN l.coordinator_node_id = n.node_id THEN 1 ELSE 0 END AS is_coordinator
      FROM nodes n
      LEFT JOIN heartbeats h
        ON h.group_id = n.group_id AND h.node_id = n.node_id
      LEFT JOIN coordinator_lock l
        ON l.group_id = n.group_id
     WHERE n.group_id = ?
"#;

impl RdbmsStore {
    /// Register a node and its first heartbeat.
    ///
    /// Fails with [`CoordinationError::DuplicateNode`] when a row with the same
    /// identity already exists.
    pub async fn add_node(
        &self,
        node_id: &str,
        group_id: &str,
        properties: &PropertiesMap,
    ) -> Result<()> {
        let encoded = encode_properties(properties)?;
        let now = to_millis(Utc::now());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO nodes (group_id, node_id, properties, is_new_node)
            VALUES (?, ?, ?, 1)
            "#,
        )
        .bind(group_id)
        .bind(node_id)
        .bind(&encoded)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, node_id, group_id))?;

        sqlx::query(
            r#"
            INSERT INTO heartbeats (group_id, node_id, last_heartbeat)
            VALUES (?, ?, ?)
            ON CONFLICT (group_id, node_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(group_id)
        .bind(node_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Membership snapshot of a group, ordered by node id.
    pub async fn get_all_node_details(&self, group_id: &str) -> Result<Vec<NodeDetail>> {
        let query = format!("{} ORDER BY n.node_id", SELECT_NODE_DETAILS);
        let rows = sqlx::query(&query)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(node_from_row).collect()
    }

    pub async fn get_node_data(&self, node_id: &str, group_id: &str) -> Result<Option<NodeDetail>> {
        let query = format!("{} AND n.node_id = ?", SELECT_NODE_DETAILS);
        let row = sqlx::query(&query)
            .bind(group_id)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    /// Remove a node and its heartbeat. Removing an absent node is not an error;
    /// the return value tells whether this call removed the registry row.
    pub async fn remove_node(&self, node_id: &str, group_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM heartbeats WHERE group_id = ? AND node_id = ?")
            .bind(group_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM nodes WHERE group_id = ? AND node_id = ?")
            .bind(group_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed > 0)
    }

    /// Graceful leave: remove the node and queue MEMBER_REMOVED for the
    /// remaining members in one transaction, so a failure leaves nothing half
    /// done and the call can simply be repeated. Returns `false` if the node
    /// was already gone, in which case nothing is queued.
    pub async fn deregister_node(
        &self,
        node_id: &str,
        group_id: &str,
        properties: &PropertiesMap,
    ) -> Result<bool> {
        let encoded = encode_properties(properties)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM heartbeats WHERE group_id = ? AND node_id = ?")
            .bind(group_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM nodes WHERE group_id = ? AND node_id = ?")
            .bind(group_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if removed == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO membership_events
                (target_node_id, target_group_id, event_type, subject_node_id, subject_properties)
            SELECT node_id, group_id, ?, ?, ?
              FROM nodes
             WHERE group_id = ?
             ORDER BY node_id
            "#,
        )
        .bind(MembershipEventType::MemberRemoved.as_str())
        .bind(node_id)
        .bind(&encoded)
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Remove a node only if its heartbeat still equals `observed_heartbeat`.
    ///
    /// A node that heartbeated after the scan, or a peer that already removed
    /// it, makes this a no-op returning `false`.
    pub async fn remove_stale_node(
        &self,
        node_id: &str,
        group_id: &str,
        observed_heartbeat: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            DELETE FROM heartbeats
             WHERE group_id = ? AND node_id = ? AND last_heartbeat = ?
            "#,
        )
        .bind(group_id)
        .bind(node_id)
        .bind(to_millis(observed_heartbeat))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM nodes WHERE group_id = ? AND node_id = ?")
            .bind(group_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Overwrite (not merge) a node's properties. Returns `false` if the node is absent.
    pub async fn update_properties_map(
        &self,
        node_id: &str,
        group_id: &str,
        properties: &PropertiesMap,
    ) -> Result<bool> {
        let encoded = encode_properties(properties)?;
        let updated = sqlx::query("UPDATE nodes SET properties = ? WHERE group_id = ? AND node_id = ?")
            .bind(&encoded)
            .bind(group_id)
            .bind(node_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    /// Returns `false` when the heartbeat row is gone, i.e. the node was evicted.
    pub async fn update_heartbeat(
        &self,
        node_id: &str,
        group_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE heartbeats SET last_heartbeat = ? WHERE group_id = ? AND node_id = ?",
        )
        .bind(to_millis(at))
        .bind(group_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Clear the first-observation flag. Only the caller that flips it gets `true`.
    pub async fn mark_node_observed(&self, node_id: &str, group_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE nodes SET is_new_node = 0
             WHERE group_id = ? AND node_id = ? AND is_new_node = 1
            "#,
        )
        .bind(group_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

fn map_insert_error(error: sqlx::Error, node_id: &str, group_id: &str) -> CoordinationError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoordinationError::DuplicateNode {
            node_id: node_id.to_string(),
            group_id: group_id.to_string(),
        },
        _ => CoordinationError::Storage(error),
    }
}

fn node_from_row(row: &SqliteRow) -> Result<NodeDetail> {
    let properties: String = row.try_get("properties")?;
    let is_new_node: i64 = row.try_get("is_new_node")?;
    let is_coordinator: i64 = row.try_get("is_coordinator")?;
    let last_heartbeat: Option<i64> = row.try_get("last_heartbeat")?;

    Ok(NodeDetail {
        node_id: row.try_get("node_id")?,
        group_id: row.try_get("group_id")?,
        properties: decode_properties(&properties)?,
        is_new_node: is_new_node != 0,
        is_coordinator: is_coordinator != 0,
        last_heartbeat: last_heartbeat.map(from_millis),
    })
}
