use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{from_millis, to_millis, RdbmsStore};
use crate::error::Result;

/// The row naming a group's coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorLock {
    pub group_id: String,
    pub coordinator_node_id: String,
    pub last_updated: DateTime<Utc>,
}

impl RdbmsStore {
    pub async fn get_coordinator_lock(&self, group_id: &str) -> Result<Option<CoordinatorLock>> {
        let row = sqlx::query(
            r#"
            SELECT group_id, coordinator_node_id, last_updated
              FROM coordinator_lock
             WHERE group_id = ?
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_updated: i64 = row.try_get("last_updated")?;
        Ok(Some(CoordinatorLock {
            group_id: row.try_get("group_id")?,
            coordinator_node_id: row.try_get("coordinator_node_id")?,
            last_updated: from_millis(last_updated),
        }))
    }

    /// Insert the lock row if the group has none. `true` means `node_id` now holds it.
    pub async fn try_acquire_coordinator_lock(
        &self,
        group_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO coordinator_lock (group_id, coordinator_node_id, last_updated)
            VALUES (?, ?, ?)
            ON CONFLICT (group_id) DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(node_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    /// Replace a stale holder. Succeeds only if the row still matches `expected`,
    /// so of several candidates that read the same stale row exactly one wins.
    pub async fn take_over_coordinator_lock(
        &self,
        expected: &CoordinatorLock,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE coordinator_lock
               SET coordinator_node_id = ?,
                   last_updated = ?
             WHERE group_id = ?
               AND coordinator_node_id = ?
               AND last_updated = ?
            "#,
        )
        .bind(node_id)
        .bind(to_millis(now))
        .bind(&expected.group_id)
        .bind(&expected.coordinator_node_id)
        .bind(to_millis(expected.last_updated))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Touch the lock while holding it. `false` means the lock is no longer ours.
    pub async fn refresh_coordinator_lock(
        &self,
        group_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE coordinator_lock
               SET last_updated = ?
             WHERE group_id = ? AND coordinator_node_id = ?
            "#,
        )
        .bind(to_millis(now))
        .bind(group_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Delete the lock if `node_id` holds it. Used on graceful leave, on
    /// step-down, and by failure detectors clearing a dead holder.
    pub async fn release_coordinator_lock(&self, group_id: &str, node_id: &str) -> Result<bool> {
        let deleted = sqlx::query(
            "DELETE FROM coordinator_lock WHERE group_id = ? AND coordinator_node_id = ?",
        )
        .bind(group_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;

    #[tokio::test]
    async fn first_acquirer_wins() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();

        assert!(store.try_acquire_coordinator_lock("G", "node1", now).await.unwrap());
        assert!(!store.try_acquire_coordinator_lock("G", "node2", now).await.unwrap());

        let lock = store.get_coordinator_lock("G").await.unwrap().unwrap();
        assert_eq!(lock.coordinator_node_id, "node1");
        assert_eq!(to_millis(lock.last_updated), to_millis(now));
    }

    #[tokio::test]
    async fn groups_have_separate_locks() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        assert!(store.try_acquire_coordinator_lock("G", "node1", now).await.unwrap());
        assert!(store.try_acquire_coordinator_lock("H", "node2", now).await.unwrap());
        assert!(store.get_coordinator_lock("X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn take_over_is_compare_and_swap() {
        let (_dir, store) = temp_store().await;
        let then = Utc::now() - chrono::Duration::seconds(60);
        store.try_acquire_coordinator_lock("G", "node1", then).await.unwrap();
        let stale = store.get_coordinator_lock("G").await.unwrap().unwrap();

        // Two candidates read the same stale row; only one swap applies
        let now = Utc::now();
        assert!(store.take_over_coordinator_lock(&stale, "node2", now).await.unwrap());
        assert!(!store.take_over_coordinator_lock(&stale, "node3", now).await.unwrap());

        let lock = store.get_coordinator_lock("G").await.unwrap().unwrap();
        assert_eq!(lock.coordinator_node_id, "node2");
    }

    #[tokio::test]
    async fn refresh_fails_after_take_over() {
        let (_dir, store) = temp_store().await;
        store.try_acquire_coordinator_lock("G", "node1", Utc::now()).await.unwrap();
        assert!(store.refresh_coordinator_lock("G", "node1", Utc::now()).await.unwrap());

        let current = store.get_coordinator_lock("G").await.unwrap().unwrap();
        store.take_over_coordinator_lock(&current, "node2", Utc::now()).await.unwrap();
        assert!(!store.refresh_coordinator_lock("G", "node1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let (_dir, store) = temp_store().await;
        store.try_acquire_coordinator_lock("G", "node1", Utc::now()).await.unwrap();

        assert!(!store.release_coordinator_lock("G", "node2").await.unwrap());
        assert!(store.release_coordinator_lock("G", "node1").await.unwrap());
        assert!(store.get_coordinator_lock("G").await.unwrap().is_none());
        assert!(!store.release_coordinator_lock("G", "node1").await.unwrap());
    }
}
