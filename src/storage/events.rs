use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::RdbmsStore;
use crate::error::Result;
use crate::event::{MemberEvent, MembershipEventType};
use crate::node::{decode_properties, encode_properties, PropertiesMap};

impl RdbmsStore {
    /// Queue one event for `target_node_id`.
    pub async fn write_membership_event(
        &self,
        target_node_id: &str,
        target_group_id: &str,
        event_type: MembershipEventType,
        subject_node_id: &str,
        subject_properties: Option<&PropertiesMap>,
    ) -> Result<()> {
        let encoded = subject_properties.map(encode_properties).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO membership_events
                (target_node_id, target_group_id, event_type, subject_node_id, subject_properties)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(target_node_id)
        .bind(target_group_id)
        .bind(event_type.as_str())
        .bind(subject_node_id)
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queue the same event for every node currently registered in the group.
    /// Returns the number of targets.
    pub async fn write_membership_event_for_all(
        &self,
        group_id: &str,
        event_type: MembershipEventType,
        subject_node_id: &str,
        subject_properties: Option<&PropertiesMap>,
    ) -> Result<u64> {
        let encoded = subject_properties.map(encode_properties).transpose()?;
        let written = sqlx::query(
            r#"
            INSERT INTO membership_events
                (target_node_id, target_group_id, event_type, subject_node_id, subject_properties)
            SELECT node_id, group_id, ?, ?, ?
              FROM nodes
             WHERE group_id = ?
             ORDER BY node_id
            "#,
        )
        .bind(event_type.as_str())
        .bind(subject_node_id)
        .bind(encoded)
        .bind(group_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(written)
    }

    /// Take every pending event for a node, in production order.
    ///
    /// Reading and clearing happen in one `DELETE ... RETURNING` statement, so a
    /// crash cannot leave rows that were handed out but not deleted, and two
    /// concurrent readers never both receive the same row.
    pub async fn read_membership_events(
        &self,
        node_id: &str,
        group_id: &str,
    ) -> Result<Vec<MemberEvent>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM membership_events
             WHERE target_node_id = ? AND target_group_id = ?
            RETURNING sequence, target_node_id, target_group_id, event_type,
                      subject_node_id, subject_properties
            "#,
        )
        .bind(node_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        // The rows are already deleted, so a bad row is dropped on its own
        // rather than failing the whole batch
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            match event_from_row(row) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(node_id, group_id, error = %e, "Dropping unreadable membership event");
                }
            }
        }

        // RETURNING does not promise any row order
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }
}

/// `Ok(None)` for rows of an unknown type. A corrupt properties snapshot keeps
/// the event and loses only the snapshot.
fn event_from_row(row: &SqliteRow) -> Result<Option<MemberEvent>> {
    let sequence: i64 = row.try_get("sequence")?;
    let raw_type: String = row.try_get("event_type")?;
    let event_type = match raw_type.parse::<MembershipEventType>() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(sequence, error = %e, "Dropping unknown membership event");
            return Ok(None);
        }
    };

    let raw_properties: Option<String> = row.try_get("subject_properties")?;
    let subject_properties = match raw_properties.as_deref().map(decode_properties).transpose() {
        Ok(properties) => properties,
        Err(e) => {
            tracing::warn!(sequence, error = %e, "Ignoring corrupt properties snapshot on membership event");
            None
        }
    };

    Ok(Some(MemberEvent {
        sequence,
        target_node_id: row.try_get("target_node_id")?,
        target_group_id: row.try_get("target_group_id")?,
        event_type,
        subject_node_id: row.try_get("subject_node_id")?,
        subject_properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_come_back_in_production_order_once() {
        let (_dir, store) = temp_store().await;
        let sequence = [
            (MembershipEventType::MemberAdded, "node2"),
            (MembershipEventType::CoordinatorChanged, "node1"),
            (MembershipEventType::MemberRemoved, "node2"),
            (MembershipEventType::MemberAdded, "node3"),
        ];
        for (ty, subject) in sequence {
            store
                .write_membership_event("node1", "G", ty, subject, None)
                .await
                .unwrap();
        }

        let events = store.read_membership_events("node1", "G").await.unwrap();
        let got: Vec<_> = events
            .iter()
            .map(|e| (e.event_type, e.subject_node_id.as_str()))
            .collect();
        assert_eq!(got, sequence.to_vec());
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

        // Cleared by the read
        assert!(store.read_membership_events("node1", "G").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_are_scoped_to_target_and_group() {
        let (_dir, store) = temp_store().await;
        store
            .write_membership_event("node1", "G", MembershipEventType::MemberAdded, "x", None)
            .await
            .unwrap();
        store
            .write_membership_event("node2", "G", MembershipEventType::MemberAdded, "x", None)
            .await
            .unwrap();
        store
            .write_membership_event("node1", "H", MembershipEventType::MemberAdded, "x", None)
            .await
            .unwrap();

        let events = store.read_membership_events("node1", "G").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target_node_id, "node1");
        assert_eq!(events[0].target_group_id, "G");

        assert_eq!(store.read_membership_events("node2", "G").await.unwrap().len(), 1);
        assert_eq!(store.read_membership_events("node1", "H").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fan_out_reaches_every_registered_node() {
        let (_dir, store) = temp_store().await;
        for id in ["node1", "node2", "node3"] {
            store.add_node(id, "G", &PropertiesMap::new()).await.unwrap();
        }
        store.add_node("other", "H", &PropertiesMap::new()).await.unwrap();

        let written = store
            .write_membership_event_for_all("G", MembershipEventType::CoordinatorChanged, "node2", None)
            .await
            .unwrap();
        assert_eq!(written, 3);

        for id in ["node1", "node2", "node3"] {
            let events = store.read_membership_events(id, "G").await.unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].subject_node_id, "node2");
        }
        assert!(store.read_membership_events("other", "H").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_snapshot_is_carried_with_event() {
        let (_dir, store) = temp_store().await;
        let mut snapshot = PropertiesMap::new();
        snapshot.insert("id".to_string(), json!("node2"));

        store
            .write_membership_event(
                "node1",
                "G",
                MembershipEventType::MemberRemoved,
                "node2",
                Some(&snapshot),
            )
            .await
            .unwrap();

        let events = store.read_membership_events("node1", "G").await.unwrap();
        assert_eq!(events[0].subject_properties.as_ref(), Some(&snapshot));
    }

    #[tokio::test]
    async fn unknown_event_rows_are_skipped() {
        let (_dir, store) = temp_store().await;
        sqlx::query(
            "INSERT INTO membership_events (target_node_id, target_group_id, event_type, subject_node_id) VALUES ('node1', 'G', 'MEMBER_SUSPECTED', 'node2')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        store
            .write_membership_event("node1", "G", MembershipEventType::MemberAdded, "node3", None)
            .await
            .unwrap();

        let events = store.read_membership_events("node1", "G").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject_node_id, "node3");
        assert!(store.read_membership_events("node1", "G").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_does_not_lose_batch() {
        let (_dir, store) = temp_store().await;
        store
            .write_membership_event("node1", "G", MembershipEventType::MemberAdded, "node2", None)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO membership_events (target_node_id, target_group_id, event_type, subject_node_id, subject_properties) VALUES ('node1', 'G', 'MEMBER_REMOVED', 'node3', 'not json')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        store
            .write_membership_event("node1", "G", MembershipEventType::CoordinatorChanged, "node2", None)
            .await
            .unwrap();

        let events = store.read_membership_events("node1", "G").await.unwrap();
        let got: Vec<_> = events
            .iter()
            .map(|e| (e.event_type, e.subject_node_id.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                (MembershipEventType::MemberAdded, "node2"),
                (MembershipEventType::MemberRemoved, "node3"),
                (MembershipEventType::CoordinatorChanged, "node2"),
            ]
        );
        assert!(events[1].subject_properties.is_none());
        assert!(store.read_membership_events("node1", "G").await.unwrap().is_empty());
    }
}
