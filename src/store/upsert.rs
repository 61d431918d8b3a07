//! Natural-key upsert for magnet rows.

use serde::{Deserialize, Serialize};

use super::EntityStore;
use crate::error::StoreError;
use crate::model::MagnetRecord;

/// Which write an upsert ended up performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Writes `record` keyed by `(creator_id, context_id, type)`.
///
/// Looks the key up first and updates on a hit, inserts on a miss. An insert
/// that loses a race to a concurrent writer (`StoreError::Conflict`) falls
/// back to an update, so repeated calls never create duplicate rows.
pub async fn upsert_magnet<S>(store: &S, record: &MagnetRecord) -> Result<UpsertOutcome, StoreError>
where
    S: EntityStore + ?Sized,
{
    let key = record.key();

    if store.find_magnet(&key).await?.is_some() {
        store.update_magnet(&key, record).await?;
        tracing::debug!(key = %key, "Updated magnet record");
        return Ok(UpsertOutcome::Updated);
    }

    match store.insert_magnet(record).await {
        Ok(()) => {
            tracing::debug!(key = %key, "Inserted magnet record");
            Ok(UpsertOutcome::Inserted)
        }
        Err(StoreError::Conflict { body, .. }) => {
            tracing::warn!(key = %key, conflict = %body, "Insert conflicted, updating instead");
            store.update_magnet(&key, record).await?;
            Ok(UpsertOutcome::Updated)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MagnetKey, MagnetKind};
    use crate::store::MemoryStore;

    fn record(context_id: &str, name: &str) -> MagnetRecord {
        let mut record = MagnetRecord::new(&MagnetKey::new("c1", context_id, MagnetKind::Normal));
        record.front_name = Some(name.to_string());
        record
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let store = MemoryStore::new();

        let first = upsert_magnet(&store, &record("m1", "First")).await.unwrap();
        let second = upsert_magnet(&store, &record("m1", "Second")).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);

        let rows = store.magnets();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].front_name.as_deref(), Some("Second"));
    }

    #[tokio::test]
    async fn test_upsert_conflict_falls_back_to_update() {
        let store = MemoryStore::new();
        store.race_next_insert();

        let outcome = upsert_magnet(&store, &record("m1", "Mine")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let rows = store.magnets();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].front_name.as_deref(), Some("Mine"));
    }

    #[tokio::test]
    async fn test_upsert_kinds_are_distinct_keys() {
        let store = MemoryStore::new();
        upsert_magnet(&store, &record("m1", "Normal")).await.unwrap();

        let mut cover = MagnetRecord::new(&MagnetKey::new("c1", "m1", MagnetKind::Cover));
        cover.front_image_url = Some("https://img/cover.png".into());
        let outcome = upsert_magnet(&store, &cover).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(store.magnets().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_propagates_write_errors() {
        let store = MemoryStore::new();
        store.fail_magnet_writes_for("m1");
        let err = upsert_magnet(&store, &record("m1", "x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Http { status: 500, .. }));
    }
}
