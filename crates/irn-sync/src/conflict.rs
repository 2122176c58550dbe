//! Newer-wins conflict resolution.
//!
//! `updatedAt` is the logical clock. An incoming row replaces the stored one
//! only when it is strictly newer; ties and older rows are left alone, so
//! re-importing the same payload changes nothing.

use irn_store::{EntityRecord, EntityTx};

use crate::error::Result;

/// What to do with one incoming row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No local row exists.
    Insert,
    /// The incoming row is strictly newer.
    Overwrite,
    /// The stored row is as new or newer.
    Skip,
}

impl Resolution {
    pub fn is_write(self) -> bool {
        self != Resolution::Skip
    }
}

/// Decide between a stored row and an incoming one.
pub fn resolve(existing: Option<&EntityRecord>, incoming: &EntityRecord) -> Resolution {
    match existing {
        None => Resolution::Insert,
        Some(stored) if incoming.updated_at > stored.updated_at => Resolution::Overwrite,
        Some(_) => Resolution::Skip,
    }
}

/// Resolve `incoming` against the transaction's view and write it if it wins.
///
/// The original `createdAt` is kept on overwrite.
pub fn apply(tx: &mut dyn EntityTx, incoming: &EntityRecord) -> Result<Resolution> {
    let existing = tx.find(incoming.kind, &incoming.id)?;
    let resolution = resolve(existing.as_ref(), incoming);
    match resolution {
        Resolution::Insert => tx.insert(incoming)?,
        Resolution::Overwrite => {
            let mut row = incoming.clone();
            if let Some(stored) = existing {
                row.created_at = stored.created_at;
                if let Some(obj) = row.data.as_object_mut() {
                    obj.insert("createdAt".into(), serde_json::to_value(stored.created_at)?);
                }
            }
            tx.update(&row)?;
        }
        Resolution::Skip => {}
    }
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use irn_store::EntityKind;
    use serde_json::json;

    fn record(updated_at: DateTime<Utc>, name: &str) -> EntityRecord {
        EntityRecord::new(EntityKind::Device, "d1", updated_at, updated_at, json!({ "name": name }))
    }

    #[test]
    fn test_resolution_rules() {
        let now = Utc::now();
        let stored = record(now, "old");

        assert_eq!(resolve(None, &stored), Resolution::Insert);
        assert_eq!(resolve(Some(&stored), &record(now, "same")), Resolution::Skip);
        assert_eq!(
            resolve(Some(&stored), &record(now - Duration::seconds(1), "older")),
            Resolution::Skip
        );
        assert_eq!(
            resolve(Some(&stored), &record(now + Duration::microseconds(1), "newer")),
            Resolution::Overwrite
        );
    }
}
