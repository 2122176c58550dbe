//! Proptest generators for property-based testing.

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::{Map, Value};

use irn_core::NodeId;
use irn_sync::{Device, Researcher, SnomedBodyRegion, SyncImportPayload};

/// 2020-01-01T00:00:00Z in microseconds.
const START_MICROS: i64 = 1_577_836_800_000_000;

/// 2030-01-01T00:00:00Z in microseconds.
const END_MICROS: i64 = 1_893_456_000_000_000;

/// A timestamp between 2020 and 2030 with microsecond precision.
pub fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (START_MICROS..END_MICROS).prop_map(|micros| DateTime::from_timestamp_micros(micros).unwrap_or_default())
}

/// A stable entity identifier.
pub fn entity_id() -> impl Strategy<Value = String> {
    "[a-z]{1,8}-[0-9]{1,4}"
}

/// Free-form entity attributes.
pub fn attributes() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z][a-zA-Z]{0,11}", "[ -~]{0,24}", 0..4).prop_map(|fields| {
        fields
            .into_iter()
            // Keep clear of the fields the engine owns.
            .filter(|(k, _)| !matches!(k.as_str(), "id" | "createdAt" | "updatedAt" | "ownerNodeId"))
            .map(|(k, v)| (k, Value::String(v)))
            .collect()
    })
}

pub fn device() -> impl Strategy<Value = Device> {
    (entity_id(), timestamp(), attributes()).prop_map(|(id, updated_at, attributes)| Device {
        id,
        created_at: updated_at,
        updated_at,
        owner_node_id: None,
        attributes,
    })
}

pub fn researcher() -> impl Strategy<Value = Researcher> {
    (entity_id(), timestamp(), attributes()).prop_map(|(id, updated_at, attributes)| Researcher {
        id,
        created_at: updated_at,
        updated_at,
        owner_node_id: None,
        attributes,
    })
}

pub fn body_region() -> impl Strategy<Value = SnomedBodyRegion> {
    (entity_id(), timestamp(), attributes()).prop_map(|(id, updated_at, attributes)| SnomedBodyRegion {
        id,
        created_at: updated_at,
        updated_at,
        attributes,
    })
}

/// A payload of top-level rows with unique ids per group.
pub fn payload() -> impl Strategy<Value = SyncImportPayload> {
    (
        timestamp(),
        prop::collection::vec(body_region(), 0..6),
        prop::collection::vec(researcher(), 0..6),
        prop::collection::vec(device(), 0..6),
    )
        .prop_map(|(generated_at, mut regions, mut researchers, mut devices)| {
            regions.sort_by(|a, b| a.id.cmp(&b.id));
            regions.dedup_by(|a, b| a.id == b.id);
            researchers.sort_by(|a, b| a.id.cmp(&b.id));
            researchers.dedup_by(|a, b| a.id == b.id);
            devices.sort_by(|a, b| a.id.cmp(&b.id));
            devices.dedup_by(|a, b| a.id == b.id);

            let mut payload = SyncImportPayload::new(NodeId::new(), generated_at);
            payload.snomed.body_regions = regions;
            payload.researchers = researchers;
            payload.devices = devices;
            payload
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_timestamps_are_microsecond_precise(ts in timestamp()) {
            prop_assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
        }

        #[test]
        fn test_payload_ids_are_unique(p in payload()) {
            let mut ids: Vec<_> = p.devices.iter().map(|d| d.id.clone()).collect();
            ids.dedup();
            prop_assert_eq!(ids.len(), p.devices.len());
        }
    }
}
