//! Typed syncable entities.
//!
//! Each entity carries a stable `id`, `createdAt` and `updatedAt`. Fields the
//! sync engine does not interpret travel in `attributes` untouched. Nested
//! children are stored as rows of their own and reassembled on export.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use irn_core::NodeId;
use irn_store::{EntityKind, EntityRecord};

use crate::error::{Result, SyncError};

/// JSON field holding the owning node.
pub const OWNER_FIELD: &str = "ownerNodeId";

/// An entity the sync engine can store, export and import.
pub trait SyncEntity: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    /// JSON fields holding nested children; stripped from the stored row.
    const CHILD_FIELDS: &'static [&'static str] = &[];

    /// Whether the entity carries an owning-node reference.
    const OWNED: bool = false;

    fn id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    fn updated_at(&self) -> DateTime<Utc>;
}

/// Convert an entity into its stored row.
///
/// Children are dropped, timestamps in `data` are aligned with the
/// microsecond columns, and owned entities are attributed to `local_node`.
pub fn to_record<E: SyncEntity>(entity: &E, parent_id: Option<&str>, local_node: NodeId) -> Result<EntityRecord> {
    let mut data = serde_json::to_value(entity)?;
    let Some(obj) = data.as_object_mut() else {
        return Err(SyncError::InvalidEntity(format!("{} {} is not an object", E::KIND, entity.id())));
    };
    for field in E::CHILD_FIELDS {
        obj.remove(*field);
    }

    let mut record = EntityRecord::new(E::KIND, entity.id(), entity.created_at(), entity.updated_at(), Value::Null);
    obj.insert("createdAt".into(), serde_json::to_value(record.created_at)?);
    obj.insert("updatedAt".into(), serde_json::to_value(record.updated_at)?);
    if E::OWNED {
        obj.insert(OWNER_FIELD.into(), serde_json::to_value(local_node)?);
        record.owner_node_id = Some(local_node);
    }
    record.data = data;

    Ok(match parent_id {
        Some(parent) => record.with_parent(parent),
        None => record,
    })
}

/// Rebuild an entity from a stored row. Children come back empty.
pub fn from_record<E: SyncEntity>(record: &EntityRecord) -> Result<E> {
    if record.kind != E::KIND {
        return Err(SyncError::InvalidEntity(format!(
            "expected {} row, got {}",
            E::KIND,
            record.kind
        )));
    }
    Ok(serde_json::from_value(record.data.clone())?)
}

/// Decode a list of wire values into typed entities.
pub fn decode_all<E: SyncEntity>(rows: Vec<Value>) -> Result<Vec<E>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| SyncError::InvalidEntity(format!("{}: {e}", E::KIND))))
        .collect()
}

macro_rules! impl_sync_entity {
    ($name:ident, $kind:expr $(, children = [$($child:literal),*])? $(, owned = $owned:literal)?) => {
        impl SyncEntity for $name {
            const KIND: EntityKind = $kind;
            $(const CHILD_FIELDS: &'static [&'static str] = &[$($child),*];)?
            $(const OWNED: bool = $owned;)?

            fn id(&self) -> &str {
                &self.id
            }

            fn created_at(&self) -> DateTime<Utc> {
                self.created_at
            }

            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }
        }
    };
}

/// An entity with no children and no references the engine checks.
macro_rules! leaf_entity {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            pub id: String,
            pub created_at: DateTime<Utc>,
            pub updated_at: DateTime<Utc>,
            #[serde(flatten)]
            pub attributes: Map<String, Value>,
        }

        impl_sync_entity!($name, $kind);
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// SNOMED catalog
// ─────────────────────────────────────────────────────────────────────────────

leaf_entity!(SnomedBodyRegion, EntityKind::SnomedBodyRegion);
leaf_entity!(SnomedBodyStructure, EntityKind::SnomedBodyStructure);
leaf_entity!(SnomedTopographicalModifier, EntityKind::SnomedTopographicalModifier);
leaf_entity!(SnomedLaterality, EntityKind::SnomedLaterality);
leaf_entity!(SnomedSeverityCode, EntityKind::SnomedSeverityCode);
leaf_entity!(SnomedClinicalCondition, EntityKind::SnomedClinicalCondition);
leaf_entity!(SnomedClinicalEvent, EntityKind::SnomedClinicalEvent);
leaf_entity!(SnomedMedication, EntityKind::SnomedMedication);
leaf_entity!(SnomedAllergyIntolerance, EntityKind::SnomedAllergyIntolerance);

/// The nine SNOMED reference collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnomedCatalog {
    pub body_regions: Vec<SnomedBodyRegion>,
    pub body_structures: Vec<SnomedBodyStructure>,
    pub topographical_modifiers: Vec<SnomedTopographicalModifier>,
    pub lateralities: Vec<SnomedLaterality>,
    pub severity_codes: Vec<SnomedSeverityCode>,
    pub clinical_conditions: Vec<SnomedClinicalCondition>,
    pub clinical_events: Vec<SnomedClinicalEvent>,
    pub medications: Vec<SnomedMedication>,
    pub allergy_intolerances: Vec<SnomedAllergyIntolerance>,
}

impl SnomedCatalog {
    pub fn len(&self) -> usize {
        self.body_regions.len()
            + self.body_structures.len()
            + self.topographical_modifiers.len()
            + self.lateralities.len()
            + self.severity_codes.len()
            + self.clinical_conditions.len()
            + self.clinical_events.len()
            + self.medications.len()
            + self.allergy_intolerances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Volunteers
// ─────────────────────────────────────────────────────────────────────────────

leaf_entity!(VolunteerCondition, EntityKind::VolunteerCondition);
leaf_entity!(VolunteerAllergy, EntityKind::VolunteerAllergy);
leaf_entity!(VolunteerMedication, EntityKind::VolunteerMedication);
leaf_entity!(VolunteerClinicalEvent, EntityKind::VolunteerClinicalEvent);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volunteer {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node_id: Option<NodeId>,
    #[serde(default)]
    pub conditions: Vec<VolunteerCondition>,
    #[serde(default)]
    pub allergies: Vec<VolunteerAllergy>,
    #[serde(default)]
    pub medications: Vec<VolunteerMedication>,
    #[serde(default)]
    pub clinical_events: Vec<VolunteerClinicalEvent>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(
    Volunteer,
    EntityKind::Volunteer,
    children = ["conditions", "allergies", "medications", "clinicalEvents"],
    owned = true
);

// ─────────────────────────────────────────────────────────────────────────────
// Researchers and devices
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Researcher {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node_id: Option<NodeId>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(Researcher, EntityKind::Researcher, owned = true);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node_id: Option<NodeId>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(Device, EntityKind::Device, owned = true);

// ─────────────────────────────────────────────────────────────────────────────
// Research
// ─────────────────────────────────────────────────────────────────────────────

leaf_entity!(ResearchApplication, EntityKind::ResearchApplication);

/// Links a research project to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchDevice {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(ResearchDevice, EntityKind::ResearchDevice);

/// Links a research project to a researcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchResearcher {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub researcher_id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(ResearchResearcher, EntityKind::ResearchResearcher);

/// Enrols a volunteer in a research project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchVolunteer {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub volunteer_id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(ResearchVolunteer, EntityKind::ResearchVolunteer);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Research {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node_id: Option<NodeId>,
    #[serde(default)]
    pub applications: Vec<ResearchApplication>,
    #[serde(default)]
    pub devices: Vec<ResearchDevice>,
    #[serde(default)]
    pub researchers: Vec<ResearchResearcher>,
    #[serde(default)]
    pub volunteers: Vec<ResearchVolunteer>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(
    Research,
    EntityKind::Research,
    children = ["applications", "devices", "researchers", "volunteers"],
    owned = true
);

// ─────────────────────────────────────────────────────────────────────────────
// Recording sessions
// ─────────────────────────────────────────────────────────────────────────────

leaf_entity!(TargetArea, EntityKind::TargetArea);

/// One recorded channel, optionally pointing at a stored recording file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChannel {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default)]
    pub target_areas: Vec<TargetArea>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(RecordChannel, EntityKind::RecordChannel, children = ["targetAreas"]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub channels: Vec<RecordChannel>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(Record, EntityKind::Record, children = ["channels"]);

/// A recording session within a research project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node_id: Option<NodeId>,
    pub research_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volunteer_id: Option<String>,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl_sync_entity!(RecordSession, EntityKind::RecordSession, children = ["records"], owned = true);

impl RecordSession {
    /// Channels in this session that reference a recording file.
    pub fn file_channels(&self) -> impl Iterator<Item = &RecordChannel> {
        self.records
            .iter()
            .flat_map(|r| r.channels.iter())
            .filter(|c| c.file_url.as_deref().is_some_and(|u| !u.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(secs: i64, nanos: u32) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, nanos).unwrap()
    }

    #[test]
    fn test_to_record_strips_children_and_rewrites_owner() {
        let remote = NodeId::new();
        let local = NodeId::new();
        let volunteer: Volunteer = serde_json::from_value(json!({
            "id": "v1",
            "createdAt": ts(1_700_000_000, 0),
            "updatedAt": ts(1_700_000_100, 123_456_789),
            "ownerNodeId": remote,
            "bloodType": "A+",
            "conditions": [{
                "id": "c1",
                "createdAt": ts(1_700_000_000, 0),
                "updatedAt": ts(1_700_000_000, 0),
                "snomedCode": "123"
            }]
        }))
        .unwrap();
        assert_eq!(volunteer.conditions.len(), 1);
        assert_eq!(volunteer.attributes["bloodType"], "A+");

        let record = to_record(&volunteer, None, local).unwrap();
        assert_eq!(record.kind, EntityKind::Volunteer);
        assert_eq!(record.owner_node_id, Some(local));
        assert!(record.data.get("conditions").is_none());
        assert_eq!(record.data[OWNER_FIELD], json!(local));
        assert_eq!(record.updated_at.timestamp_subsec_nanos(), 123_456_000);

        let back: Volunteer = from_record(&record).unwrap();
        assert_eq!(back.owner_node_id, Some(local));
        assert_eq!(back.updated_at, record.updated_at);
        assert!(back.conditions.is_empty());
        assert_eq!(back.attributes["bloodType"], "A+");
    }

    #[test]
    fn test_unowned_entity_keeps_data() {
        let region: SnomedBodyRegion = serde_json::from_value(json!({
            "id": "r1",
            "createdAt": ts(1_700_000_000, 0),
            "updatedAt": ts(1_700_000_000, 0),
            "displayName": "Head"
        }))
        .unwrap();
        let record = to_record(&region, None, NodeId::new()).unwrap();
        assert!(record.owner_node_id.is_none());
        assert!(record.data.get(OWNER_FIELD).is_none());
        assert_eq!(record.data["displayName"], "Head");
    }

    #[test]
    fn test_from_record_rejects_wrong_kind() {
        let record = EntityRecord::new(EntityKind::Device, "d1", ts(0, 0), ts(0, 0), json!({}));
        assert!(from_record::<Researcher>(&record).is_err());
    }

    #[test]
    fn test_file_channels() {
        let session: RecordSession = serde_json::from_value(json!({
            "id": "s1",
            "createdAt": ts(0, 0),
            "updatedAt": ts(0, 0),
            "researchId": "r1",
            "records": [{
                "id": "rec1",
                "createdAt": ts(0, 0),
                "updatedAt": ts(0, 0),
                "channels": [
                    {"id": "ch1", "createdAt": ts(0, 0), "updatedAt": ts(0, 0), "fileUrl": "recordings/ch1.edf"},
                    {"id": "ch2", "createdAt": ts(0, 0), "updatedAt": ts(0, 0)},
                    {"id": "ch3", "createdAt": ts(0, 0), "updatedAt": ts(0, 0), "fileUrl": ""}
                ]
            }]
        }))
        .unwrap();
        let ids: Vec<_> = session.file_channels().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ch1"]);
    }
}
