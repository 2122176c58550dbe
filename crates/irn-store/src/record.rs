//! Storage-level records for synchronised entities and sync attempts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use irn_core::NodeId;

use crate::error::StoreError;

/// Every entity type the sync engine persists.
///
/// Kinds are stored by their string form, so renaming a variant's string is a
/// schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    SnomedBodyRegion,
    SnomedBodyStructure,
    SnomedTopographicalModifier,
    SnomedLaterality,
    SnomedSeverityCode,
    SnomedClinicalCondition,
    SnomedClinicalEvent,
    SnomedMedication,
    SnomedAllergyIntolerance,
    Volunteer,
    VolunteerCondition,
    VolunteerAllergy,
    VolunteerMedication,
    VolunteerClinicalEvent,
    Researcher,
    Device,
    Research,
    ResearchApplication,
    ResearchDevice,
    ResearchResearcher,
    ResearchVolunteer,
    RecordSession,
    Record,
    RecordChannel,
    TargetArea,
}

impl EntityKind {
    pub const ALL: [EntityKind; 25] = [
        EntityKind::SnomedBodyRegion,
        EntityKind::SnomedBodyStructure,
        EntityKind::SnomedTopographicalModifier,
        EntityKind::SnomedLaterality,
        EntityKind::SnomedSeverityCode,
        EntityKind::SnomedClinicalCondition,
        EntityKind::SnomedClinicalEvent,
        EntityKind::SnomedMedication,
        EntityKind::SnomedAllergyIntolerance,
        EntityKind::Volunteer,
        EntityKind::VolunteerCondition,
        EntityKind::VolunteerAllergy,
        EntityKind::VolunteerMedication,
        EntityKind::VolunteerClinicalEvent,
        EntityKind::Researcher,
        EntityKind::Device,
        EntityKind::Research,
        EntityKind::ResearchApplication,
        EntityKind::ResearchDevice,
        EntityKind::ResearchResearcher,
        EntityKind::ResearchVolunteer,
        EntityKind::RecordSession,
        EntityKind::Record,
        EntityKind::RecordChannel,
        EntityKind::TargetArea,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::SnomedBodyRegion => "snomed_body_region",
            EntityKind::SnomedBodyStructure => "snomed_body_structure",
            EntityKind::SnomedTopographicalModifier => "snomed_topographical_modifier",
            EntityKind::SnomedLaterality => "snomed_laterality",
            EntityKind::SnomedSeverityCode => "snomed_severity_code",
            EntityKind::SnomedClinicalCondition => "snomed_clinical_condition",
            EntityKind::SnomedClinicalEvent => "snomed_clinical_event",
            EntityKind::SnomedMedication => "snomed_medication",
            EntityKind::SnomedAllergyIntolerance => "snomed_allergy_intolerance",
            EntityKind::Volunteer => "volunteer",
            EntityKind::VolunteerCondition => "volunteer_condition",
            EntityKind::VolunteerAllergy => "volunteer_allergy",
            EntityKind::VolunteerMedication => "volunteer_medication",
            EntityKind::VolunteerClinicalEvent => "volunteer_clinical_event",
            EntityKind::Researcher => "researcher",
            EntityKind::Device => "device",
            EntityKind::Research => "research",
            EntityKind::ResearchApplication => "research_application",
            EntityKind::ResearchDevice => "research_device",
            EntityKind::ResearchResearcher => "research_researcher",
            EntityKind::ResearchVolunteer => "research_volunteer",
            EntityKind::RecordSession => "record_session",
            EntityKind::Record => "record",
            EntityKind::RecordChannel => "record_channel",
            EntityKind::TargetArea => "target_area",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown entity kind: {s}")))
    }
}

/// One stored entity row.
///
/// `data` is the entity's own JSON without nested children; children are rows
/// of their own that point back through `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    pub parent_id: Option<String>,
    pub owner_node_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EntityRecord {
    /// Build a record. Timestamps are truncated to microseconds, the
    /// resolution every backend stores, so watermark comparisons agree.
    pub fn new(
        kind: EntityKind,
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            parent_id: None,
            owner_node_id: None,
            created_at: truncate_micros(created_at),
            updated_at: truncate_micros(updated_at),
            data,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_owner(mut self, owner: Option<NodeId>) -> Self {
        self.owner_node_id = owner;
        self
    }
}

/// Truncate a timestamp to microsecond precision.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Count and newest `updated_at` for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindSummary {
    pub count: u64,
    pub latest_update: Option<DateTime<Utc>>,
}

/// Status of a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SyncStatus::InProgress),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(StoreError::InvalidData(format!("unknown sync status: {other}"))),
        }
    }
}

/// Per-group counts for one sync attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounts {
    pub snomed: u64,
    pub volunteers: u64,
    pub researchers: u64,
    pub devices: u64,
    pub research: u64,
    pub sessions: u64,
    pub recording_files: u64,
    /// Rows left untouched because the stored copy was as new or newer.
    pub skipped: u64,
}

impl SyncCounts {
    /// Rows inserted or overwritten across all groups.
    pub fn written(&self) -> u64 {
        self.snomed + self.volunteers + self.researchers + self.devices + self.research + self.sessions
    }
}

/// One pull/import attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: Uuid,
    pub remote_node_id: NodeId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
}

impl SyncLog {
    /// A new in-progress attempt starting now.
    pub fn start(remote_node_id: NodeId) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_node_id,
            started_at: truncate_micros(Utc::now()),
            completed_at: None,
            status: SyncStatus::InProgress,
            last_synced_at: None,
            counts: SyncCounts::default(),
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("spaceship".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_record_truncates_to_micros() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let rec = EntityRecord::new(EntityKind::Device, "d1", ts, ts, serde_json::json!({}));
        assert_eq!(rec.updated_at.timestamp_subsec_nanos(), 123_456_000);
    }
}
