//! Sync wire types: entity groups, manifest, pages and the import payload.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use irn_core::{HasSessionToken, NodeId, SessionToken};
use irn_store::EntityKind;

use crate::entities::{Device, RecordSession, Research, Researcher, SnomedCatalog, Volunteer};
use crate::error::SyncError;

/// Default entity page size.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Largest page size a responder will serve.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Clamp a requested page size to `1..=MAX_PAGE_SIZE`.
pub fn clamp_page_size(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

// ─────────────────────────────────────────────────────────────────────────────
// Groups
// ─────────────────────────────────────────────────────────────────────────────

/// A top-level collection fetched page by page.
///
/// Groups are fetched and imported in [`EntityGroup::ALL`] order so every
/// referenced row is present before the rows that point at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntityGroup {
    SnomedBodyRegions,
    SnomedBodyStructures,
    SnomedTopographicalModifiers,
    SnomedLateralities,
    SnomedSeverityCodes,
    SnomedClinicalConditions,
    SnomedClinicalEvents,
    SnomedMedications,
    SnomedAllergyIntolerances,
    Volunteers,
    Researchers,
    Devices,
    Research,
    Sessions,
}

impl EntityGroup {
    pub const ALL: [EntityGroup; 14] = [
        EntityGroup::SnomedBodyRegions,
        EntityGroup::SnomedBodyStructures,
        EntityGroup::SnomedTopographicalModifiers,
        EntityGroup::SnomedLateralities,
        EntityGroup::SnomedSeverityCodes,
        EntityGroup::SnomedClinicalConditions,
        EntityGroup::SnomedClinicalEvents,
        EntityGroup::SnomedMedications,
        EntityGroup::SnomedAllergyIntolerances,
        EntityGroup::Volunteers,
        EntityGroup::Researchers,
        EntityGroup::Devices,
        EntityGroup::Research,
        EntityGroup::Sessions,
    ];

    /// URL path segment under `/api/sync/`.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityGroup::SnomedBodyRegions => "snomed-body-regions",
            EntityGroup::SnomedBodyStructures => "snomed-body-structures",
            EntityGroup::SnomedTopographicalModifiers => "snomed-topographical-modifiers",
            EntityGroup::SnomedLateralities => "snomed-lateralities",
            EntityGroup::SnomedSeverityCodes => "snomed-severity-codes",
            EntityGroup::SnomedClinicalConditions => "snomed-clinical-conditions",
            EntityGroup::SnomedClinicalEvents => "snomed-clinical-events",
            EntityGroup::SnomedMedications => "snomed-medications",
            EntityGroup::SnomedAllergyIntolerances => "snomed-allergy-intolerances",
            EntityGroup::Volunteers => "volunteers",
            EntityGroup::Researchers => "researchers",
            EntityGroup::Devices => "devices",
            EntityGroup::Research => "research",
            EntityGroup::Sessions => "sessions",
        }
    }

    /// Kind of the group's top-level rows.
    pub fn root_kind(self) -> EntityKind {
        match self {
            EntityGroup::SnomedBodyRegions => EntityKind::SnomedBodyRegion,
            EntityGroup::SnomedBodyStructures => EntityKind::SnomedBodyStructure,
            EntityGroup::SnomedTopographicalModifiers => EntityKind::SnomedTopographicalModifier,
            EntityGroup::SnomedLateralities => EntityKind::SnomedLaterality,
            EntityGroup::SnomedSeverityCodes => EntityKind::SnomedSeverityCode,
            EntityGroup::SnomedClinicalConditions => EntityKind::SnomedClinicalCondition,
            EntityGroup::SnomedClinicalEvents => EntityKind::SnomedClinicalEvent,
            EntityGroup::SnomedMedications => EntityKind::SnomedMedication,
            EntityGroup::SnomedAllergyIntolerances => EntityKind::SnomedAllergyIntolerance,
            EntityGroup::Volunteers => EntityKind::Volunteer,
            EntityGroup::Researchers => EntityKind::Researcher,
            EntityGroup::Devices => EntityKind::Device,
            EntityGroup::Research => EntityKind::Research,
            EntityGroup::Sessions => EntityKind::RecordSession,
        }
    }

    /// Nested children embedded in each exported row.
    pub fn children(self) -> &'static [ChildSpec] {
        match self {
            EntityGroup::Volunteers => VOLUNTEER_CHILDREN,
            EntityGroup::Research => RESEARCH_CHILDREN,
            EntityGroup::Sessions => SESSION_CHILDREN,
            _ => &[],
        }
    }

    pub fn is_snomed(self) -> bool {
        self.as_str().starts_with("snomed-")
    }
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityGroup {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityGroup::ALL
            .iter()
            .copied()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| SyncError::InvalidEntity(format!("unknown entity group: {s}")))
    }
}

impl From<EntityGroup> for String {
    fn from(g: EntityGroup) -> Self {
        g.as_str().to_string()
    }
}

impl TryFrom<String> for EntityGroup {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A nested child collection: JSON field, row kind, and its own children.
#[derive(Debug)]
pub struct ChildSpec {
    pub field: &'static str,
    pub kind: EntityKind,
    pub children: &'static [ChildSpec],
}

const VOLUNTEER_CHILDREN: &[ChildSpec] = &[
    ChildSpec { field: "conditions", kind: EntityKind::VolunteerCondition, children: &[] },
    ChildSpec { field: "allergies", kind: EntityKind::VolunteerAllergy, children: &[] },
    ChildSpec { field: "medications", kind: EntityKind::VolunteerMedication, children: &[] },
    ChildSpec { field: "clinicalEvents", kind: EntityKind::VolunteerClinicalEvent, children: &[] },
];

const RESEARCH_CHILDREN: &[ChildSpec] = &[
    ChildSpec { field: "applications", kind: EntityKind::ResearchApplication, children: &[] },
    ChildSpec { field: "devices", kind: EntityKind::ResearchDevice, children: &[] },
    ChildSpec { field: "researchers", kind: EntityKind::ResearchResearcher, children: &[] },
    ChildSpec { field: "volunteers", kind: EntityKind::ResearchVolunteer, children: &[] },
];

const CHANNEL_CHILDREN: &[ChildSpec] = &[ChildSpec { field: "targetAreas", kind: EntityKind::TargetArea, children: &[] }];

const RECORD_CHILDREN: &[ChildSpec] = &[ChildSpec {
    field: "channels",
    kind: EntityKind::RecordChannel,
    children: CHANNEL_CHILDREN,
}];

const SESSION_CHILDREN: &[ChildSpec] = &[ChildSpec { field: "records", kind: EntityKind::Record, children: RECORD_CHILDREN }];

// ─────────────────────────────────────────────────────────────────────────────
// Manifest and pages
// ─────────────────────────────────────────────────────────────────────────────

/// `POST /api/sync/manifest` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

impl HasSessionToken for ManifestRequest {
    fn session_token(&self) -> Option<&SessionToken> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group: EntityGroup,
    pub count: u64,
    pub latest_update: Option<DateTime<Utc>>,
}

/// What a node can offer, filtered to `updatedAt > since` when given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub node_id: NodeId,
    pub node_name: String,
    pub generated_at: DateTime<Utc>,
    /// Watermark of the responder's latest completed import from the requester.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub groups: Vec<GroupSummary>,
    pub recording_count: u64,
}

impl Manifest {
    pub fn group(&self, group: EntityGroup) -> Option<&GroupSummary> {
        self.groups.iter().find(|g| g.group == group)
    }

    pub fn total_count(&self) -> u64 {
        self.groups.iter().map(|g| g.count).sum()
    }
}

/// `GET /api/sync/{group}` query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

impl PageQuery {
    pub fn new(page: u32, page_size: u32, since: Option<DateTime<Utc>>) -> Self {
        Self {
            page: Some(page),
            page_size: Some(page_size),
            since,
        }
    }
}

/// One page of a group, 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPage<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total_records: u64,
    pub total_pages: u32,
}

impl<T> EntityPage<T> {
    pub fn has_more(&self) -> bool {
        self.page < self.total_pages
    }
}

/// Number of pages needed for `total` rows.
pub fn page_count(total: u64, page_size: u32) -> u32 {
    let size = u64::from(page_size.max(1));
    u32::try_from(total.div_ceil(size)).unwrap_or(u32::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording files
// ─────────────────────────────────────────────────────────────────────────────

/// `GET /api/sync/recordings/{id}/file` response plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    pub channel_id: String,
    pub file_name: String,
    pub content_type: String,
    /// Base64 file bytes.
    pub content: String,
}

/// Blob name for a channel's `fileUrl`: its last path segment.
pub fn file_name_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

// ─────────────────────────────────────────────────────────────────────────────
// Import payload
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one pull fetched, in dependency order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncImportPayload {
    pub source_node_id: NodeId,
    /// The manifest's `generatedAt`; becomes the next watermark.
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub snomed: SnomedCatalog,
    #[serde(default)]
    pub volunteers: Vec<Volunteer>,
    #[serde(default)]
    pub researchers: Vec<Researcher>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub research: Vec<Research>,
    #[serde(default)]
    pub sessions: Vec<RecordSession>,
    #[serde(default)]
    pub recording_files: Vec<RecordingFile>,
}

impl SyncImportPayload {
    pub fn new(source_node_id: NodeId, generated_at: DateTime<Utc>) -> Self {
        Self {
            source_node_id,
            generated_at,
            snomed: SnomedCatalog::default(),
            volunteers: Vec::new(),
            researchers: Vec::new(),
            devices: Vec::new(),
            research: Vec::new(),
            sessions: Vec::new(),
            recording_files: Vec::new(),
        }
    }
}

impl HasSessionToken for SyncImportPayload {
    fn session_token(&self) -> Option<&SessionToken> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_order_puts_references_first() {
        let pos = |g| EntityGroup::ALL.iter().position(|x| *x == g).unwrap();
        assert!(EntityGroup::ALL[..9].iter().all(|g| g.is_snomed()));
        assert!(pos(EntityGroup::Volunteers) < pos(EntityGroup::Research));
        assert!(pos(EntityGroup::Devices) < pos(EntityGroup::Research));
        assert!(pos(EntityGroup::Researchers) < pos(EntityGroup::Research));
        assert!(pos(EntityGroup::Research) < pos(EntityGroup::Sessions));
    }

    #[test]
    fn test_group_path_roundtrip() {
        for group in EntityGroup::ALL {
            assert_eq!(group.as_str().parse::<EntityGroup>().unwrap(), group);
        }
        assert!("patients".parse::<EntityGroup>().is_err());
        let json = serde_json::to_string(&EntityGroup::SnomedLateralities).unwrap();
        assert_eq!(json, "\"snomed-lateralities\"");
    }

    #[test]
    fn test_page_size_and_count() {
        assert_eq!(clamp_page_size(None), 100);
        assert_eq!(clamp_page_size(Some(0)), 1);
        assert_eq!(clamp_page_size(Some(5000)), 1000);
        assert_eq!(page_count(0, 100), 0);
        assert_eq!(page_count(100, 100), 1);
        assert_eq!(page_count(101, 100), 2);
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://a.example/files/ch1.edf"), Some("ch1.edf"));
        assert_eq!(file_name_from_url("recordings/ch2.wav?sig=abc"), Some("ch2.wav"));
        assert_eq!(file_name_from_url("plain.bin"), Some("plain.bin"));
        assert_eq!(file_name_from_url("dir/"), None);
        assert_eq!(file_name_from_url("dir/.."), None);
    }
}
