//! # IRN Sync
//!
//! Pull-based, incremental entity synchronisation between research nodes.
//!
//! ## Overview
//!
//! A requester asks a responder for a [`Manifest`], then fetches each
//! [`EntityGroup`] page by page, in dependency order, with rows newer than
//! its watermark. The assembled [`SyncImportPayload`] is applied locally in
//! a single transaction by [`SyncImporter`].
//!
//! ```text
//! Requester                                Responder
//!     |                                        |
//!     |-- manifest(since) -------------------->|  SyncExporter::manifest
//!     |<-- counts + latest updates ------------|
//!     |                                        |
//!     |-- page(group, since, n) x groups ----->|  SyncExporter::page
//!     |<-- rows with nested children ----------|
//!     |                                        |
//!     |-- recording_file(channel) x files ---->|  SyncExporter::recording_file
//!     |<-- file or nothing --------------------|
//!     |                                        |
//!  SyncImporter::import (one transaction)      |
//! ```
//!
//! ## Key Types
//!
//! - [`SyncExporter`] - Responder: manifest, entity pages, recording files
//! - [`SyncPuller`] - Requester: resolve target and watermark, fetch, import
//! - [`SyncSource`] - Transport seam between puller and a responder
//! - [`SyncImporter`] - Transactional newer-wins import with failure logging
//!
//! ## Design Notes
//!
//! - **Newer wins**: a row is overwritten only by a strictly newer
//!   `updatedAt`. Re-importing a payload is a no-op.
//! - **Ownership is local**: owned entities are attributed to the importing
//!   node; the remote id never lands in an owner field.
//! - **Failures are visible**: a rolled-back import still leaves a `failed`
//!   SyncLog, written outside the aborted transaction.
//! - **Files are best effort**: recording files are uploaded after commit
//!   and a failed file never fails the batch.

pub mod conflict;
pub mod entities;
pub mod error;
pub mod export;
pub mod import;
pub mod messages;
pub mod pull;

pub use conflict::{resolve, Resolution};
pub use entities::{
    from_record, to_record, Device, Record, RecordChannel, RecordSession, Research, ResearchApplication,
    ResearchDevice, ResearchResearcher, ResearchVolunteer, Researcher, SnomedAllergyIntolerance, SnomedBodyRegion,
    SnomedBodyStructure, SnomedCatalog, SnomedClinicalCondition, SnomedClinicalEvent, SnomedLaterality,
    SnomedMedication, SnomedSeverityCode, SnomedTopographicalModifier, SyncEntity, TargetArea, Volunteer,
    VolunteerAllergy, VolunteerClinicalEvent, VolunteerCondition, VolunteerMedication,
};
pub use error::{Result, SyncError};
pub use export::SyncExporter;
pub use import::{ImportConfig, ImportReport, SyncImporter};
pub use messages::{
    clamp_page_size, file_name_from_url, EntityGroup, EntityPage, GroupSummary, Manifest, ManifestRequest, PageQuery,
    RecordingFile, SyncImportPayload, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use pull::{LocalSource, PullConfig, SyncPuller, SyncSource};
