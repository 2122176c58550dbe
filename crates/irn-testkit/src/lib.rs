//! # IRN Testkit
//!
//! Testing utilities for research nodes.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Identities**: three node identities (`node-a`, `node-b`, `node-c`)
//!   with RSA-2048 keys and X.509 certificates, plus an expired certificate
//! - **Fixtures**: entity builders, a sample payload touching every group, and
//!   an in-memory [`SyncNode`]
//! - **Generators**: proptest strategies for entities and payloads
//!
//! ## Test Fixtures
//!
//! ```rust
//! use chrono::Utc;
//! use irn_core::ChannelId;
//! use irn_testkit::TestIdentity;
//!
//! let a = TestIdentity::node_a();
//! let request = a.identify_request(&ChannelId::generate(), Utc::now());
//! assert!(a.certificate.verify_base64(request.signed_message().as_bytes(), &request.signature));
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use irn_testkit::generators;
//!
//! proptest! {
//!     #[test]
//!     fn reimport_is_noop(payload in generators::payload()) {
//!         // import twice, compare stores
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{all_identities, sample_payload, SyncNode, TestIdentity, SAMPLE_PAYLOAD_ROWS};
