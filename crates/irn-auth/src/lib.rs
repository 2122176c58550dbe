//! # IRN Auth
//!
//! Identity, challenge-response authentication and sessions.
//!
//! ## Overview
//!
//! - [`NodeIdentityService`] verifies identify signatures and runs the
//!   registration lifecycle (`Pending` until an operator approves).
//! - [`ChallengeAuth`] issues one-time 32-byte challenges and, when a node
//!   signs one correctly, issues a session.
//! - [`SessionManager`] validates sessions, checks capability and enforces
//!   per-session sliding-window rate limits by [`EndpointClass`].
//!
//! ## Design Notes
//!
//! - **Outcomes, not errors**: a bad signature or an expired challenge is a
//!   normal result ([`IdentityCheck`], [`ChallengeOutcome`], [`Authorization`]).
//!   [`AuthError`] is reserved for storage and configuration faults.
//! - **Single-use challenges**: every verification attempt consumes the
//!   challenge, successful or not.
//! - **Channel-bound sessions**: a session is only accepted on the channel it
//!   was issued for.

pub mod challenge;
pub mod error;
pub mod identity;
pub mod session;

pub use challenge::{ChallengeAuth, ChallengeConfig, ChallengeOutcome, DEFAULT_CHALLENGE_TTL_SECS};
pub use error::{AuthError, Result};
pub use identity::{within_skew, IdentityCheck, IdentityConfig, NodeIdentityService, DEFAULT_MAX_CLOCK_SKEW_SECS};
pub use session::{
    has_capability, Authorization, Denial, EndpointClass, SessionConfig, SessionManager,
    DEFAULT_RATE_LIMIT_PER_MINUTE, DEFAULT_SYNC_RATE_LIMIT_PER_MINUTE,
};
