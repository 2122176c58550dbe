//! # IRN Node
//!
//! A research node: the encrypted four-phase handshake on both sides, the
//! sync endpoints, and pulls from registered peers.
//!
//! ## Overview
//!
//! ```text
//! Initiator (HandshakeClient)              Responder (server::router)
//!     |                                        |
//!     |-- 1 POST /api/channel/open ----------->|  ECDH, cipher negotiation
//!     |<-- X-Channel-Id + ephemeral key -------|
//!     |-- 2 POST /api/node/identify ---------->|  certificate + signature
//!     |-- 3 POST /api/node/challenge --------->|
//!     |-- 3 POST /api/node/authenticate ------>|  signed challenge
//!     |<-- session token ----------------------|
//!     |-- 4 /api/sync/* (X-Session-Id) ------->|  rate limited, per class
//!     |-- POST /api/channel/close ------------>|
//! ```
//!
//! Every body after Phase 1 is an AEAD envelope under the channel key.
//!
//! ## Key Types
//!
//! - [`ResearchNode`] - Stores, services, client and puller wired together
//! - [`HandshakeClient`] - Initiator side of all phases
//! - [`ChannelManager`] - Responder side of Phase 1
//! - [`RemoteSource`] - Sync source over an authenticated channel
//! - [`NodeConfig`] - `irn-node.toml`
//!
//! ## Design Notes
//!
//! - **Explicit pipeline**: handlers call channel lookup, decryption,
//!   identity verification and session authorization as plain functions.
//! - **Separate channel stores**: channels a node opens as initiator never
//!   share a store with the channels it serves.
//! - **Closing is best effort**: a failed remote close still drops the
//!   local channel.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod remote;
pub mod server;

pub use irn_auth as auth;
pub use irn_core as core;
pub use irn_store as store;
pub use irn_sync as sync;

pub use channel::{ChannelConfig, ChannelManager, PendingChannel};
pub use client::{AuthenticatedChannel, ClientConfig, HandshakeClient, NodeCredentials};
pub use config::{CacheBackend, NodeConfig};
pub use error::{ApiError, NodeError, Result};
pub use node::{NodeOptions, NodeStores, ResearchNode};
pub use remote::RemoteSource;
pub use server::{router, AppState, NodeServices};
