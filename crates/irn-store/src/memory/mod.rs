//! In-process store implementations.
//!
//! These have the same semantics as the persistent backends but keep
//! everything in memory. Each store owns a single map behind an `RwLock`.

mod challenge;
mod channel;
mod entity;
mod registry;
mod session;

pub use challenge::MemoryChallengeStore;
pub use channel::MemoryChannelStore;
pub use entity::MemoryEntityStore;
pub use registry::MemoryNodeRegistry;
pub use session::MemorySessionStore;

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StoreError};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|e| StoreError::LockPoisoned(e.to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|e| StoreError::LockPoisoned(e.to_string()))
}
