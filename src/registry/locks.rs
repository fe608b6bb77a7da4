// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers for the registry.
//!
//! A fetch task that panics while holding the registry lock poisons it.
//! Refusing every later request would take the whole proxy down, so the
//! guard is recovered and the event is logged instead.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "registry::locks",
                event = "LOCK_POISONED_READ",
                "Registry lock was poisoned during read acquisition; recovering"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "registry::locks",
                event = "LOCK_POISONED_WRITE",
                "Registry lock was poisoned during write acquisition; recovering"
            );
            poisoned.into_inner()
        }
    }
}
