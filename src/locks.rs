// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! A panic while a `std::sync::RwLock` is held marks it poisoned. The data
//! guarded here (engine job tables, runner handles) stays usable after such
//! a panic, so we log the event and take the guard anyway instead of
//! propagating the panic into every later caller.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reeldown::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reeldown::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}
