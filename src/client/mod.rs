//! Client half: the services a dashboard shell embeds.
//!
//! Each service is an explicit instance with its own constructor and reset.
//! Nothing here is global, so several domains (or tests) can run side by side.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
pub mod csrf;
pub mod guard;
pub mod lifecycle;
pub mod single_flight;
pub mod storage;
pub mod sync;
pub mod types;

/// A poisoned lock only means another task panicked mid-update; the caches
/// guarded here stay usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
