//! Readium Core Library
//!
//! The thumbnail generator façade and everything a viewer needs around it:
//! request validation, per-page state, generator events, configuration and
//! a consumer-side thumbnail model with viewport priorities.

pub mod config;
pub mod error;
pub mod events;
pub mod generator;
pub mod model;
pub mod state;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use config::{GeneratorConfig, ModelConfig, MAX_QUALITY, MIN_QUALITY};
pub use error::{RequestError, RequestResult};
pub use events::{EventBus, GeneratorEvent};
pub use generator::{GeneratorStatistics, ThumbnailGenerator, ThumbnailOptions};
pub use model::ThumbnailModel;
pub use state::{PageState, PageStateTable};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
