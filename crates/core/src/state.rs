//! Per-page generation state
//!
//! ```text
//! Idle -> Queued -> Rendering -> Cached | Failed
//!           |           |
//!           +-----------+--> Cancelled
//! Rendering -> Queued          (retry)
//! Cached | Failed | Cancelled -> Queued   (requested again)
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use crate::lock;

/// Where a page is in the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageState {
    #[default]
    Idle,
    Queued,
    Rendering,
    Cached,
    Failed,
    Cancelled,
}

impl PageState {
    pub fn can_transition_to(self, next: PageState) -> bool {
        use PageState::*;

        matches!(
            (self, next),
            (_, Idle)
                | (Idle | Cached | Failed | Cancelled, Queued)
                | (Rendering, Queued)
                | (Queued, Rendering)
                | (Rendering, Cached | Failed)
                | (Queued | Rendering, Cancelled)
        )
    }

    /// Queued or rendering.
    pub fn is_pending(self) -> bool {
        matches!(self, PageState::Queued | PageState::Rendering)
    }
}

/// Thread-safe page state table; pages never touched are `Idle`.
#[derive(Default)]
pub struct PageStateTable {
    states: Mutex<HashMap<usize, PageState>>,
}

impl PageStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, page: usize) -> PageState {
        lock(&self.states).get(&page).copied().unwrap_or_default()
    }

    /// Move `page` to `next` if the state machine allows it.
    ///
    /// Staying in the same state is always allowed. Returns whether the
    /// page is now in `next`.
    pub fn transition(&self, page: usize, next: PageState) -> bool {
        let mut states = lock(&self.states);
        let current = states.get(&page).copied().unwrap_or_default();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            log::trace!("Ignoring page {page} transition {current:?} -> {next:?}");
            return false;
        }

        if next == PageState::Idle {
            states.remove(&page);
        } else {
            states.insert(page, next);
        }
        true
    }

    /// Number of pages currently in `state` (never counts `Idle`).
    pub fn count(&self, state: PageState) -> usize {
        lock(&self.states).values().filter(|s| **s == state).count()
    }

    /// Every non-idle page with its state, by page index.
    pub fn snapshot(&self) -> Vec<(usize, PageState)> {
        let mut states: Vec<(usize, PageState)> =
            lock(&self.states).iter().map(|(page, state)| (*page, *state)).collect();
        states.sort_unstable_by_key(|(page, _)| *page);
        states
    }

    pub fn clear(&self) {
        lock(&self.states).clear();
    }
}
