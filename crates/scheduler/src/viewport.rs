//! Viewport-aware thumbnail priorities
//!
//! Pages currently visible in the thumbnail strip are rendered first,
//! pages within a margin of the visible range next (so scrolling finds
//! them ready), everything else last.

use std::ops::RangeInclusive;

/// Priority of a visible page.
pub const VISIBLE_PRIORITY: i32 = 0;
/// Priority of a page within the margin around the visible range.
pub const MARGIN_PRIORITY: i32 = 1;
/// Priority of any other page.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Maps page indices to queue priorities from the visible range.
///
/// # Example
///
/// ```
/// use readium_scheduler::ViewportPriority;
///
/// let viewport = ViewportPriority::new(10, 14, 2);
/// assert_eq!(viewport.priority_for(12), 0);
/// assert_eq!(viewport.priority_for(8), 1);
/// assert_eq!(viewport.priority_for(20), 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewportPriority {
    visible: Option<(usize, usize)>,
    margin: usize,
}

impl ViewportPriority {
    /// Visible pages `first..=last`; the bounds may come in either order.
    pub fn new(first: usize, last: usize, margin: usize) -> Self {
        Self {
            visible: Some((first.min(last), first.max(last))),
            margin,
        }
    }

    /// No visible range: every page gets the default priority.
    pub fn hidden() -> Self {
        Self::default()
    }

    pub fn visible_range(&self) -> Option<RangeInclusive<usize>> {
        self.visible.map(|(first, last)| first..=last)
    }

    /// Visible range widened by the margin.
    pub fn margin_range(&self) -> Option<RangeInclusive<usize>> {
        self.visible
            .map(|(first, last)| first.saturating_sub(self.margin)..=last.saturating_add(self.margin))
    }

    pub fn is_visible(&self, page: usize) -> bool {
        self.visible_range().is_some_and(|range| range.contains(&page))
    }

    pub fn priority_for(&self, page: usize) -> i32 {
        if self.is_visible(page) {
            VISIBLE_PRIORITY
        } else if self.margin_range().is_some_and(|range| range.contains(&page)) {
            MARGIN_PRIORITY
        } else {
            DEFAULT_PRIORITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_viewport() {
        let viewport = ViewportPriority::hidden();
        assert_eq!(viewport.priority_for(0), DEFAULT_PRIORITY);
        assert!(viewport.visible_range().is_none());
    }

    #[test]
    fn test_priorities() {
        let viewport = ViewportPriority::new(5, 7, 2);
        let priorities: Vec<i32> = (2..=10).map(|page| viewport.priority_for(page)).collect();
        assert_eq!(priorities, vec![5, 1, 1, 0, 0, 0, 1, 1, 5]);
    }

    #[test]
    fn test_reversed_bounds() {
        let viewport = ViewportPriority::new(7, 5, 0);
        assert_eq!(viewport.visible_range(), Some(5..=7));
        assert_eq!(viewport.priority_for(4), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_margin_clamps_at_zero() {
        let viewport = ViewportPriority::new(0, 1, 3);
        assert_eq!(viewport.margin_range(), Some(0..=4));
        assert_eq!(viewport.priority_for(4), MARGIN_PRIORITY);
    }
}
