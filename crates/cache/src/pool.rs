//! Pixel buffer pool
//!
//! Render workers borrow scratch buffers sized for `w * h * 4` RGBA bytes
//! instead of allocating one per job. A borrowed buffer is moved out of its
//! pool entry into a [`PooledBuffer`] guard, so an entry can never be handed
//! to two callers; dropping the guard returns it.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::clamp_pool_size;
use crate::{lock, CacheConfig};

/// Free buffers idle for longer than this are dropped by [`MemoryPool::sweep`].
pub const IDLE_BUFFER_AGE: Duration = Duration::from_secs(5 * 60);

const BYTES_PER_PIXEL: usize = 4;

struct PoolEntry {
    id: u64,
    /// Empty while the entry is lent out
    buffer: Vec<u8>,
    /// Bytes reserved against the pool budget
    reserved: usize,
    last_used: Instant,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    capacity: usize,
    next_id: u64,
    reuses: u64,
    allocations: u64,
    exhausted: u64,
}

impl PoolState {
    fn reserved(&self) -> usize {
        self.entries.iter().map(|entry| entry.reserved).sum()
    }

    /// Drop free entries, oldest first, until the budget is respected.
    fn prune_to_capacity(&mut self) -> usize {
        let mut pruned = 0;
        while self.reserved() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| !entry.in_use)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(index, _)| index);
            match oldest {
                Some(index) => {
                    self.entries.swap_remove(index);
                    pruned += 1;
                }
                None => break,
            }
        }
        pruned
    }
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub entries: usize,
    pub in_use: usize,
    /// Bytes reserved by all entries, lent out or not
    pub bytes_reserved: usize,
    pub capacity: usize,
    /// Acquisitions served by an existing entry
    pub reuses: u64,
    /// Acquisitions that created a new entry
    pub allocations: u64,
    /// Acquisitions refused for lack of budget
    pub exhausted: u64,
}

/// Budgeted pool of RGBA scratch buffers.
///
/// # Example
///
/// ```
/// use readium_cache::MemoryPool;
///
/// let pool = MemoryPool::new(16 * 1024 * 1024);
/// {
///     let mut buffer = pool.acquire(100, 100).unwrap();
///     buffer[0] = 255;
///     assert_eq!(buffer.len(), 100 * 100 * 4);
/// }
/// // Returned on drop and reused by the next request that fits
/// let _again = pool.acquire(50, 50).unwrap();
/// assert_eq!(pool.stats().reuses, 1);
/// ```
#[derive(Clone)]
pub struct MemoryPool {
    state: Arc<Mutex<PoolState>>,
}

impl MemoryPool {
    /// Create a pool with the given byte budget (clamped to 16-512 MB).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                capacity: clamp_pool_size(capacity),
                ..Default::default()
            })),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.memory_pool_size)
    }

    /// Borrow a buffer of exactly `w * h * 4` bytes.
    ///
    /// Reuses the smallest free entry that is large enough, otherwise
    /// allocates a new one if the budget allows. Returns `None` when the
    /// budget is exhausted; callers then allocate outside the pool.
    pub fn acquire(&self, width: u32, height: u32) -> Option<PooledBuffer> {
        let required = width as usize * height as usize * BYTES_PER_PIXEL;
        let mut state = lock(&self.state);

        let reusable = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.in_use && entry.reserved >= required)
            .min_by_key(|(_, entry)| entry.reserved)
            .map(|(index, _)| index);

        if let Some(index) = reusable {
            state.reuses += 1;
            let entry = &mut state.entries[index];
            entry.in_use = true;
            let mut buffer = std::mem::take(&mut entry.buffer);
            buffer.resize(required, 0);
            return Some(PooledBuffer {
                pool: Arc::clone(&self.state),
                id: entry.id,
                buffer,
                size: (width, height),
            });
        }

        if state.reserved() + required > state.capacity {
            state.exhausted += 1;
            log::debug!(
                "Memory pool exhausted: {} bytes requested, {} of {} reserved",
                required,
                state.reserved(),
                state.capacity
            );
            return None;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.allocations += 1;
        state.entries.push(PoolEntry {
            id,
            buffer: Vec::new(),
            reserved: required,
            last_used: Instant::now(),
            in_use: true,
        });

        Some(PooledBuffer {
            pool: Arc::clone(&self.state),
            id,
            buffer: vec![0; required],
            size: (width, height),
        })
    }

    /// Drop free entries idle for more than five minutes, then prune free
    /// entries until the pool is within budget. Returns entries removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) against an explicit clock reading.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut state = lock(&self.state);
        let before = state.entries.len();
        state.entries.retain(|entry| {
            entry.in_use || now.saturating_duration_since(entry.last_used) <= IDLE_BUFFER_AGE
        });
        let idle = before - state.entries.len();
        idle + state.prune_to_capacity()
    }

    /// Change the budget (clamped to 16-512 MB), pruning free entries.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = lock(&self.state);
        state.capacity = clamp_pool_size(capacity);
        let pruned = state.prune_to_capacity();
        if pruned > 0 {
            log::debug!("Memory pool resized to {} bytes, pruned {pruned} buffers", state.capacity);
        }
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Bytes currently reserved by pool entries.
    pub fn usage(&self) -> usize {
        lock(&self.state).reserved()
    }

    /// Drop every entry that is not lent out.
    pub fn clear(&self) {
        lock(&self.state).entries.retain(|entry| entry.in_use);
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            entries: state.entries.len(),
            in_use: state.entries.iter().filter(|entry| entry.in_use).count(),
            bytes_reserved: state.reserved(),
            capacity: state.capacity,
            reuses: state.reuses,
            allocations: state.allocations,
            exhausted: state.exhausted,
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// A buffer lent out by a [`MemoryPool`], returned when dropped.
pub struct PooledBuffer {
    pool: Arc<Mutex<PoolState>>,
    id: u64,
    buffer: Vec<u8>,
    size: (u32, u32),
}

impl PooledBuffer {
    /// Pixel dimensions this buffer was acquired for.
    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut state = lock(&self.pool);
        let over_budget = state.reserved() > state.capacity;
        let Some(index) = state.entries.iter().position(|entry| entry.id == self.id) else {
            return;
        };

        if over_budget {
            state.entries.swap_remove(index);
            return;
        }

        let entry = &mut state.entries[index];
        entry.buffer = std::mem::take(&mut self.buffer);
        entry.in_use = false;
        entry.last_used = Instant::now();
    }
}
