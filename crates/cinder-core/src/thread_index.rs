//! Dense per-thread indices.
//!
//! Every participating thread registers once at startup and receives a small
//! integer in `[0, capacity)`. Per-thread data (command pools, compiler
//! contexts) then lives in a plain array indexed by that integer, see
//! [`PerThread`].

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Small dense index of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadIndex(u32);

impl ThreadIndex {
    /// Returned for threads that never registered.
    pub const INVALID: Self = Self(u32::MAX);

    /// Raw index value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Index usable for array lookups.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether this is a real index rather than [`ThreadIndex::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl std::fmt::Display for ThreadIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            f.write_str("#invalid")
        }
    }
}

/// Fixed thread budget: one main thread, the background pool, one cleanup thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadBudget {
    /// Number of background pool workers.
    pub background_workers: u32,
}

impl ThreadBudget {
    /// Budget for a machine with `cpu_count` logical CPUs.
    ///
    /// Three CPUs are left for the main thread, the cleanup thread and the OS.
    #[must_use]
    pub fn from_cpu_count(cpu_count: usize) -> Self {
        let workers = cpu_count.saturating_sub(3);
        Self {
            background_workers: u32::try_from(workers).unwrap_or(u32::MAX - 2),
        }
    }

    /// Budget for the current machine.
    #[must_use]
    pub fn detect() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::from_cpu_count(cpus)
    }

    /// Total number of thread slots.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.background_workers + 2
    }
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (registry id, index) for every registry this thread joined. Ids are
    // never reused, so entries of dropped registries are inert.
    static CURRENT: RefCell<Vec<(u64, ThreadIndex)>> = const { RefCell::new(Vec::new()) };
}

fn cached_index(registry: u64) -> Option<ThreadIndex> {
    CURRENT.with(|entries| {
        entries
            .borrow()
            .iter()
            .find(|(id, _)| *id == registry)
            .map(|&(_, index)| index)
    })
}

/// Hands out thread indices up to a fixed budget.
///
/// The counter is only locked during registration. Lookups read a
/// thread-local cache of the calling thread's own index.
#[derive(Debug)]
pub struct ThreadRegistry {
    id: u64,
    capacity: u32,
    next: Mutex<u32>,
}

impl ThreadRegistry {
    /// Create a registry with room for `capacity` threads.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            next: Mutex::new(0),
        }
    }

    /// Create a registry sized for `budget`.
    #[must_use]
    pub fn with_budget(budget: ThreadBudget) -> Self {
        Self::new(budget.total())
    }

    /// Total thread slots.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of threads registered so far.
    #[must_use]
    pub fn registered(&self) -> u32 {
        *self.next.lock()
    }

    /// Register the calling thread, once, at thread startup.
    pub fn register_current_thread(&self) -> Result<ThreadIndex> {
        let existing = cached_index(self.id);
        debug_assert!(existing.is_none(), "thread registered twice with one registry");
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let index = {
            let mut next = self.next.lock();
            if *next >= self.capacity {
                return Err(Error::TooManyThreads {
                    budget: self.capacity,
                });
            }
            let index = ThreadIndex(*next);
            *next += 1;
            index
        };

        CURRENT.with(|entries| entries.borrow_mut().push((self.id, index)));
        tracing::debug!(
            thread = std::thread::current().name().unwrap_or("<unnamed>"),
            %index,
            "Registered thread"
        );
        Ok(index)
    }

    /// Index of the calling thread, or [`ThreadIndex::INVALID`] if it never registered.
    #[must_use]
    pub fn current_thread_index(&self) -> ThreadIndex {
        cached_index(self.id).unwrap_or(ThreadIndex::INVALID)
    }
}

/// One slot per registered thread, stored as a plain array.
#[derive(Debug)]
pub struct PerThread<T> {
    slots: Box<[T]>,
}

impl<T> PerThread<T> {
    /// Build every slot up front from the registry capacity.
    pub fn new(registry: &ThreadRegistry, mut init: impl FnMut(ThreadIndex) -> T) -> Self {
        let slots = (0..registry.capacity())
            .map(|i| init(ThreadIndex(i)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    /// Build every slot, stopping at the first error.
    pub fn try_new<E>(
        registry: &ThreadRegistry,
        mut init: impl FnMut(ThreadIndex) -> std::result::Result<T, E>,
    ) -> std::result::Result<Self, E> {
        let slots = (0..registry.capacity())
            .map(|i| init(ThreadIndex(i)))
            .collect::<std::result::Result<Vec<_>, E>>()?
            .into_boxed_slice();
        Ok(Self { slots })
    }

    /// Slot for `index`. `None` for [`ThreadIndex::INVALID`].
    #[must_use]
    pub fn get(&self, index: ThreadIndex) -> Option<&T> {
        self.slots.get(index.as_usize())
    }

    /// Mutable slot for `index`.
    pub fn get_mut(&mut self, index: ThreadIndex) -> Option<&mut T> {
        self.slots.get_mut(index.as_usize())
    }

    /// Slot of the calling thread.
    #[must_use]
    pub fn current(&self, registry: &ThreadRegistry) -> Option<&T> {
        self.get(registry.current_thread_index())
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate all slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    /// Consume the array, yielding every slot.
    pub fn into_vec(self) -> Vec<T> {
        self.slots.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    fn register_on_new_thread(registry: &Arc<ThreadRegistry>) -> Result<ThreadIndex> {
        let registry = Arc::clone(registry);
        thread::spawn(move || registry.register_current_thread())
            .join()
            .unwrap()
    }

    #[test]
    fn budget_reserves_three_cpus() {
        assert_eq!(ThreadBudget::from_cpu_count(16).background_workers, 13);
        assert_eq!(ThreadBudget::from_cpu_count(2).background_workers, 0);
        assert_eq!(ThreadBudget::from_cpu_count(2).total(), 2);
        assert_eq!(ThreadBudget::from_cpu_count(8).total(), 7);
    }

    #[test]
    fn unregistered_thread_is_invalid() {
        let registry = ThreadRegistry::new(4);
        assert_eq!(registry.current_thread_index(), ThreadIndex::INVALID);
        assert!(!registry.current_thread_index().is_valid());
    }

    #[test]
    fn registration_is_cached_per_thread() {
        let registry = ThreadRegistry::new(4);
        let index = registry.register_current_thread().unwrap();
        assert_eq!(index, ThreadIndex(0));
        assert_eq!(registry.current_thread_index(), index);
    }

    #[test]
    fn index_is_scoped_to_its_registry() {
        let a = ThreadRegistry::new(2);
        let b = ThreadRegistry::new(2);
        a.register_current_thread().unwrap();
        assert_eq!(b.current_thread_index(), ThreadIndex::INVALID);
    }

    #[test]
    fn second_registry_keeps_first_index() {
        let a = ThreadRegistry::new(2);
        let b = ThreadRegistry::new(2);
        let in_a = a.register_current_thread().unwrap();
        let in_b = b.register_current_thread().unwrap();
        assert_eq!(a.current_thread_index(), in_a);
        assert_eq!(b.current_thread_index(), in_b);

        let slots = PerThread::new(&a, |i| i.get());
        assert_eq!(slots.current(&a), Some(&in_a.get()));
    }

    #[test]
    fn per_thread_slots_follow_capacity() {
        let registry = ThreadRegistry::new(3);
        let slots = PerThread::new(&registry, |i| i.get() * 10);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots.get(ThreadIndex(2)), Some(&20));
        assert_eq!(slots.get(ThreadIndex::INVALID), None);
        assert_eq!(slots.current(&registry), None);

        registry.register_current_thread().unwrap();
        assert_eq!(slots.current(&registry), Some(&0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn registration_fills_budget_then_fails(capacity in 0u32..12) {
            let registry = Arc::new(ThreadRegistry::new(capacity));
            let mut seen = Vec::new();
            for _ in 0..capacity {
                seen.push(register_on_new_thread(&registry).unwrap());
            }
            let expected: Vec<_> = (0..capacity).map(ThreadIndex).collect();
            prop_assert_eq!(seen, expected);
            prop_assert_eq!(
                register_on_new_thread(&registry),
                Err(Error::TooManyThreads { budget: capacity })
            );
        }
    }
}
