//! Multi-level ready queue.
//!
//! One FIFO list per priority level plus a bitmap of non-empty levels, so
//! finding the best runnable thread is a single `trailing_zeros` on a `u64`.
//! Levels must be [`prepare`](ReadyQueue::prepare)d before threads are
//! pushed onto them.

use std::collections::VecDeque;

use crate::kernel::thread::state::{Priority, PRIORITY_LEVELS};

/// Priority-indexed FIFO lists of runnable threads.
///
/// A thread appears in at most one level and at most once. Within a level,
/// [`push_back`](Self::push_back) and [`pop_first`](Self::pop_first) keep FIFO
/// order; [`push_front`](Self::push_front) is reserved for preempted threads
/// that should run again before their peers.
#[derive(Clone, Debug)]
pub struct ReadyQueue<T> {
    levels: [VecDeque<T>; PRIORITY_LEVELS],
    /// Bit `p` set when level `p` has at least one entry.
    occupied: u64,
    /// Bit `p` set once level `p` has been prepared.
    prepared: u64,
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
            occupied: 0,
            prepared: 0,
        }
    }
}

impl<T: Copy + PartialEq> ReadyQueue<T> {
    /// Creates an empty queue with no prepared levels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn level(priority: Priority) -> usize {
        let index = priority as usize;
        assert!(index < PRIORITY_LEVELS, "priority {priority} out of range");
        index
    }

    fn mark(&mut self, index: usize) {
        if self.levels[index].is_empty() {
            self.occupied &= !(1u64 << index);
        } else {
            self.occupied |= 1u64 << index;
        }
    }

    /// Makes `priority` eligible for selection. Idempotent.
    pub fn prepare(&mut self, priority: Priority) {
        let index = Self::level(priority);
        self.prepared |= 1u64 << index;
    }

    /// Returns `true` if `priority` has been prepared.
    #[must_use]
    pub fn is_prepared(&self, priority: Priority) -> bool {
        let index = Self::level(priority);
        self.prepared & (1u64 << index) != 0
    }

    /// Appends `thread` to the tail of `priority`.
    pub fn push_back(&mut self, priority: Priority, thread: T) {
        let index = Self::level(priority);
        debug_assert!(self.prepared & (1u64 << index) != 0, "level {priority} not prepared");
        self.levels[index].push_back(thread);
        self.occupied |= 1u64 << index;
    }

    /// Inserts `thread` at the head of `priority`.
    pub fn push_front(&mut self, priority: Priority, thread: T) {
        let index = Self::level(priority);
        debug_assert!(self.prepared & (1u64 << index) != 0, "level {priority} not prepared");
        self.levels[index].push_front(thread);
        self.occupied |= 1u64 << index;
    }

    /// Removes and returns the head of the best non-empty level.
    pub fn pop_first(&mut self) -> Option<T> {
        self.pop_from(self.occupied)
    }

    /// Like [`pop_first`](Self::pop_first) but only considers levels strictly
    /// better (numerically lower) than `priority`.
    pub fn pop_first_better(&mut self, priority: Priority) -> Option<T> {
        let index = Self::level(priority);
        let better = (1u64 << index) - 1;
        self.pop_from(self.occupied & better)
    }

    fn pop_from(&mut self, candidates: u64) -> Option<T> {
        if candidates == 0 {
            return None;
        }
        let index = candidates.trailing_zeros() as usize;
        let thread = self.levels[index].pop_front();
        self.mark(index);
        thread
    }

    /// Returns the head of the best non-empty level without removing it.
    #[must_use]
    pub fn get_first(&self) -> Option<T> {
        if self.occupied == 0 {
            return None;
        }
        let index = self.occupied.trailing_zeros() as usize;
        self.levels[index].front().copied()
    }

    /// Removes `thread` from `priority`. Does nothing if it is not there.
    pub fn remove(&mut self, priority: Priority, thread: T) {
        let index = Self::level(priority);
        self.levels[index].retain(|t| *t != thread);
        self.mark(index);
    }

    /// Moves `thread` from `old` to the tail of `new`.
    pub fn move_thread(&mut self, thread: T, old: Priority, new: Priority) {
        self.remove(old, thread);
        self.prepare(new);
        self.push_back(new, thread);
    }

    /// Returns the level holding `thread`, if any.
    #[must_use]
    pub fn contains(&self, thread: T) -> Option<Priority> {
        self.levels
            .iter()
            .position(|level| level.contains(&thread))
            .and_then(|index| Priority::try_from(index).ok())
    }

    /// Returns the threads queued at `priority`, head first.
    pub fn level_iter(&self, priority: Priority) -> impl Iterator<Item = T> + '_ {
        self.levels[Self::level(priority)].iter().copied()
    }

    /// Returns the total number of queued threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    /// Returns `true` if no thread is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(levels: &[Priority]) -> ReadyQueue<u32> {
        let mut queue = ReadyQueue::new();
        for &p in levels {
            queue.prepare(p);
        }
        queue
    }

    #[test]
    fn test_fifo_within_level() {
        let mut queue = prepared(&[30]);
        for id in 1..=5 {
            queue.push_back(30, id);
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_first()).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_best_level_first() {
        let mut queue = prepared(&[5, 10, 63]);
        queue.push_back(63, 3);
        queue.push_back(10, 1);
        queue.push_back(5, 2);
        assert_eq!(queue.get_first(), Some(2));
        assert_eq!(queue.pop_first(), Some(2));
        assert_eq!(queue.pop_first(), Some(1));
        assert_eq!(queue.pop_first(), Some(3));
        assert_eq!(queue.pop_first(), None);
    }

    #[test]
    fn test_push_front_jumps_level() {
        let mut queue = prepared(&[5]);
        queue.push_back(5, 1);
        queue.push_back(5, 2);
        queue.push_front(5, 9);
        assert_eq!(queue.level_iter(5).collect::<Vec<_>>(), vec![9, 1, 2]);
    }

    #[test]
    fn test_pop_first_better_is_strict() {
        let mut queue = prepared(&[0, 10, 20]);
        queue.push_back(10, 1);
        queue.push_back(20, 2);

        assert_eq!(queue.pop_first_better(10), None);
        assert_eq!(queue.pop_first_better(0), None);
        assert_eq!(queue.pop_first_better(11), Some(1));
        assert_eq!(queue.pop_first_better(63), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_first_better_never_returns_worse() {
        let mut queue = prepared(&(0..64).collect::<Vec<_>>());
        for p in 0..64u32 {
            queue.push_back(p, p);
        }
        for limit in (1..64u32).rev() {
            if let Some(found) = queue.pop_first_better(limit) {
                assert!(found < limit);
            }
        }
    }

    #[test]
    fn test_remove_and_contains() {
        let mut queue = prepared(&[7, 8]);
        queue.push_back(7, 1);
        queue.push_back(7, 2);
        assert_eq!(queue.contains(2), Some(7));

        queue.remove(7, 2);
        assert_eq!(queue.contains(2), None);
        queue.remove(7, 2);
        queue.remove(8, 1);
        assert_eq!(queue.len(), 1);

        queue.move_thread(1, 7, 8);
        assert_eq!(queue.contains(1), Some(8));
        assert_eq!(queue.level_iter(7).count(), 0);
        assert_eq!(queue.pop_first_better(8), None);
    }

    #[test]
    fn test_move_prepares_target() {
        let mut queue = prepared(&[40]);
        queue.push_back(40, 1);
        assert!(!queue.is_prepared(12));
        queue.move_thread(1, 40, 12);
        assert!(queue.is_prepared(12));
        assert_eq!(queue.pop_first(), Some(1));
    }
}
