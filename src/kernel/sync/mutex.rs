//! Recursive mutexes with priority inheritance.
//!
//! A held mutex carries a priority: the best current priority among the
//! threads queued on it. The holder's effective priority is the best of its
//! nominal priority and the priorities of every mutex it holds, so a
//! high-priority waiter lifts a low-priority holder until it releases.

use crate::{
    hw::{CoreTiming, CpuCore, GuestMemory},
    kernel::{
        sync::{WaitObject, WaitObjectId, WaitQueue},
        thread::{Priority, Thread, ThreadId, THREAD_PRIO_LOWEST},
        trace::SchedulerEvent,
        KernelSystem,
    },
    Error, Result,
};

/// Identifier of a mutex object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutexId(u32);

impl MutexId {
    /// Creates a mutex id from its raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for MutexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mutex {}", self.0)
    }
}

/// A recursive mutex.
#[derive(Debug)]
pub struct Mutex {
    pub(crate) id: MutexId,
    pub(crate) name: String,
    pub(crate) lock_count: u32,
    /// Priority donated to the holder.
    pub(crate) priority: Priority,
    pub(crate) holder: Option<ThreadId>,
    pub(crate) waiters: WaitQueue,
}

impl Mutex {
    pub(crate) fn new(id: MutexId, name: String) -> Self {
        Self {
            id,
            name,
            lock_count: 0,
            priority: THREAD_PRIO_LOWEST,
            holder: None,
            waiters: WaitQueue::new(),
        }
    }

    /// Returns the mutex id.
    #[must_use]
    pub fn id(&self) -> MutexId {
        self.id
    }

    /// Returns the debug name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns how many times the holder has locked the mutex.
    #[must_use]
    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    /// Returns the priority donated to the holder.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the holding thread.
    #[must_use]
    pub fn holder(&self) -> Option<ThreadId> {
        self.holder
    }
}

impl WaitObject for Mutex {
    fn should_wait(&self, thread: &Thread) -> bool {
        self.lock_count > 0 && self.holder != Some(thread.id)
    }

    fn acquire(&mut self, thread: &mut Thread) {
        assert!(!self.should_wait(thread), "object unavailable!");
        if self.lock_count == 0 {
            self.priority = thread.current_priority;
            thread.held_mutexes.insert(self.id);
            self.holder = Some(thread.id);
        }
        self.lock_count += 1;
    }

    fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn waiters_mut(&mut self) -> &mut WaitQueue {
        &mut self.waiters
    }
}

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> KernelSystem<C, T, M> {
    /// Creates a mutex, locked by the current thread if `initial_locked`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentThread`] if `initial_locked` is set while no
    /// thread is running.
    pub fn create_mutex(&mut self, initial_locked: bool, name: impl Into<String>) -> Result<MutexId> {
        let owner = if initial_locked {
            Some(self.current_thread_id().ok_or(Error::NoCurrentThread)?)
        } else {
            None
        };

        let id = MutexId::new(self.next_object_id());
        self.mutexes.insert(id, Mutex::new(id, name.into()));
        if let Some(owner) = owner {
            self.acquire(WaitObjectId::Mutex(id), owner)?;
        }
        Ok(id)
    }

    /// Returns a mutex by id.
    #[must_use]
    pub fn mutex(&self, id: MutexId) -> Option<&Mutex> {
        self.mutexes.get(&id)
    }

    /// Releases one lock of `mutex` held by `thread`.
    ///
    /// When the last lock goes, the holder's priority is recomputed and the
    /// best eligible waiter takes the mutex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongLockingThread`] if `thread` is not the holder, or
    /// [`Error::InvalidHandle`] if the mutex does not exist.
    pub fn release_mutex(&mut self, mutex: MutexId, thread: ThreadId) -> Result<()> {
        let object = self
            .mutexes
            .get_mut(&mutex)
            .ok_or(Error::InvalidHandle(WaitObjectId::Mutex(mutex)))?;

        if object.holder != Some(thread) {
            if let Some(holder) = object.holder {
                log::error!("Tried to release {mutex} (owned by {holder}) from {thread}");
            }
            return Err(Error::WrongLockingThread);
        }

        object.lock_count -= 1;
        if object.lock_count == 0 {
            if let Some(holder) = self.thread_manager.threads.get_mut(&thread) {
                holder.held_mutexes.remove(&mutex);
            }
            self.update_priority(thread)?;
            if let Some(object) = self.mutexes.get_mut(&mutex) {
                object.holder = None;
            }
            self.wakeup_all_waiting_threads(WaitObjectId::Mutex(mutex))?;
            self.cpu.prepare_reschedule();
        }
        Ok(())
    }

    /// Recomputes the priority `mutex` donates and, if it changed, the
    /// holder's effective priority. Does nothing while the mutex is free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the mutex does not exist.
    pub fn update_mutex_priority(&mut self, mutex: MutexId) -> Result<()> {
        let object = self
            .mutexes
            .get(&mutex)
            .ok_or(Error::InvalidHandle(WaitObjectId::Mutex(mutex)))?;
        let Some(holder) = object.holder else {
            return Ok(());
        };

        let best = object
            .waiters
            .iter()
            .filter_map(|id| self.thread_manager.thread(id))
            .map(Thread::current_priority)
            .fold(THREAD_PRIO_LOWEST, Priority::min);

        if best != object.priority {
            if let Some(object) = self.mutexes.get_mut(&mutex) {
                object.priority = best;
            }
            self.update_priority(holder)?;
        }
        Ok(())
    }

    /// Recomputes `thread`'s effective priority from its nominal priority and
    /// the mutexes it holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    pub fn update_priority(&mut self, thread: ThreadId) -> Result<()> {
        let target = self
            .thread_manager
            .thread(thread)
            .ok_or(Error::InvalidThread(thread))?;

        let best = target
            .held_mutexes
            .iter()
            .filter_map(|id| self.mutexes.get(id))
            .map(Mutex::priority)
            .fold(target.nominal_priority, Priority::min);

        let previous = target.current_priority;
        self.thread_manager.boost_priority(thread, best)?;
        if previous != best {
            self.record(SchedulerEvent::PriorityChange {
                thread,
                nominal: self
                    .thread_manager
                    .thread(thread)
                    .map_or(best, Thread::nominal_priority),
                current: best,
            });
        }
        Ok(())
    }

    /// Force-releases every mutex `thread` holds and wakes their waiters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    pub fn release_thread_mutexes(&mut self, thread: ThreadId) -> Result<()> {
        let held = std::mem::take(
            &mut self
                .thread_manager
                .threads
                .get_mut(&thread)
                .ok_or(Error::InvalidThread(thread))?
                .held_mutexes,
        );

        for mutex in held {
            if let Some(object) = self.mutexes.get_mut(&mutex) {
                object.lock_count = 0;
                object.holder = None;
            }
            self.wakeup_all_waiting_threads(WaitObjectId::Mutex(mutex))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernel::thread::ThreadStatus,
        test::{kernel_with_process, spawn},
    };

    #[test]
    fn test_recursive_lock() {
        let (mut kernel, pid) = kernel_with_process();
        let t = spawn(&mut kernel, pid, 30);
        let m = kernel.create_mutex(false, "m").unwrap();
        let object = WaitObjectId::Mutex(m);

        kernel.acquire(object, t).unwrap();
        kernel.acquire(object, t).unwrap();
        assert_eq!(kernel.mutex(m).unwrap().lock_count(), 2);
        assert!(!kernel.should_wait(object, t).unwrap());

        kernel.release_mutex(m, t).unwrap();
        assert_eq!(kernel.mutex(m).unwrap().holder(), Some(t));
        kernel.release_mutex(m, t).unwrap();
        assert_eq!(kernel.mutex(m).unwrap().holder(), None);
        assert!(kernel.thread(t).unwrap().held_mutexes().is_empty());
    }

    #[test]
    fn test_wrong_locking_thread() {
        let (mut kernel, pid) = kernel_with_process();
        let owner = spawn(&mut kernel, pid, 30);
        let other = spawn(&mut kernel, pid, 30);
        let m = kernel.create_mutex(false, "m").unwrap();

        let err = kernel.release_mutex(m, other).unwrap_err();
        assert!(matches!(err, Error::WrongLockingThread));

        kernel.acquire(WaitObjectId::Mutex(m), owner).unwrap();
        let err = kernel.release_mutex(m, other).unwrap_err();
        assert_eq!(err.result_code().raw(), 0xD8E0_041F);
        assert_eq!(kernel.mutex(m).unwrap().lock_count(), 1);
    }

    #[test]
    fn test_initial_locked_needs_running_thread() {
        let (mut kernel, pid) = kernel_with_process();
        assert!(matches!(
            kernel.create_mutex(true, "m"),
            Err(Error::NoCurrentThread)
        ));

        let t = spawn(&mut kernel, pid, 30);
        kernel.reschedule().unwrap();
        let m = kernel.create_mutex(true, "m").unwrap();
        assert_eq!(kernel.mutex(m).unwrap().holder(), Some(t));
        assert!(kernel.thread(t).unwrap().held_mutexes().contains(&m));
    }

    #[test]
    fn test_priority_inheritance_and_restore() {
        let (mut kernel, pid) = kernel_with_process();
        let holder = spawn(&mut kernel, pid, 20);
        let waiter = spawn(&mut kernel, pid, 3);
        let m = kernel.create_mutex(false, "m").unwrap();
        let object = WaitObjectId::Mutex(m);

        kernel.acquire(object, holder).unwrap();
        assert_eq!(kernel.mutex(m).unwrap().priority(), 20);

        kernel.park_for_test(waiter, ThreadStatus::WaitSynchAny, &[object]);
        assert_eq!(kernel.mutex(m).unwrap().priority(), 3);
        assert!(kernel.thread(waiter).unwrap().pending_mutexes().contains(&m));

        kernel.update_priority(holder).unwrap();
        let h = kernel.thread(holder).unwrap();
        assert_eq!((h.nominal_priority(), h.current_priority()), (20, 3));
        assert_eq!(kernel.thread_manager().ready_queue().contains(holder), Some(3));

        kernel.release_mutex(m, holder).unwrap();
        kernel.update_priority(holder).unwrap();
        assert_eq!(kernel.thread(holder).unwrap().current_priority(), 20);

        // the waiter took over the mutex
        let w = kernel.thread(waiter).unwrap();
        assert_eq!(w.status(), ThreadStatus::Ready);
        assert!(w.pending_mutexes().is_empty());
        assert_eq!(kernel.mutex(m).unwrap().holder(), Some(waiter));
    }

    #[test]
    fn test_release_thread_mutexes_hands_over() {
        let (mut kernel, pid) = kernel_with_process();
        let holder = spawn(&mut kernel, pid, 30);
        let waiter = spawn(&mut kernel, pid, 30);
        let m = kernel.create_mutex(false, "m").unwrap();
        let object = WaitObjectId::Mutex(m);
        kernel.acquire(object, holder).unwrap();
        kernel.acquire(object, holder).unwrap();
        kernel.park_for_test(waiter, ThreadStatus::WaitSynchAny, &[object]);

        kernel.release_thread_mutexes(holder).unwrap();
        assert!(kernel.thread(holder).unwrap().held_mutexes().is_empty());
        let mutex = kernel.mutex(m).unwrap();
        assert_eq!(mutex.holder(), Some(waiter));
        assert_eq!(mutex.lock_count(), 1);
    }
}
