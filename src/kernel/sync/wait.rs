//! The wait-object protocol.
//!
//! Every synchronizable kernel object (threads as join targets, mutexes,
//! events) answers two questions for a prospective waiter: does it have to
//! block ([`WaitObject::should_wait`]), and what happens when it takes the
//! object ([`WaitObject::acquire`]). Each object also keeps the list of
//! threads blocked on it.
//!
//! # Waking Waiters
//!
//! When an object becomes available the kernel repeatedly picks the best
//! waiter that can run right now: a `WaitSynchAny` waiter for which this
//! object is acquirable, or a `WaitSynchAll` waiter for which every object it
//! waits on is acquirable. The winner acquires (this object, or all of them),
//! its wakeup handler runs with [`WakeupReason::Signal`], it is unlinked from
//! every waiter list and it resumes. This repeats until no waiter qualifies.

use crate::{
    error::{RESULT_SUCCESS, RESULT_TIMEOUT},
    hw::{CoreTiming, CpuCore, GuestMemory},
    kernel::{
        sync::{EventId, MutexId},
        thread::{
            Thread, ThreadId, ThreadStatus, WaitSynchronizationWakeup, WakeupReason,
            THREAD_PRIO_LOWEST,
        },
        trace::SchedulerEvent,
        KernelSystem,
    },
    Error, ResultCode, Result,
};

/// Reference to any object a thread can wait on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WaitObjectId {
    /// Another thread, signalled when it stops.
    Thread(ThreadId),
    /// A mutex.
    Mutex(MutexId),
    /// An event.
    Event(EventId),
}

impl std::fmt::Display for WaitObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitObjectId::Thread(id) => write!(f, "{id}"),
            WaitObjectId::Mutex(id) => write!(f, "{id}"),
            WaitObjectId::Event(id) => write!(f, "{id}"),
        }
    }
}

/// Ordered list of threads blocked on one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WaitQueue {
    threads: Vec<ThreadId>,
}

impl WaitQueue {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `thread` unless it is already present.
    pub fn add(&mut self, thread: ThreadId) {
        if !self.threads.contains(&thread) {
            self.threads.push(thread);
        }
    }

    /// Removes `thread` if present.
    pub fn remove(&mut self, thread: ThreadId) {
        self.threads.retain(|t| *t != thread);
    }

    /// Returns `true` if `thread` is queued.
    #[must_use]
    pub fn contains(&self, thread: ThreadId) -> bool {
        self.threads.contains(&thread)
    }

    /// Iterates the waiters in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.iter().copied()
    }

    /// Returns the number of waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Returns `true` if nobody waits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// A kernel object threads can block on.
pub trait WaitObject {
    /// Returns `true` if `thread` must block to acquire this object.
    fn should_wait(&self, thread: &Thread) -> bool;

    /// Takes the object on behalf of `thread`.
    ///
    /// # Panics
    ///
    /// Panics if [`should_wait`](Self::should_wait) is `true` for `thread`.
    fn acquire(&mut self, thread: &mut Thread);

    /// Returns the threads blocked on this object.
    fn waiters(&self) -> &WaitQueue;

    /// Returns the threads blocked on this object for modification.
    fn waiters_mut(&mut self) -> &mut WaitQueue;
}

impl WaitObject for Thread {
    fn should_wait(&self, _thread: &Thread) -> bool {
        self.status != ThreadStatus::Dead
    }

    fn acquire(&mut self, thread: &mut Thread) {
        assert!(!self.should_wait(thread), "object unavailable!");
    }

    fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn waiters_mut(&mut self) -> &mut WaitQueue {
        &mut self.waiters
    }
}

/// Returns `objects` without repeats, so a handle listed twice is acquired once.
fn distinct(objects: &[WaitObjectId]) -> Vec<WaitObjectId> {
    let mut unique = objects.to_vec();
    unique.sort_unstable();
    unique.dedup();
    unique
}

/// Immediate outcome of [`KernelSystem::wait_synchronization`].
///
/// The caller writes `result` into `r0` and, when present, `output` into
/// `r1` of the live registers. If the thread blocked, its wakeup handler
/// overwrites both in the saved context once the wait resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitSynchronizationResult {
    /// Result code for `r0`.
    pub result: ResultCode,
    /// Index output for `r1`, `None` when the register keeps its value.
    pub output: Option<i32>,
    /// `true` if the thread is now waiting.
    pub blocked: bool,
}

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> KernelSystem<C, T, M> {
    fn object(&self, object: WaitObjectId) -> Option<&dyn WaitObject> {
        match object {
            WaitObjectId::Thread(id) => self
                .thread_manager
                .threads
                .get(&id)
                .map(|t| t as &dyn WaitObject),
            WaitObjectId::Mutex(id) => self.mutexes.get(&id).map(|m| m as &dyn WaitObject),
            WaitObjectId::Event(id) => self.events.get(&id).map(|e| e as &dyn WaitObject),
        }
    }

    fn object_mut(&mut self, object: WaitObjectId) -> Option<&mut dyn WaitObject> {
        match object {
            WaitObjectId::Thread(id) => self
                .thread_manager
                .threads
                .get_mut(&id)
                .map(|t| t as &mut dyn WaitObject),
            WaitObjectId::Mutex(id) => self
                .mutexes
                .get_mut(&id)
                .map(|m| m as &mut dyn WaitObject),
            WaitObjectId::Event(id) => self
                .events
                .get_mut(&id)
                .map(|e| e as &mut dyn WaitObject),
        }
    }

    /// Returns the threads blocked on `object`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the object does not exist.
    pub fn waiting_threads(&self, object: WaitObjectId) -> Result<Vec<ThreadId>> {
        let object_ref = self.object(object).ok_or(Error::InvalidHandle(object))?;
        Ok(object_ref.waiters().iter().collect())
    }

    /// Returns `true` if `thread` would have to block on `object`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] or [`Error::InvalidThread`] for unknown ids.
    pub fn should_wait(&self, object: WaitObjectId, thread: ThreadId) -> Result<bool> {
        let waiter = self
            .thread_manager
            .thread(thread)
            .ok_or(Error::InvalidThread(thread))?;
        let object_ref = self.object(object).ok_or(Error::InvalidHandle(object))?;
        Ok(object_ref.should_wait(waiter))
    }

    /// Acquires `object` for `thread`.
    ///
    /// Taking an unlocked mutex makes `thread` its holder and recomputes the
    /// holder's priority.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] or [`Error::InvalidThread`] for unknown ids.
    ///
    /// # Panics
    ///
    /// Panics if `thread` would have to wait for `object`.
    pub fn acquire(&mut self, object: WaitObjectId, thread: ThreadId) -> Result<()> {
        match object {
            WaitObjectId::Thread(target) => {
                let waiter = self
                    .thread_manager
                    .thread(thread)
                    .ok_or(Error::InvalidThread(thread))?;
                let target = self
                    .thread_manager
                    .thread(target)
                    .ok_or(Error::InvalidHandle(object))?;
                assert!(!target.should_wait(waiter), "object unavailable!");
            }
            WaitObjectId::Mutex(id) => {
                let mutex = self
                    .mutexes
                    .get_mut(&id)
                    .ok_or(Error::InvalidHandle(object))?;
                let waiter = self
                    .thread_manager
                    .threads
                    .get_mut(&thread)
                    .ok_or(Error::InvalidThread(thread))?;
                let first_lock = mutex.lock_count() == 0;
                mutex.acquire(waiter);
                if first_lock {
                    self.update_priority(thread)?;
                    self.cpu.prepare_reschedule();
                }
            }
            WaitObjectId::Event(id) => {
                let event = self
                    .events
                    .get_mut(&id)
                    .ok_or(Error::InvalidHandle(object))?;
                let waiter = self
                    .thread_manager
                    .threads
                    .get_mut(&thread)
                    .ok_or(Error::InvalidThread(thread))?;
                event.acquire(waiter);
            }
        }
        Ok(())
    }

    /// Queues `thread` on `object`.
    ///
    /// For mutexes this also records the mutex as pending on the thread and
    /// refreshes the priority the mutex donates to its holder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] or [`Error::InvalidThread`] for unknown ids.
    pub fn add_waiting_thread(&mut self, object: WaitObjectId, thread: ThreadId) -> Result<()> {
        if self.thread_manager.thread(thread).is_none() {
            return Err(Error::InvalidThread(thread));
        }
        self.object_mut(object)
            .ok_or(Error::InvalidHandle(object))?
            .waiters_mut()
            .add(thread);

        if let WaitObjectId::Mutex(id) = object {
            if let Some(waiter) = self.thread_manager.threads.get_mut(&thread) {
                waiter.pending_mutexes.insert(id);
            }
            self.update_mutex_priority(id)?;
        }
        Ok(())
    }

    /// Removes `thread` from the waiters of `object`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the object does not exist.
    pub fn remove_waiting_thread(&mut self, object: WaitObjectId, thread: ThreadId) -> Result<()> {
        if self.object(object).is_none() {
            return Err(Error::InvalidHandle(object));
        }
        self.unlink_waiter(object, thread)
    }

    /// Removes `thread` from `object`'s waiters, tolerating objects that no
    /// longer exist.
    pub(crate) fn unlink_waiter(&mut self, object: WaitObjectId, thread: ThreadId) -> Result<()> {
        let Some(object_ref) = self.object_mut(object) else {
            return Ok(());
        };
        object_ref.waiters_mut().remove(thread);

        if let WaitObjectId::Mutex(id) = object {
            if let Some(waiter) = self.thread_manager.threads.get_mut(&thread) {
                waiter.pending_mutexes.remove(&id);
            }
            self.update_mutex_priority(id)?;
        }
        Ok(())
    }

    /// Returns the waiter of `object` that should run next, if any can.
    ///
    /// Among waiters for which `object` is acquirable (and, for wait-all
    /// waiters, every other object too) the one with the best current
    /// priority wins; ties go to the earliest waiter.
    ///
    /// # Panics
    ///
    /// Panics if a queued waiter is not in a wait-on-objects status.
    #[must_use]
    pub fn highest_priority_ready_thread(&self, object: WaitObjectId) -> Option<ThreadId> {
        let object_ref = self.object(object)?;
        let mut candidate = None;
        let mut candidate_priority = THREAD_PRIO_LOWEST + 1;

        for id in object_ref.waiters().iter() {
            let Some(thread) = self.thread_manager.thread(id) else {
                continue;
            };
            assert!(
                thread.status.is_waiting_on_objects(),
                "inconsistent thread statuses in waiting_threads: {id} is {}",
                thread.status
            );

            if thread.current_priority >= candidate_priority {
                continue;
            }
            if object_ref.should_wait(thread) {
                continue;
            }

            let ready_to_run = !thread.is_sleeping_on_wait_all()
                || thread.wait_objects.iter().all(|other| {
                    self.object(*other)
                        .is_some_and(|other| !other.should_wait(thread))
                });

            if ready_to_run {
                candidate = Some(id);
                candidate_priority = thread.current_priority;
            }
        }
        candidate
    }

    /// Wakes every waiter of `object` that can now run, best priority first.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures from the objects being acquired.
    pub fn wakeup_all_waiting_threads(&mut self, object: WaitObjectId) -> Result<()> {
        while let Some(id) = self.highest_priority_ready_thread(object) {
            let (wait_all, objects) = match self.thread_manager.thread(id) {
                Some(thread) => (thread.is_sleeping_on_wait_all(), thread.wait_objects.clone()),
                None => break,
            };

            if wait_all {
                for other in distinct(&objects) {
                    self.acquire(other, id)?;
                }
            } else {
                self.acquire(object, id)?;
            }

            if let Some(thread) = self.thread_manager.threads.get_mut(&id) {
                thread.invoke_wakeup(WakeupReason::Signal, Some(object));
            }
            for other in &objects {
                self.unlink_waiter(*other, id)?;
            }
            if let Some(thread) = self.thread_manager.threads.get_mut(&id) {
                thread.wait_objects.clear();
            }

            self.record(SchedulerEvent::Wakeup {
                thread: id,
                reason: WakeupReason::Signal,
                object: Some(object),
            });
            self.resume_from_wait(id)?;
        }
        Ok(())
    }

    /// Waits on `objects` from the current thread.
    ///
    /// Acquires immediately when possible (any one object, or all of them for
    /// `wait_all`). Otherwise a zero timeout reports [`RESULT_TIMEOUT`] at
    /// once, and any other timeout blocks the thread with a
    /// [`WaitSynchronizationWakeup`] handler. A timeout of `-1` waits forever.
    /// A handle listed more than once is acquired once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentThread`] if no thread is running, or
    /// [`Error::InvalidHandle`] for unknown objects.
    pub fn wait_synchronization(
        &mut self,
        objects: &[WaitObjectId],
        wait_all: bool,
        timeout_ns: i64,
    ) -> Result<WaitSynchronizationResult> {
        let id = self.current_thread_id().ok_or(Error::NoCurrentThread)?;

        let mut acquirable = Vec::with_capacity(objects.len());
        for object in objects {
            acquirable.push(!self.should_wait(*object, id)?);
        }

        if wait_all {
            if acquirable.iter().all(|ready| *ready) {
                for object in distinct(objects) {
                    self.acquire(object, id)?;
                }
                return Ok(WaitSynchronizationResult {
                    result: RESULT_SUCCESS,
                    output: None,
                    blocked: false,
                });
            }
        } else if let Some(index) = acquirable.iter().position(|ready| *ready) {
            self.acquire(objects[index], id)?;
            return Ok(WaitSynchronizationResult {
                result: RESULT_SUCCESS,
                output: Some(i32::try_from(index).unwrap_or(i32::MAX)),
                blocked: false,
            });
        }

        if timeout_ns == 0 {
            return Ok(WaitSynchronizationResult {
                result: RESULT_TIMEOUT,
                output: if wait_all { None } else { Some(-1) },
                blocked: false,
            });
        }

        let status = if wait_all {
            ThreadStatus::WaitSynchAll
        } else {
            ThreadStatus::WaitSynchAny
        };
        if let Some(thread) = self.thread_manager.threads.get_mut(&id) {
            thread.status = status;
        }
        for object in objects {
            self.add_waiting_thread(*object, id)?;
        }
        if let Some(thread) = self.thread_manager.threads.get_mut(&id) {
            thread.wait_objects = objects.to_vec();
            thread.set_wakeup_handler(Box::new(WaitSynchronizationWakeup::new(!wait_all)));
        }
        self.wake_after_delay(id, timeout_ns)?;
        self.cpu.prepare_reschedule();

        Ok(WaitSynchronizationResult {
            result: RESULT_TIMEOUT,
            output: Some(-1),
            blocked: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernel::sync::ResetType,
        test::{kernel_with_process, spawn},
    };

    #[test]
    fn test_wait_queue_dedup() {
        let mut queue = WaitQueue::new();
        queue.add(ThreadId::new(1));
        queue.add(ThreadId::new(2));
        queue.add(ThreadId::new(1));
        assert_eq!(queue.len(), 2);
        queue.remove(ThreadId::new(1));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![ThreadId::new(2)]);
        queue.remove(ThreadId::new(1));
        assert!(queue.contains(ThreadId::new(2)));
    }

    #[test]
    fn test_thread_object_waits_until_dead() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        let b = spawn(&mut kernel, pid, 30);
        assert!(kernel.should_wait(WaitObjectId::Thread(b), a).unwrap());

        kernel.stop_thread(b).unwrap();
        assert!(!kernel.should_wait(WaitObjectId::Thread(b), a).unwrap());
        kernel.acquire(WaitObjectId::Thread(b), a).unwrap();
    }

    #[test]
    #[should_panic(expected = "object unavailable!")]
    fn test_acquire_unavailable_panics() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        let b = spawn(&mut kernel, pid, 30);
        let _ = kernel.acquire(WaitObjectId::Thread(b), a);
    }

    #[test]
    fn test_wait_any_immediate_index() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        kernel.reschedule().unwrap();
        assert_eq!(kernel.current_thread_id(), Some(a));

        let busy = kernel.create_event(ResetType::OneShot, "busy");
        let ready = kernel.create_event(ResetType::OneShot, "ready");
        kernel.signal_event(ready).unwrap();

        let objects = [WaitObjectId::Event(busy), WaitObjectId::Event(ready)];
        let outcome = kernel.wait_synchronization(&objects, false, -1).unwrap();
        assert_eq!(outcome.result, RESULT_SUCCESS);
        assert_eq!(outcome.output, Some(1));
        assert!(!outcome.blocked);
        // one-shot events reset on acquire
        assert!(kernel.should_wait(objects[1], a).unwrap());
    }

    #[test]
    fn test_zero_timeout_does_not_block() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        kernel.reschedule().unwrap();

        let event = kernel.create_event(ResetType::Sticky, "never");
        let outcome = kernel
            .wait_synchronization(&[WaitObjectId::Event(event)], false, 0)
            .unwrap();
        assert_eq!(outcome.result, RESULT_TIMEOUT);
        assert_eq!(outcome.output, Some(-1));
        assert_eq!(kernel.thread(a).unwrap().status(), ThreadStatus::Running);
        assert!(kernel
            .waiting_threads(WaitObjectId::Event(event))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_highest_priority_waiter_wins() {
        let (mut kernel, pid) = kernel_with_process();
        let low = spawn(&mut kernel, pid, 40);
        let high = spawn(&mut kernel, pid, 10);
        let event = kernel.create_event(ResetType::OneShot, "ev");
        let object = WaitObjectId::Event(event);

        for id in [low, high] {
            kernel.park_for_test(id, ThreadStatus::WaitSynchAny, &[object]);
        }
        assert_eq!(kernel.highest_priority_ready_thread(object), None);

        kernel.events.get_mut(&event).unwrap().signaled = true;
        assert_eq!(kernel.highest_priority_ready_thread(object), Some(high));
    }

    #[test]
    fn test_wait_all_needs_every_object() {
        let (mut kernel, pid) = kernel_with_process();
        let t = spawn(&mut kernel, pid, 20);
        let first = kernel.create_event(ResetType::Sticky, "a");
        let second = kernel.create_event(ResetType::Sticky, "b");
        let objects = [WaitObjectId::Event(first), WaitObjectId::Event(second)];
        kernel.park_for_test(t, ThreadStatus::WaitSynchAll, &objects);

        kernel.signal_event(first).unwrap();
        assert_eq!(kernel.thread(t).unwrap().status(), ThreadStatus::WaitSynchAll);
        assert_eq!(kernel.waiting_threads(objects[0]).unwrap(), vec![t]);

        kernel.signal_event(second).unwrap();
        let thread = kernel.thread(t).unwrap();
        assert_eq!(thread.status(), ThreadStatus::Ready);
        assert!(thread.wait_objects().is_empty());
        assert!(kernel.waiting_threads(objects[0]).unwrap().is_empty());
        assert!(kernel.waiting_threads(objects[1]).unwrap().is_empty());
    }

    #[test]
    fn test_wait_all_repeated_handle_acquires_once() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        kernel.reschedule().unwrap();
        assert_eq!(kernel.current_thread_id(), Some(a));

        let event = kernel.create_event(ResetType::OneShot, "twice");
        let object = WaitObjectId::Event(event);
        kernel.signal_event(event).unwrap();

        let outcome = kernel.wait_synchronization(&[object, object], true, -1).unwrap();
        assert_eq!(outcome.result, RESULT_SUCCESS);
        assert!(!outcome.blocked);
        assert!(!kernel.event(event).unwrap().is_signaled());
    }

    #[test]
    fn test_wait_all_repeated_handle_wakes_once() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        kernel.reschedule().unwrap();

        let event = kernel.create_event(ResetType::OneShot, "twice");
        let object = WaitObjectId::Event(event);
        assert!(kernel.wait_synchronization(&[object, object], true, -1).unwrap().blocked);
        assert_eq!(kernel.waiting_threads(object).unwrap(), vec![a]);

        kernel.signal_event(event).unwrap();
        assert_eq!(kernel.thread(a).unwrap().status(), ThreadStatus::Ready);
        assert!(kernel.thread(a).unwrap().wait_objects().is_empty());
        assert!(!kernel.event(event).unwrap().is_signaled());
    }
}
