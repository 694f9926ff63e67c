//! Signalable events.

use strum::Display;

use crate::{
    hw::{CoreTiming, CpuCore, GuestMemory},
    kernel::{
        sync::{WaitObject, WaitObjectId, WaitQueue},
        thread::Thread,
        KernelSystem,
    },
    Error, Result,
};

/// Identifier of an event object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u32);

impl EventId {
    /// Creates an event id from its raw value.
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

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event {}", self.0)
    }
}

/// How an event returns to the unsignalled state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ResetType {
    /// Cleared by the first waiter that acquires it.
    OneShot,
    /// Stays signalled until cleared explicitly.
    Sticky,
    /// Wakes whoever is waiting at signal time, then clears.
    Pulse,
}

/// An event object.
#[derive(Debug)]
pub struct Event {
    pub(crate) id: EventId,
    pub(crate) name: String,
    pub(crate) reset_type: ResetType,
    pub(crate) signaled: bool,
    pub(crate) waiters: WaitQueue,
}

impl Event {
    /// Returns the event id.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Returns the debug name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the reset behavior.
    #[must_use]
    pub fn reset_type(&self) -> ResetType {
        self.reset_type
    }

    /// Returns `true` while signalled.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.signaled
    }
}

impl WaitObject for Event {
    fn should_wait(&self, _thread: &Thread) -> bool {
        !self.signaled
    }

    fn acquire(&mut self, thread: &mut Thread) {
        assert!(!self.should_wait(thread), "object unavailable!");
        if self.reset_type == ResetType::OneShot {
            self.signaled = false;
        }
    }

    fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn waiters_mut(&mut self) -> &mut WaitQueue {
        &mut self.waiters
    }
}

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> KernelSystem<C, T, M> {
    /// Creates an unsignalled event.
    pub fn create_event(&mut self, reset_type: ResetType, name: impl Into<String>) -> EventId {
        let id = EventId::new(self.next_object_id());
        self.events.insert(
            id,
            Event {
                id,
                name: name.into(),
                reset_type,
                signaled: false,
                waiters: WaitQueue::new(),
            },
        );
        id
    }

    /// Returns an event by id.
    #[must_use]
    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    /// Signals `event` and wakes the waiters it satisfies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the event does not exist.
    pub fn signal_event(&mut self, event: EventId) -> Result<()> {
        let object = WaitObjectId::Event(event);
        self.events
            .get_mut(&event)
            .ok_or(Error::InvalidHandle(object))?
            .signaled = true;

        self.wakeup_all_waiting_threads(object)?;

        if let Some(ev) = self.events.get_mut(&event) {
            if ev.reset_type == ResetType::Pulse {
                ev.signaled = false;
            }
        }
        Ok(())
    }

    /// Returns `event` to the unsignalled state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the event does not exist.
    pub fn clear_event(&mut self, event: EventId) -> Result<()> {
        self.events
            .get_mut(&event)
            .ok_or(Error::InvalidHandle(WaitObjectId::Event(event)))?
            .signaled = false;
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
    fn test_one_shot_wakes_single_waiter() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        let b = spawn(&mut kernel, pid, 30);
        let ev = kernel.create_event(ResetType::OneShot, "one");
        let object = WaitObjectId::Event(ev);
        kernel.park_for_test(a, ThreadStatus::WaitSynchAny, &[object]);
        kernel.park_for_test(b, ThreadStatus::WaitSynchAny, &[object]);

        kernel.signal_event(ev).unwrap();
        assert_eq!(kernel.thread(a).unwrap().status(), ThreadStatus::Ready);
        assert_eq!(kernel.thread(b).unwrap().status(), ThreadStatus::WaitSynchAny);
        assert!(!kernel.event(ev).unwrap().is_signaled());
        assert_eq!(kernel.waiting_threads(object).unwrap(), vec![b]);
    }

    #[test]
    fn test_sticky_wakes_everyone_and_stays() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        let b = spawn(&mut kernel, pid, 12);
        let ev = kernel.create_event(ResetType::Sticky, "sticky");
        let object = WaitObjectId::Event(ev);
        kernel.park_for_test(a, ThreadStatus::WaitSynchAny, &[object]);
        kernel.park_for_test(b, ThreadStatus::WaitSynchAny, &[object]);

        kernel.signal_event(ev).unwrap();
        assert_eq!(kernel.thread(a).unwrap().status(), ThreadStatus::Ready);
        assert_eq!(kernel.thread(b).unwrap().status(), ThreadStatus::Ready);
        assert!(kernel.event(ev).unwrap().is_signaled());

        kernel.clear_event(ev).unwrap();
        assert!(!kernel.event(ev).unwrap().is_signaled());
    }

    #[test]
    fn test_pulse_clears_after_wakeup() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 30);
        let ev = kernel.create_event(ResetType::Pulse, "pulse");
        kernel.park_for_test(a, ThreadStatus::WaitSynchAny, &[WaitObjectId::Event(ev)]);

        kernel.signal_event(ev).unwrap();
        assert_eq!(kernel.thread(a).unwrap().status(), ThreadStatus::Ready);
        assert!(!kernel.event(ev).unwrap().is_signaled());
    }

    #[test]
    fn test_unknown_event() {
        let (mut kernel, _) = kernel_with_process();
        let missing = EventId::new(99);
        assert!(matches!(
            kernel.signal_event(missing),
            Err(Error::InvalidHandle(WaitObjectId::Event(id))) if id == missing
        ));
    }
}
