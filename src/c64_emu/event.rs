//! Cycle-accurate two-phase event scheduler.
//!
//! Every chip drives itself through callback events, the same concept as
//! the libsidplay `EventScheduler`.  Time is kept in half-cycles: even
//! ticks are PHI1 edges, odd ticks PHI2 edges.  Pending events sit in a
//! binary heap keyed by `(time, sequence)`, so events due at the same
//! half-cycle fire in the order they were scheduled.
//!
//! The scheduler is shared as `Rc<EventScheduler>` and every method takes
//! `&self`: an event body is free to call back into the scheduler (read
//! the time, reschedule itself, cancel others) while it is being fired.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use crossbeam_channel::{unbounded, Receiver, Sender};

// ── Clock types ────────────────────────────────────────────────

/// Cycle counter (signed so deltas can be negative).
pub type EventClock = i64;

/// Two-phase clock.  PHI1 is the first half-cycle, PHI2 the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Phi1 = 0,
    Phi2 = 1,
}

impl Phase {
    fn of(half_cycles: EventClock) -> Self {
        if half_cycles & 1 == 0 {
            Phase::Phi1
        } else {
            Phase::Phi2
        }
    }
}

// ── Event identifier ───────────────────────────────────────────

/// Handle of an event registered with [`EventScheduler::add_event`].
///
/// Only meaningful for the scheduler that handed it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u32);

impl EventId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Body of an event, run every time it fires.
pub type EventAction = Box<dyn FnMut() -> Result<(), String>>;

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// An event body aborted its own firing.  The scheduler is still
    /// consistent and can keep running.
    Fault { event: String, message: String },
    /// The simulation thread's scheduler has been dropped.
    Disconnected,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Fault { event, message } => write!(f, "event '{event}' failed: {message}"),
            EventError::Disconnected => write!(f, "scheduler is gone"),
        }
    }
}

impl std::error::Error for EventError {}

// ── Scheduler entries ──────────────────────────────────────────

struct ScheduledEvent {
    fire_at: EventClock,
    seq: u64,
    id: EventId,
}

impl Eq for ScheduledEvent {}
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want earliest first → reverse.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct EventSlot {
    name: String,
    /// Sequence number of the live heap entry, if any.  Heap entries
    /// carrying any other sequence number are stale.
    pending: Option<u64>,
    /// Taken out while the body runs.
    action: Option<EventAction>,
}

/// Below this many stale heap entries we never bother compacting.
const COMPACT_MIN_STALE: usize = 64;

// ── Cross-thread requests ──────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RemoteRequest {
    id: EventId,
    cycles: EventClock,
    /// `None` = whatever phase the simulation is in when drained.
    phase: Option<Phase>,
}

/// `Send` handle for scheduling events from outside the simulation thread.
///
/// Requests are queued and inserted by the simulation thread itself at the
/// start of its next [`EventScheduler::fire_next`].
#[derive(Debug, Clone)]
pub struct RemoteScheduler {
    tx: Sender<RemoteRequest>,
}

impl RemoteScheduler {
    /// Fire `event` as soon as possible, at the simulation's next safe point.
    pub fn schedule_thread_safe(&self, event: EventId) -> Result<(), EventError> {
        self.send(RemoteRequest {
            id: event,
            cycles: 0,
            phase: None,
        })
    }

    /// Fire `event` `cycles` after the safe point at which it is picked up.
    pub fn schedule(&self, event: EventId, cycles: EventClock, phase: Phase) -> Result<(), EventError> {
        self.send(RemoteRequest {
            id: event,
            cycles,
            phase: Some(phase),
        })
    }

    fn send(&self, req: RemoteRequest) -> Result<(), EventError> {
        self.tx.send(req).map_err(|_| EventError::Disconnected)
    }
}

// ── EventScheduler ─────────────────────────────────────────────

pub struct EventScheduler {
    /// Monotonic master clock (increments by 1 each half-cycle).
    clock: Cell<EventClock>,
    next_seq: Cell<u64>,
    stale: Cell<usize>,
    queue: RefCell<BinaryHeap<ScheduledEvent>>,
    slots: RefCell<Vec<EventSlot>>,
    remote_tx: Sender<RemoteRequest>,
    remote_rx: Receiver<RemoteRequest>,
}

impl EventScheduler {
    pub fn new() -> Self {
        let (remote_tx, remote_rx) = unbounded();
        Self {
            clock: Cell::new(0),
            next_seq: Cell::new(0),
            stale: Cell::new(0),
            queue: RefCell::new(BinaryHeap::new()),
            slots: RefCell::new(Vec::new()),
            remote_tx,
            remote_rx,
        }
    }

    // ── Event registry ─────────────────────────────────────────

    /// Register a reusable event.  The body runs every time the event
    /// comes due; an `Err` aborts that one firing only.
    pub fn add_event<F>(&self, name: impl Into<String>, action: F) -> EventId
    where
        F: FnMut() -> Result<(), String> + 'static,
    {
        let mut slots = self.slots.borrow_mut();
        let id = EventId(slots.len() as u32);
        slots.push(EventSlot {
            name: name.into(),
            pending: None,
            action: Some(Box::new(action)),
        });
        id
    }

    pub fn event_name(&self, event: EventId) -> Option<String> {
        self.slots
            .borrow()
            .get(event.index())
            .map(|slot| slot.name.clone())
    }

    // ── Time queries ───────────────────────────────────────────

    /// Current cycle as seen from the given phase edge.
    ///
    /// From PHI1 both phases read the same cycle.  From PHI2 the PHI1 edge
    /// of this cycle has passed, so PHI1 time already reads the next one.
    pub fn get_time(&self, phase: Phase) -> EventClock {
        let clk = self.clock.get();
        (clk + ((clk & 1) ^ phase as EventClock)) >> 1
    }

    pub fn phase(&self) -> Phase {
        Phase::of(self.clock.get())
    }

    // ── Scheduling ─────────────────────────────────────────────

    /// Schedule `event` to fire `cycles` after `get_time(phase)`, on the
    /// `phase` edge.  A pending event is moved, not duplicated.
    ///
    /// `cycles == 0` in the current phase fires after every event already
    /// queued for this half-cycle.
    pub fn schedule(&self, event: EventId, cycles: EventClock, phase: Phase) {
        debug_assert!(cycles >= 0, "event scheduled {cycles} cycles in the past");
        let now = self.clock.get();
        let mut fire_at = now + (cycles.max(0) << 1);
        if Phase::of(fire_at) != phase {
            fire_at += 1;
        }

        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[event.index()];
            if slot.pending.replace(seq).is_some() {
                self.stale.set(self.stale.get() + 1);
            }
        }
        self.queue.borrow_mut().push(ScheduledEvent {
            fire_at,
            seq,
            id: event,
        });
        self.compact_if_needed();
    }

    /// Schedule in whatever phase the caller is running in.
    pub fn schedule_same_phase(&self, event: EventId, cycles: EventClock) {
        self.schedule(event, cycles, self.phase());
    }

    /// Remove a pending event.  No-op if it is not pending, which includes
    /// an event cancelling itself from its own body.
    pub fn cancel(&self, event: EventId) {
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(event.index()) {
            if slot.pending.take().is_some() {
                self.stale.set(self.stale.get() + 1);
            }
        }
    }

    pub fn is_pending(&self, event: EventId) -> bool {
        self.slots
            .borrow()
            .get(event.index())
            .map_or(false, |slot| slot.pending.is_some())
    }

    /// Number of live pending events.
    pub fn pending_count(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.pending.is_some())
            .count()
    }

    pub fn remote(&self) -> RemoteScheduler {
        RemoteScheduler {
            tx: self.remote_tx.clone(),
        }
    }

    // ── Advance ────────────────────────────────────────────────

    /// Pop the earliest pending event, advance the clock to it and fire it.
    ///
    /// Returns `Ok(false)` when nothing is pending.  A failing body is
    /// reported as [`EventError::Fault`]; the rest of the queue is intact.
    pub fn fire_next(&self) -> Result<bool, EventError> {
        self.drain_remote();

        let Some((id, fire_at)) = self.pop_live() else {
            return Ok(false);
        };
        debug_assert!(fire_at >= self.clock.get(), "clock would run backwards");
        self.clock.set(fire_at.max(self.clock.get()));

        // The body may reschedule (or cancel) its own event, so the slot
        // must look idle while it runs.
        let action = {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[id.index()];
            slot.pending = None;
            slot.action.take()
        };
        let Some(mut action) = action else {
            return Ok(true);
        };

        let result = action();
        let mut slots = self.slots.borrow_mut();
        let slot = &mut slots[id.index()];
        slot.action = Some(action);

        result.map(|()| true).map_err(|message| {
            log::warn!(
                "event '{}' aborted at cycle {}: {message}",
                slot.name,
                fire_at >> 1
            );
            EventError::Fault {
                event: slot.name.clone(),
                message,
            }
        })
    }

    /// Fire every event due before the PHI1 edge of `cycle`, then park the
    /// clock on that edge.  Stops early on the first fault.
    pub fn run_until(&self, cycle: EventClock) -> Result<(), EventError> {
        let target = cycle << 1;
        loop {
            self.drain_remote();
            match self.peek_live() {
                Some(fire_at) if fire_at < target => {
                    self.fire_next()?;
                }
                _ => break,
            }
        }
        if target > self.clock.get() {
            self.clock.set(target);
        }
        Ok(())
    }

    /// Process the next `cycles` whole cycles.
    pub fn run_for(&self, cycles: EventClock) -> Result<(), EventError> {
        // Round a PHI2 position up to the next PHI1 edge.
        let start = (self.clock.get() + 1) >> 1;
        self.run_until(start + cycles)
    }

    /// Keep firing events until `stop` says so or the queue runs dry.
    pub fn run<F>(&self, mut stop: F) -> Result<(), EventError>
    where
        F: FnMut(&Self) -> bool,
    {
        while !stop(self) {
            if !self.fire_next()? {
                break;
            }
        }
        Ok(())
    }

    /// Reset the scheduler (new session).  Registered events survive but
    /// nothing is pending.
    pub fn reset(&self) {
        while self.remote_rx.try_recv().is_ok() {}
        self.clock.set(0);
        self.stale.set(0);
        self.queue.borrow_mut().clear();
        for slot in self.slots.borrow_mut().iter_mut() {
            slot.pending = None;
        }
    }

    // ── Internals ──────────────────────────────────────────────

    fn is_live(&self, entry: &ScheduledEvent) -> bool {
        self.slots.borrow()[entry.id.index()].pending == Some(entry.seq)
    }

    /// Drop stale entries off the top of the heap and peek the next live one.
    fn peek_live(&self) -> Option<EventClock> {
        let mut queue = self.queue.borrow_mut();
        loop {
            let top = queue.peek()?;
            if self.is_live(top) {
                return Some(top.fire_at);
            }
            queue.pop();
            self.stale.set(self.stale.get().saturating_sub(1));
        }
    }

    fn pop_live(&self) -> Option<(EventId, EventClock)> {
        let mut queue = self.queue.borrow_mut();
        while let Some(entry) = queue.pop() {
            if self.is_live(&entry) {
                return Some((entry.id, entry.fire_at));
            }
            self.stale.set(self.stale.get().saturating_sub(1));
        }
        None
    }

    fn compact_if_needed(&self) {
        let stale = self.stale.get();
        let mut queue = self.queue.borrow_mut();
        if stale < COMPACT_MIN_STALE || stale * 2 < queue.len() {
            return;
        }
        let slots = self.slots.borrow();
        queue.retain(|e| slots[e.id.index()].pending == Some(e.seq));
        self.stale.set(0);
    }

    fn drain_remote(&self) {
        while let Ok(req) = self.remote_rx.try_recv() {
            if req.id.index() >= self.slots.borrow().len() {
                log::warn!("dropping remote request for unknown event {:?}", req.id);
                continue;
            }
            log::trace!(
                "remote schedule of '{}' in {} cycles",
                self.slots.borrow()[req.id.index()].name,
                req.cycles
            );
            let phase = req.phase.unwrap_or_else(|| self.phase());
            self.schedule(req.id, req.cycles, phase);
        }
    }
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventScheduler")
            .field("clock", &self.clock.get())
            .field("pending", &self.pending_count())
            .finish()
    }
}
