#![doc = include_str!("../README.md")]

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static SCHEDULE: Counter = Counter::new("send_monitor.schedule");
static SCHEDULE_FULL: Counter = Counter::new("send_monitor.schedule.full");
static SCHEDULE_CLOSED: Counter = Counter::new("send_monitor.schedule.closed");
static ENTER: Counter = Counter::new("send_monitor.enter");
static PARK: Counter = Counter::new("send_monitor.park");
static WAKE: Counter = Counter::new("send_monitor.wake");
static RECLAIM: Counter = Counter::new("send_monitor.reclaim");
static LEAVE: Counter = Counter::new("send_monitor.leave");
static INTERRUPTED: Counter = Counter::new("send_monitor.interrupted");
static INTERRUPT: Counter = Counter::new("send_monitor.interrupt");
static INTERRUPT_MISS: Counter = Counter::new("send_monitor.interrupt.miss");
static INTERRUPT_AT_HEAD: Counter = Counter::new("send_monitor.interrupt.at_head");
static PAUSE: Counter = Counter::new("send_monitor.pause");
static RESUME: Counter = Counter::new("send_monitor.resume");
static CLOSE: Counter = Counter::new("send_monitor.close");
static ABANDON: Counter = Counter::new("send_monitor.abandon");

/// Register all biometrics for the crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&SCHEDULE);
    collector.register_counter(&SCHEDULE_FULL);
    collector.register_counter(&SCHEDULE_CLOSED);
    collector.register_counter(&ENTER);
    collector.register_counter(&PARK);
    collector.register_counter(&WAKE);
    collector.register_counter(&RECLAIM);
    collector.register_counter(&LEAVE);
    collector.register_counter(&INTERRUPTED);
    collector.register_counter(&INTERRUPT);
    collector.register_counter(&INTERRUPT_MISS);
    collector.register_counter(&INTERRUPT_AT_HEAD);
    collector.register_counter(&PAUSE);
    collector.register_counter(&RESUME);
    collector.register_counter(&CLOSE);
    collector.register_counter(&ABANDON);
}

///////////////////////////////////////////// indicio //////////////////////////////////////////////

/// The indicio collector for the crate.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type of the monitor.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// Every slot in the monitor's queue is taken.  Back off and retry.
    QueueFull,
    /// The monitor was closed.  It will never admit anyone again.
    Closed,
    /// Another thread interrupted this waiter while it was queued.
    Interrupted,
    /// The handle passed to [SendMonitor::interrupt] does not name a queued
    /// waiter.  The waiter may have entered, or it may already have been
    /// interrupted; the two cases are indistinguishable.
    NoSuchWaiter,
}

impl Error {
    /// The fixed negative integer assigned to this error.  These values are a
    /// binary contract with systems that exchange monitor status as errno-style
    /// codes; they will not change.
    pub const fn errno(&self) -> i32 {
        match self {
            Error::QueueFull => -11,
            Error::Closed => -77,
            Error::Interrupted => -4,
            Error::NoSuchWaiter => -3,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::QueueFull => write!(fmt, "queue full"),
            Error::Closed => write!(fmt, "monitor closed"),
            Error::Interrupted => write!(fmt, "interrupted while queued"),
            Error::NoSuchWaiter => write!(fmt, "no such waiter"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////// Signal //////////////////////////////////////////////

/// An opaque token proving that the holder is parked inside [SendMonitor::enter].  It carries the
/// monitor's coordination lock across a [Signal::park] call so that release and reacquisition stay
/// atomic without the lock itself crossing the API.
pub struct Parked<'a> {
    guard: MutexGuard<'a, State>,
}

impl<'a> Parked<'a> {
    /// Block on `cond` until notified, atomically releasing the token's lock for the duration.
    /// Spurious returns are fine; the monitor re-parks until it is actually admitted or
    /// cancelled.
    pub fn wait(self, cond: &Condvar) -> Self {
        Parked {
            guard: cond.wait(self.guard).unwrap(),
        }
    }
}

impl Debug for Parked<'_> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(fmt, "Parked")
    }
}

/// A caller-supplied parking primitive.  The monitor parks a waiter on its signal and wakes it by
/// calling [Signal::notify] from whichever thread releases the critical section.  One signal may
/// serve many monitors over its lifetime, but must outlive any park in progress and must not be
/// parked on two monitors at once.
pub trait Signal: Send + Sync {
    /// Block the calling thread until notified.  Implementations must treat `parked` as a
    /// condition-variable guard: atomically release it while blocked and return it reacquired.
    fn park<'a>(&self, parked: Parked<'a>) -> Parked<'a>;

    /// Wake the thread parked on this signal.  Called with the monitor's coordination lock held.
    fn notify(&self);
}

/// The standard [Signal]: one thread parked on one condition variable.
pub struct CondvarSignal {
    cond: Condvar,
}

impl CondvarSignal {
    /// Create a new CondvarSignal.
    pub const fn new() -> Self {
        Self {
            cond: Condvar::new(),
        }
    }
}

impl Default for CondvarSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal for CondvarSignal {
    fn park<'a>(&self, parked: Parked<'a>) -> Parked<'a> {
        parked.wait(&self.cond)
    }

    fn notify(&self) {
        self.cond.notify_one();
    }
}

////////////////////////////////////////////// Handle //////////////////////////////////////////////

/// Names a queued waiter so that another thread can [SendMonitor::interrupt] it.  Handles are
/// opaque and may be copied freely; a handle goes stale once its waiter enters or is interrupted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Handle {
    slot: usize,
}

/////////////////////////////////////////////// Slot ///////////////////////////////////////////////

enum Slot {
    /// Unoccupied.
    Empty,
    /// Reserved by a thread that never parked:  it is between schedule and enter with the lock
    /// held, or it is inside the critical section.
    Held,
    /// Occupied by a parked waiter.
    Waiting(Arc<dyn Signal>),
    /// Signalled by the cascade; the waiter has not yet resumed.
    Woken(Arc<dyn Signal>),
    /// The occupant was interrupted, cancelled by close, or has left.  The slot is reclaimed when
    /// the head of the ring sweeps past it.
    Dead,
}

impl Debug for Slot {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Slot::Empty => write!(fmt, "Empty"),
            Slot::Held => write!(fmt, "Held"),
            Slot::Waiting(_) => write!(fmt, "Waiting"),
            Slot::Woken(_) => write!(fmt, "Woken"),
            Slot::Dead => write!(fmt, "Dead"),
        }
    }
}

/////////////////////////////////////////////// State //////////////////////////////////////////////

#[derive(Debug)]
struct State {
    head: usize,
    tail: usize,
    users: usize,
    entered: usize,
    pause: bool,
    closed: bool,
    slots: Vec<Slot>,
}

/////////////////////////////////////////// SendMonitor ////////////////////////////////////////////

/// A FIFO send monitor.  Threads reserve a position in line with [SendMonitor::schedule], park in
/// [Ticket::enter] until the monitor admits them, do their work in the critical section, and
/// release it by dropping the [Entered] guard.  Admission order always matches reservation order.
///
/// Reservation claims the next slot of a fixed-size ring.  `users` counts every claimed slot
/// (queued, entered, or reserved); `entered` counts threads inside the critical section, at most
/// the concurrency window.  A reservation holds the coordination lock until it is consumed by
/// [Ticket::enter], so the two calls form a single critical section from the monitor's point of
/// view.
#[derive(Debug)]
pub struct SendMonitor {
    concurrency: usize,
    mask: usize,
    state: Mutex<State>,
    drained: Condvar,
}

impl SendMonitor {
    /// Create a monitor with `capacity` queue slots, admitting up to `concurrency` threads to the
    /// critical section simultaneously.  `capacity` must be a positive power of two and
    /// `concurrency` must be at least one; a concurrency of one makes the monitor a strict FIFO
    /// mutex.
    pub fn new(capacity: usize, concurrency: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "queue capacity must be a positive power of two"
        );
        assert!(
            concurrency >= 1,
            "concurrency window must admit at least one thread"
        );
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Empty);
        Self {
            concurrency,
            mask: capacity - 1,
            state: Mutex::new(State {
                head: 0,
                tail: 0,
                users: 0,
                entered: 0,
                pause: false,
                closed: false,
                slots,
            }),
            drained: Condvar::new(),
        }
    }

    /// The number of queue slots.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// The concurrency window.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Reserve the next position in line.  On success the returned [Ticket] holds the
    /// coordination lock until it is consumed by [Ticket::enter] or dropped, so no other operation
    /// can observe the reservation half-made.  Fails with [Error::Closed] on a closed monitor and
    /// [Error::QueueFull] when every slot is claimed.
    pub fn schedule(&self) -> Result<Ticket<'_>, Error> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            SCHEDULE_CLOSED.click();
            return Err(Error::Closed);
        }
        if state.users == self.capacity() {
            SCHEDULE_FULL.click();
            return Err(Error::QueueFull);
        }
        SCHEDULE.click();
        let index = state.tail;
        assert!(matches!(state.slots[index], Slot::Empty));
        state.slots[index] = Slot::Held;
        state.users += 1;
        state.tail = (state.tail + 1) & self.mask;
        let wait = state.entered >= self.concurrency || state.pause;
        self.assert_invariants(&state);
        Ok(Ticket {
            monitor: self,
            guard: Some(state),
            index,
            wait,
        })
    }

    /// Reserve and enter in one call.  Equivalent to `schedule` immediately followed by
    /// [Ticket::enter].
    pub fn enter(&self, signal: &Arc<dyn Signal>) -> Result<Entered<'_>, Error> {
        self.schedule()?.enter(signal)
    }

    /// Freeze admission.  Threads already inside the critical section are unaffected;
    /// reservations still succeed but queue instead of entering.  Pausing a paused monitor is a
    /// no-op, and a closed monitor cannot be paused.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        PAUSE.click();
        state.pause = !state.closed;
    }

    /// Resume admission after [SendMonitor::pause] and wake the next waiter in line.  Resuming a
    /// monitor that is not paused is a programmer error.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if state.pause {
            RESUME.click();
            state.pause = false;
            self.wake_up_next(&mut state);
        } else {
            clue!(COLLECTOR, INFO, {
                resume_unpaused: true,
            });
            debug_assert!(false, "resume of a monitor that is not paused");
        }
        self.assert_invariants(&state);
    }

    /// Interrupt the queued waiter named by `handle`.  The waiter's [Ticket::enter] returns
    /// [Error::Interrupted] and its slot is reclaimed without disturbing anyone else's position.
    /// Fails with [Error::NoSuchWaiter] when the handle no longer names a queued waiter; a waiter
    /// that already entered and one that was already interrupted cannot be told apart.
    pub fn interrupt(&self, handle: Handle) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let index = handle.slot;
        match std::mem::replace(&mut state.slots[index], Slot::Dead) {
            Slot::Waiting(signal) | Slot::Woken(signal) => {
                INTERRUPT.click();
                signal.notify();
                if !state.pause && index == state.head {
                    // The waiter may have been signalled by a leave or resume that has not run
                    // yet; that wake-up is now lost, so pump the cascade for the next in line.
                    INTERRUPT_AT_HEAD.click();
                    self.wake_up_next(&mut state);
                }
                self.assert_invariants(&state);
                Ok(())
            }
            prior => {
                state.slots[index] = prior;
                INTERRUPT_MISS.click();
                Err(Error::NoSuchWaiter)
            }
        }
    }

    /// Close the monitor.  Every queued waiter is cancelled and observes [Error::Closed]; every
    /// subsequent operation observes [Error::Closed] immediately.  Blocks until every slot is
    /// released and every entered thread has left.  Closing a closed monitor just waits for the
    /// drain again.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        CLOSE.click();
        if !state.closed {
            state.closed = true;
            state.pause = false;
            let mut index = state.head;
            let mut remaining = state.users;
            while remaining > 0 {
                match std::mem::replace(&mut state.slots[index], Slot::Dead) {
                    Slot::Waiting(signal) | Slot::Woken(signal) => {
                        signal.notify();
                    }
                    prior => {
                        state.slots[index] = prior;
                    }
                }
                index = (index + 1) & self.mask;
                remaining -= 1;
            }
            self.sweep(&mut state);
            self.check_drained(&state);
        }
        while state.users > 0 || state.entered > 0 {
            state = self.drained.wait(state).unwrap();
        }
        self.assert_invariants(&state);
    }

    /// Snapshot the monitor's counters and cursors.
    pub fn stats(&self) -> Stats {
        let state = self.state.lock().unwrap();
        Stats {
            capacity: self.capacity(),
            users: state.users,
            entered: state.entered,
            paused: state.pause,
            closed: state.closed,
            head: state.head,
            tail: state.tail,
        }
    }

    fn leave(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        LEAVE.click();
        assert!(state.entered > 0);
        state.entered -= 1;
        assert!(matches!(state.slots[index], Slot::Held));
        state.slots[index] = Slot::Dead;
        self.leave_common(&mut state);
        self.assert_invariants(&state);
    }

    // Release whatever is releasable and hand the monitor to the next in line.  Shared by leave,
    // ticket abandonment, and waiters cancelled by close.
    fn leave_common(&self, state: &mut State) {
        self.sweep(state);
        if !state.pause {
            self.wake_up_next(state);
        }
        self.check_drained(state);
    }

    // Reclaim dead slots at the head of the ring.  Each slot's release is paired with exactly one
    // head advance, here and nowhere else.
    fn sweep(&self, state: &mut State) {
        while state.users > 0 && matches!(state.slots[state.head], Slot::Dead) {
            RECLAIM.click();
            clue!(COLLECTOR, INFO, {
                reclaim: state.head as u64,
            });
            state.slots[state.head] = Slot::Empty;
            state.users -= 1;
            state.head = (state.head + 1) & self.mask;
        }
    }

    // Wake the next admissible waiter, if the concurrency window has room for one.  Walks forward
    // from the head of the ring: dead slots at the head are reclaimed, slots whose occupants are
    // already inside are stepped over, and the first parked waiter is signalled.  At most one
    // waiter is woken per invocation; the woken thread pumps the cascade again when it leaves.
    fn wake_up_next(&self, state: &mut State) {
        self.sweep(state);
        if state.entered >= self.concurrency {
            return;
        }
        let mut index = state.head;
        let mut remaining = state.users;
        while remaining > 0 {
            match &state.slots[index] {
                Slot::Waiting(signal) => {
                    let signal = Arc::clone(signal);
                    signal.notify();
                    state.slots[index] = Slot::Woken(signal);
                    WAKE.click();
                    break;
                }
                Slot::Woken(_) => {
                    // Already signalled; its admission is still in flight.
                    break;
                }
                Slot::Held | Slot::Dead => {
                    index = (index + 1) & self.mask;
                    remaining -= 1;
                }
                Slot::Empty => {
                    panic!("occupied ring segment contains an empty slot");
                }
            }
        }
    }

    fn check_drained(&self, state: &State) {
        if state.closed && state.users == 0 && state.entered == 0 {
            self.drained.notify_all();
        }
    }

    fn assert_invariants(&self, state: &State) {
        assert!(state.entered <= self.concurrency);
        assert!(state.users <= self.capacity());
        assert!(state.entered <= state.users);
        assert_eq!(
            state.tail.wrapping_sub(state.head) & self.mask,
            state.users & self.mask,
        );
    }
}

////////////////////////////////////////////// Ticket //////////////////////////////////////////////

/// A reservation produced by [SendMonitor::schedule].  The ticket owns the monitor's coordination
/// lock, so reservation and entry form one critical section; consume it with [Ticket::enter].
/// Dropping a ticket cancels the reservation.
#[derive(Debug)]
pub struct Ticket<'a> {
    monitor: &'a SendMonitor,
    guard: Option<MutexGuard<'a, State>>,
    index: usize,
    wait: bool,
}

impl<'a> Ticket<'a> {
    /// The handle another thread can use to [SendMonitor::interrupt] this reservation, or None if
    /// the reservation will enter without waiting.
    pub fn handle(&self) -> Option<Handle> {
        if self.wait {
            Some(Handle { slot: self.index })
        } else {
            None
        }
    }

    /// Enter the critical section, parking on `signal` until the monitor admits this reservation.
    /// Returns the [Entered] guard on success.  Fails with [Error::Interrupted] if another thread
    /// cancelled the wait and [Error::Closed] if the monitor closed.
    pub fn enter(mut self, signal: &Arc<dyn Signal>) -> Result<Entered<'a>, Error> {
        let monitor = self.monitor;
        let index = self.index;
        let wait = self.wait;
        let mut guard = self
            .guard
            .take()
            .expect("ticket retains the coordination lock until enter");
        if !wait {
            ENTER.click();
            assert!(guard.entered < monitor.concurrency);
            guard.entered += 1;
            monitor.assert_invariants(&guard);
            return Ok(Entered { monitor, index });
        }
        PARK.click();
        assert!(matches!(guard.slots[index], Slot::Held));
        guard.slots[index] = Slot::Waiting(Arc::clone(signal));
        let mut parked = Parked { guard };
        loop {
            parked = signal.park(parked);
            let still_waiting = matches!(
                &parked.guard.slots[index],
                Slot::Waiting(other) if Arc::ptr_eq(other, signal),
            );
            if !still_waiting {
                break;
            }
        }
        let mut guard = parked.guard;
        let woken = matches!(
            &guard.slots[index],
            Slot::Woken(other) if Arc::ptr_eq(other, signal),
        );
        if woken {
            if !guard.closed {
                ENTER.click();
                guard.slots[index] = Slot::Held;
                assert!(guard.users > 0);
                assert!(guard.entered < monitor.concurrency);
                guard.entered += 1;
                monitor.assert_invariants(&guard);
                return Ok(Entered { monitor, index });
            }
            // Signalled, but the monitor closed before this thread resumed.
            guard.slots[index] = Slot::Dead;
        }
        if guard.closed {
            monitor.leave_common(&mut guard);
            monitor.assert_invariants(&guard);
            Err(Error::Closed)
        } else {
            // The interrupter already gave this slot up; the cascade reclaims it.
            INTERRUPTED.click();
            monitor.assert_invariants(&guard);
            Err(Error::Interrupted)
        }
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            ABANDON.click();
            assert!(matches!(guard.slots[self.index], Slot::Held));
            guard.slots[self.index] = Slot::Dead;
            self.monitor.leave_common(&mut guard);
        }
    }
}

///////////////////////////////////////////// Entered //////////////////////////////////////////////

/// Proof of admission to the critical section.  Dropping the guard leaves the critical section
/// and wakes the next admissible waiter.
#[derive(Debug)]
pub struct Entered<'a> {
    monitor: &'a SendMonitor,
    index: usize,
}

impl Entered<'_> {
    /// Leave the critical section.  Dropping the guard does the same; this form exists to make
    /// the hand-off explicit at call sites.
    pub fn leave(self) {}
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.monitor.leave(self.index);
    }
}

////////////////////////////////////////////// Stats ///////////////////////////////////////////////

/// A point-in-time snapshot of monitor state, taken under the coordination lock.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub capacity: usize,
    /// Threads holding a queue slot:  queued, entered, or reserved.
    pub users: usize,
    /// Threads inside the critical section.
    pub entered: usize,
    pub paused: bool,
    pub closed: bool,
    pub head: usize,
    pub tail: usize,
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
