//! The reactor: multiplexes readiness for a set of file descriptors,
//! fires expired timers, and runs every callback on one thread.
//!
//! One tick is: refresh the cached time, fire all expired timers (in
//! insertion order among equal deadlines), poll the selector with a
//! timeout equal to the delay until the next timer (or the configured
//! precision when none is pending), then dispatch readiness to each fd's
//! sink over a snapshot of the ready set.

use std::cell::{Cell, RefCell};
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, trace};

use crate::emitter::{ListenerId, Listeners};
use crate::event::{Events, Token};
use crate::ready::Ready;
use crate::sys;

mod timer;

pub use self::timer::TimeoutHandle;
use self::timer::Entry;

/// Receives readiness events for a registered file descriptor.
///
/// The contract is "do not panic": a panicking sink unwinds through
/// [`Loop::run`], there is no per-callback isolation.
pub trait Sink {
    fn ready(&self, lp: &Loop, readiness: Ready);
}

struct Registration {
    interest: Ready,
    sink: Rc<dyn Sink>,
}

struct Inner {
    selector: sys::Selector,
    registrations: RefCell<IndexMap<RawFd, Registration>>,
    timers: RefCell<BinaryHeap<Entry>>,
    timer_seq: Cell<u64>,
    now: Cell<Instant>,
    running: Cell<bool>,
    precision: Cell<Duration>,
    slow_warn: Cell<Option<Duration>>,
    events: RefCell<Events>,
    start_ev: Listeners<()>,
    stop_ev: Listeners<()>,
}

/// A cheap cloneable handle to one event loop.
///
/// All clones refer to the same loop. Multiple independent loops may
/// coexist (useful in tests); [`Loop::global`] hands out a lazily created
/// per-thread default as a convenience.
#[derive(Clone)]
pub struct Loop {
    inner: Rc<Inner>,
}

impl Loop {
    pub fn new() -> io::Result<Loop> {
        Ok(Loop {
            inner: Rc::new(Inner {
                selector: sys::Selector::new()?,
                registrations: RefCell::new(IndexMap::new()),
                timers: RefCell::new(BinaryHeap::new()),
                timer_seq: Cell::new(0),
                now: Cell::new(Instant::now()),
                running: Cell::new(false),
                precision: Cell::new(Duration::from_secs(1)),
                slow_warn: Cell::new(None),
                events: RefCell::new(Events::with_capacity(1024)),
                start_ev: Listeners::new(),
                stop_ev: Listeners::new(),
            }),
        })
    }

    /// The lazily-initialized default loop for the current thread.
    pub fn global() -> io::Result<Loop> {
        thread_local! {
            static GLOBAL: RefCell<Option<Loop>> = RefCell::new(None);
        }

        GLOBAL.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(lp) = slot.as_ref() {
                return Ok(lp.clone());
            }
            let lp = Loop::new()?;
            *slot = Some(lp.clone());
            Ok(lp)
        })
    }

    /// Name of the readiness backend compiled for this platform.
    pub fn backend() -> &'static str {
        sys::Selector::NAME
    }

    /// Adds or replaces the registration for `fd`. Repeating an identical
    /// call is a no-op beyond replacing the sink.
    pub fn register(&self, fd: RawFd, interest: Ready, sink: Rc<dyn Sink>) -> io::Result<()> {
        let mut registrations = self.inner.registrations.borrow_mut();

        if let Some(reg) = registrations.get_mut(&fd) {
            self.inner.selector.reregister(fd, Token(fd as usize), interest)?;
            reg.interest = interest;
            reg.sink = sink;
        } else {
            self.inner.selector.register(fd, Token(fd as usize), interest)?;
            registrations.insert(fd, Registration { interest, sink });
        }

        trace!("registered fd {} for {:?}", fd, interest);

        Ok(())
    }

    /// Changes the watched events for `fd` without replacing its sink.
    pub fn update(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut registrations = self.inner.registrations.borrow_mut();

        match registrations.get_mut(&fd) {
            Some(reg) if reg.interest == interest => Ok(()),
            Some(reg) => {
                self.inner.selector.reregister(fd, Token(fd as usize), interest)?;
                reg.interest = interest;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fd is not registered",
            )),
        }
    }

    /// Removes the registration for `fd`; no further events fire for it.
    /// Safe to call from within that fd's own sink.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let removed = self.inner.registrations.borrow_mut().shift_remove(&fd);

        if removed.is_some() {
            self.inner.selector.deregister(fd)?;
            trace!("unregistered fd {}", fd);
        }

        Ok(())
    }

    /// Schedules `cb` to run once after `delay`. A zero delay fires on the
    /// next tick, never within the tick that scheduled it.
    pub fn schedule<F>(&self, delay: Duration, cb: F) -> TimeoutHandle
    where
        F: FnOnce(&Loop) + 'static,
    {
        let seq = self.inner.timer_seq.get();
        self.inner.timer_seq.set(seq + 1);

        let entry = Entry {
            at: Instant::now() + delay,
            seq,
            cancelled: Rc::new(Cell::new(false)),
            cb: Box::new(cb),
        };
        let handle = entry.handle();

        self.inner.timers.borrow_mut().push(entry);

        handle
    }

    /// The cached timestamp, refreshed once per tick. Precision-bounded:
    /// within a callback it lags real time by at most the callback's own
    /// runtime plus the loop precision.
    pub fn time(&self) -> Instant {
        self.inner.now.get()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Poll timeout used when no timer is pending. Defaults to one second;
    /// tests set it smaller.
    pub fn set_precision(&self, precision: Duration) {
        self.inner.precision.set(precision);
    }

    /// Debug mode: when set, any single callback that blocks the loop
    /// longer than `threshold` gets a diagnostic on stderr.
    pub fn set_slow_callback_warning(&self, threshold: Option<Duration>) {
        self.inner.slow_warn.set(threshold);
    }

    pub fn on_start<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&()) + 'static,
    {
        self.inner.start_ev.on(f)
    }

    pub fn on_stop<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&()) + 'static,
    {
        self.inner.stop_ev.on(f)
    }

    /// Emits `start` and ticks until [`Loop::stop`] is invoked. Returns
    /// the selector error if the readiness primitive fails; that error is
    /// fatal to the loop.
    pub fn run(&self) -> io::Result<()> {
        self.inner.running.set(true);
        debug!("loop running (backend: {})", sys::Selector::NAME);
        self.inner.start_ev.emit(&());

        while self.inner.running.get() {
            self.tick()?;
        }

        Ok(())
    }

    /// Stops the loop: clears the registration table and the timer heap,
    /// then emits `stop`. No callback runs after `stop` returns.
    pub fn stop(&self) {
        if !self.inner.running.replace(false) && self.inner.registrations.borrow().is_empty() {
            return;
        }

        // Drain both tables before dropping their contents so a Drop impl
        // reaching back into the loop sees consistent state.
        let registrations: Vec<(RawFd, Registration)> = {
            let mut registrations = self.inner.registrations.borrow_mut();
            registrations.drain(..).collect()
        };
        for (fd, _) in &registrations {
            let _ = self.inner.selector.deregister(*fd);
        }
        drop(registrations);

        let timers = std::mem::take(&mut *self.inner.timers.borrow_mut());
        drop(timers);

        debug!("loop stopped");
        self.inner.stop_ev.emit(&());
    }

    fn tick(&self) -> io::Result<()> {
        self.inner.now.set(Instant::now());

        self.run_timers();

        if !self.inner.running.get() {
            return Ok(());
        }

        let timeout = self.poll_timeout();
        {
            let mut events = self.inner.events.borrow_mut();
            self.inner.selector.select(&mut events.inner, Some(timeout))?;
        }

        // Snapshot the ready set: a sink unregistering another fd must not
        // invalidate this iteration, and an fd unregistered earlier in the
        // same dispatch is skipped by the lookup below.
        let ready: Vec<(RawFd, Ready)> = self
            .inner
            .events
            .borrow()
            .iter()
            .map(|ev| (usize::from(ev.token()) as RawFd, ev.readiness()))
            .collect();

        for (fd, readiness) in ready {
            if !self.inner.running.get() {
                break;
            }

            let sink = self
                .inner
                .registrations
                .borrow()
                .get(&fd)
                .map(|reg| Rc::clone(&reg.sink));

            if let Some(sink) = sink {
                self.timed(|| sink.ready(self, readiness));
            }
        }

        Ok(())
    }

    fn run_timers(&self) {
        let now = self.inner.now.get();
        // Entries scheduled by the timers firing below carry a larger seq
        // and are deferred to the next tick, zero delay included.
        let horizon = self.inner.timer_seq.get();

        loop {
            if !self.inner.running.get() {
                return;
            }

            let entry = {
                let mut timers = self.inner.timers.borrow_mut();
                let due = match timers.peek() {
                    Some(e) => e.cancelled.get() || (e.at <= now && e.seq < horizon),
                    None => false,
                };
                if !due {
                    return;
                }
                timers.pop()
            };

            if let Some(entry) = entry {
                if entry.cancelled.get() {
                    continue;
                }
                let cb = entry.cb;
                self.timed(|| cb(self));
            }
        }
    }

    fn poll_timeout(&self) -> Duration {
        let timers = self.inner.timers.borrow();

        match timers.peek() {
            Some(entry) => entry.at.saturating_duration_since(self.inner.now.get()),
            None => self.inner.precision.get(),
        }
    }

    fn timed<F: FnOnce()>(&self, f: F) {
        match self.inner.slow_warn.get() {
            Some(threshold) => {
                let start = Instant::now();
                f();
                let elapsed = start.elapsed();
                if elapsed > threshold {
                    eprintln!(
                        "relay-io: callback blocked the loop for {:?} (threshold {:?})",
                        elapsed, threshold
                    );
                }
            }
            None => f(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Loop;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    fn test_loop() -> Loop {
        let lp = Loop::new().expect("loop");
        lp.set_precision(Duration::from_millis(10));
        lp
    }

    #[test]
    fn timers_fire_in_deadline_then_insertion_order() {
        let lp = test_loop();
        let fired = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let fired = fired.clone();
            lp.schedule(Duration::from_millis(5), move |_| {
                fired.borrow_mut().push(tag)
            });
        }
        {
            let fired = fired.clone();
            lp.schedule(Duration::from_millis(1), move |_| {
                fired.borrow_mut().push("first")
            });
        }

        lp.schedule(Duration::from_millis(50), |lp| lp.stop());
        lp.run().expect("run");

        assert_eq!(*fired.borrow(), vec!["first", "a", "b", "c"]);
    }

    #[test]
    fn deleted_handle_never_fires() {
        let lp = test_loop();
        let fired = Rc::new(RefCell::new(false));

        let handle = {
            let fired = fired.clone();
            lp.schedule(Duration::from_millis(1), move |_| *fired.borrow_mut() = true)
        };
        handle.delete();
        assert!(handle.is_deleted());

        lp.schedule(Duration::from_millis(20), |lp| lp.stop());
        lp.run().expect("run");

        assert!(!*fired.borrow());
    }

    #[test]
    fn zero_delay_fires_on_the_next_tick_not_the_scheduling_one() {
        let lp = test_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let order = order.clone();
            lp.schedule(Duration::ZERO, move |lp| {
                order.borrow_mut().push("outer");
                let inner_order = order.clone();
                lp.schedule(Duration::ZERO, move |lp| {
                    inner_order.borrow_mut().push("inner");
                    lp.stop();
                });
                // nothing scheduled in this tick may run in this tick
                order.borrow_mut().push("outer-end");
            });
        }

        lp.run().expect("run");
        assert_eq!(*order.borrow(), vec!["outer", "outer-end", "inner"]);
    }

    #[test]
    fn stop_drops_pending_timers() {
        let lp = test_loop();
        let fired = Rc::new(RefCell::new(false));

        {
            let fired = fired.clone();
            lp.schedule(Duration::from_millis(5), move |_| *fired.borrow_mut() = true);
        }
        lp.schedule(Duration::ZERO, |lp| lp.stop());

        lp.run().expect("run");
        assert!(!*fired.borrow());
    }

    #[test]
    fn start_and_stop_events_fire() {
        let lp = test_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = log.clone();
            lp.on_start(move |_| log.borrow_mut().push("start"));
        }
        {
            let log = log.clone();
            lp.on_stop(move |_| log.borrow_mut().push("stop"));
        }

        lp.schedule(Duration::ZERO, |lp| lp.stop());
        lp.run().expect("run");

        assert_eq!(*log.borrow(), vec!["start", "stop"]);
    }

    #[test]
    fn cached_time_is_refreshed_each_tick() {
        let lp = test_loop();
        let before = Instant::now();

        let seen = Rc::new(std::cell::Cell::new(None));
        {
            let seen = seen.clone();
            lp.schedule(Duration::from_millis(5), move |lp| {
                seen.set(Some(lp.time()));
                lp.stop();
            });
        }

        lp.run().expect("run");
        let seen = seen.get().expect("timer ran");
        assert!(seen >= before);
    }
}
