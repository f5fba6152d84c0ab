use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifies a subscribed listener so it can be removed later.
///
/// Ids are unique per `Listeners` instance, never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Entry<A: ?Sized> {
    id: u64,
    once: bool,
    f: Rc<RefCell<dyn FnMut(&A)>>,
}

/// An ordered list of listeners for one event.
///
/// This is the publish/subscribe surface the core consumes: emitters hold
/// one `Listeners` per event kind, keeping dispatch typed and exhaustive.
/// `emit` dispatches synchronously, in subscription order, over a snapshot
/// of the current list — a listener may subscribe or unsubscribe anything
/// (including itself) from inside its own invocation without disturbing
/// the dispatch in flight. Listeners added during an emit are not invoked
/// until the next emit; `once` listeners are unsubscribed before their
/// single invocation.
pub struct Listeners<A: ?Sized> {
    entries: RefCell<Vec<Entry<A>>>,
    next_id: Cell<u64>,
}

impl<A: ?Sized> Listeners<A> {
    pub fn new() -> Listeners<A> {
        Listeners {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    /// Subscribes `f` for every emission.
    pub fn on<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&A) + 'static,
    {
        self.add(f, false)
    }

    /// Subscribes `f` for the next emission only.
    pub fn once<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&A) + 'static,
    {
        self.add(f, true)
    }

    fn add<F>(&self, f: F, once: bool) -> ListenerId
    where
        F: FnMut(&A) + 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let f: Rc<RefCell<dyn FnMut(&A)>> = Rc::new(RefCell::new(f));
        self.entries.borrow_mut().push(Entry { id, once, f });

        ListenerId(id)
    }

    pub fn remove(&self, id: ListenerId) {
        self.entries.borrow_mut().retain(|e| e.id != id.0);
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Dispatches `arg` to every listener subscribed at the time of the
    /// call. Returns whether at least one listener ran, so emitters with a
    /// sink fallback know whether the event went unheard.
    pub fn emit(&self, arg: &A) -> bool {
        let snapshot: Vec<Rc<RefCell<dyn FnMut(&A)>>> = {
            let mut entries = self.entries.borrow_mut();
            let snapshot = entries.iter().map(|e| Rc::clone(&e.f)).collect();
            entries.retain(|e| !e.once);
            snapshot
        };

        for f in &snapshot {
            (f.borrow_mut())(arg);
        }

        !snapshot.is_empty()
    }
}

impl<A: ?Sized> Default for Listeners<A> {
    fn default() -> Listeners<A> {
        Listeners::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Listeners;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dispatch_in_subscription_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            listeners.on(move |n: &u32| seen.borrow_mut().push(format!("{}{}", tag, n)));
        }

        assert!(listeners.emit(&1));
        assert_eq!(*seen.borrow(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn once_runs_a_single_time() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Rc::new(RefCell::new(0));

        let c = count.clone();
        listeners.once(move |_| *c.borrow_mut() += 1);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(*count.borrow(), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn remove_stops_future_dispatch() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Rc::new(RefCell::new(0));

        let c = count.clone();
        let id = listeners.on(move |_| *c.borrow_mut() += 1);

        listeners.emit(&());
        listeners.remove(id);
        listeners.emit(&());
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn unsubscribe_during_emit_does_not_disturb_snapshot() {
        let listeners: Rc<Listeners<()>> = Rc::new(Listeners::new());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let id_slot = Rc::new(RefCell::new(None));

        {
            let listeners = listeners.clone();
            let id_slot = id_slot.clone();
            let seen = seen.clone();
            let id = listeners.clone().on(move |_| {
                seen.borrow_mut().push("first");
                // unsubscribe the *second* listener mid-dispatch
                if let Some(id) = *id_slot.borrow() {
                    listeners.remove(id);
                }
            });
            let _ = id;
        }

        {
            let seen = seen.clone();
            let id = listeners.on(move |_| seen.borrow_mut().push("second"));
            *id_slot.borrow_mut() = Some(id);
        }

        // second still sees the emit that was already in flight
        listeners.emit(&());
        assert_eq!(*seen.borrow(), vec!["first", "second"]);

        // but not the next one
        listeners.emit(&());
        assert_eq!(*seen.borrow(), vec!["first", "second", "first"]);
    }

    #[test]
    fn emit_reports_whether_anyone_listened() {
        let listeners: Listeners<()> = Listeners::new();
        assert!(!listeners.emit(&()));
        listeners.on(|_| {});
        assert!(listeners.emit(&()));
    }
}
