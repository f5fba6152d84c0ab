//! The idle-connection pool, keyed by origin.
//!
//! Discipline: every checkout is paired with either a checkin (clean
//! return) or a discard (close). An idle entry that times out, sees
//! unsolicited data, or is closed by its peer is evicted on the spot, so
//! a connection is always in exactly one place — pool, exchange, or
//! closed.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::emitter::ListenerId;
use crate::evloop::{Loop, TimeoutHandle};
use crate::net::Transport;

/// Origin key: `(scheme, lowercased host, port)`.
pub(crate) type Key = (String, String, u16);

struct Idle {
    conn: Rc<dyn Transport>,
    timer: Option<TimeoutHandle>,
    data_id: ListenerId,
    close_id: ListenerId,
}

struct PoolInner {
    lp: Loop,
    timeout: Cell<Option<Duration>>,
    idle: RefCell<IndexMap<Key, VecDeque<Idle>>>,
}

#[derive(Clone)]
pub(crate) struct Pool {
    inner: Rc<PoolInner>,
}

impl Pool {
    pub fn new(lp: &Loop, timeout: Option<Duration>) -> Pool {
        Pool {
            inner: Rc::new(PoolInner {
                lp: lp.clone(),
                timeout: Cell::new(timeout),
                idle: RefCell::new(IndexMap::new()),
            }),
        }
    }

    /// `None` disables pooling: checkins close instead of parking.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeout.set(timeout);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.timeout.get().is_some()
    }

    /// Oldest healthy idle connection for `key`, with its idle timer
    /// cancelled and its watchers detached before it is handed over.
    pub fn checkout(&self, key: &Key) -> Option<Rc<dyn Transport>> {
        loop {
            let entry = {
                let mut idle = self.inner.idle.borrow_mut();
                let list = idle.get_mut(key)?;
                let entry = list.pop_front();
                if list.is_empty() {
                    idle.shift_remove(key);
                }
                entry?
            };

            detach(&entry);

            if entry.conn.is_closed() {
                trace!("discarding dead idle connection for {:?}", key);
                continue;
            }

            debug!("reusing idle connection for {:?}", key);
            return Some(entry.conn);
        }
    }

    /// Parks a connection that finished an exchange cleanly. The caller
    /// guarantees the known-clean contract: no half-read body, no pending
    /// write.
    pub fn checkin(&self, key: Key, conn: Rc<dyn Transport>) {
        let timeout = match self.inner.timeout.get() {
            Some(timeout) => timeout,
            None => {
                conn.close();
                return;
            }
        };

        if conn.is_closed() {
            return;
        }

        debug!("parking idle connection for {:?}", key);

        let timer = {
            let pool = Rc::downgrade(&self.inner);
            let conn = Rc::downgrade(&conn);
            let key = key.clone();
            Some(self.inner.lp.schedule(timeout, move |_| {
                evict(&pool, &key, &conn, "idle timeout");
            }))
        };

        // Unsolicited bytes are fatal to reuse; so is the peer hanging up.
        let data_id = {
            let pool = Rc::downgrade(&self.inner);
            let conn_w = Rc::downgrade(&conn);
            let key = key.clone();
            conn.on_data(Box::new(move |_| {
                evict(&pool, &key, &conn_w, "unsolicited data");
            }))
        };
        let close_id = {
            let pool = Rc::downgrade(&self.inner);
            let conn_w = Rc::downgrade(&conn);
            let key = key.clone();
            conn.on_close(Box::new(move |_| {
                evict(&pool, &key, &conn_w, "peer close");
            }))
        };

        self.inner
            .idle
            .borrow_mut()
            .entry(key)
            .or_default()
            .push_back(Idle {
                conn,
                timer,
                data_id,
                close_id,
            });
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.borrow().values().map(|l| l.len()).sum()
    }
}

fn evict(
    pool: &Weak<PoolInner>,
    key: &Key,
    conn: &Weak<dyn Transport>,
    why: &str,
) {
    let pool = match pool.upgrade() {
        Some(pool) => pool,
        None => return,
    };
    let conn = match conn.upgrade() {
        Some(conn) => conn,
        None => return,
    };

    let entry = {
        let mut idle = pool.idle.borrow_mut();
        let list = match idle.get_mut(key) {
            Some(list) => list,
            None => return,
        };
        let pos = match list.iter().position(|e| Rc::ptr_eq(&e.conn, &conn)) {
            Some(pos) => pos,
            None => return,
        };
        let entry = list.remove(pos);
        if list.is_empty() {
            idle.shift_remove(key);
        }
        entry
    };

    if let Some(entry) = entry {
        trace!("evicting idle connection for {:?} ({})", key, why);
        detach(&entry);
        entry.conn.close();
    }
}

fn detach(entry: &Idle) {
    if let Some(timer) = &entry.timer {
        timer.delete();
    }
    entry.conn.off_data(entry.data_id);
    entry.conn.off_close(entry.close_id);
}
