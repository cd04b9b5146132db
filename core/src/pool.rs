//! Fixed-size connection pool with blocking acquire.
//!
//! Every filesystem operation borrows exactly one connection for the span
//! of one transaction. The pool opens connections lazily up to its cap,
//! parks callers on a condition variable when all connections are out, and
//! replaces any connection observed broken instead of handing it out again.
//! Release happens when the guard drops, so a connection cannot leak on an
//! error path and cannot be released twice.
//!
//! The pool is generic over [`ManageConnection`] so its blocking and
//! replacement behaviour is testable without a database server. In
//! single-threaded mode the filesystem simply builds a pool of capacity 1.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use crate::error::Result;

/// How to open a connection and how to recognize a dead one.
pub trait ManageConnection: Send + Sync {
    /// The connection type handed to borrowers.
    type Conn: Send;

    /// Open a fresh connection.
    fn connect(&self) -> Result<Self::Conn>;

    /// Whether the connection must not be handed out again. Broken
    /// connections are dropped and their pool slot freed.
    fn is_broken(&self, conn: &mut Self::Conn) -> bool;
}

struct PoolState<C> {
    idle: Vec<C>,
    /// Connections currently in existence, idle or borrowed.
    open: usize,
}

/// Thread-safe pool of at most `cap` connections.
pub struct Pool<M: ManageConnection> {
    manager: M,
    cap: usize,
    state: Mutex<PoolState<M::Conn>>,
    available: Condvar,
}

impl<M: ManageConnection> Pool<M> {
    /// Create an empty pool that will open at most `cap` connections.
    /// Connections are opened on first demand, never eagerly.
    pub fn new(manager: M, cap: usize) -> Pool<M> {
        assert!(cap >= 1, "a pool needs at least one connection");
        Pool {
            manager,
            cap,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(cap),
                open: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Number of connections the pool may hold.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Borrow a healthy connection, opening one if the pool is below its
    /// cap, and blocking until a release otherwise. Fails only when opening
    /// a new connection fails.
    pub fn acquire(&self) -> Result<PooledConn<'_, M>> {
        let mut state = self.state.lock().expect("connection pool mutex poisoned");
        loop {
            while let Some(mut conn) = state.idle.pop() {
                if self.manager.is_broken(&mut conn) {
                    state.open -= 1;
                    continue;
                }
                return Ok(PooledConn {
                    pool: self,
                    conn: Some(conn),
                });
            }

            if state.open < self.cap {
                state.open += 1;
                drop(state);
                return match self.manager.connect() {
                    Ok(conn) => Ok(PooledConn {
                        pool: self,
                        conn: Some(conn),
                    }),
                    Err(e) => {
                        // Give the reserved slot back before reporting.
                        let mut state =
                            self.state.lock().expect("connection pool mutex poisoned");
                        state.open -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            state = self
                .available
                .wait(state)
                .expect("connection pool mutex poisoned");
        }
    }

    fn release(&self, mut conn: M::Conn) {
        let mut state = self.state.lock().expect("connection pool mutex poisoned");
        if self.manager.is_broken(&mut conn) {
            state.open -= 1;
        } else {
            state.idle.push(conn);
        }
        self.available.notify_one();
    }
}

/// A borrowed connection; returns itself to the pool on drop.
pub struct PooledConn<'a, M: ManageConnection> {
    pool: &'a Pool<M>,
    conn: Option<M::Conn>,
}

impl<M: ManageConnection> Deref for PooledConn<'_, M> {
    type Target = M::Conn;

    fn deref(&self) -> &M::Conn {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl<M: ManageConnection> DerefMut for PooledConn<'_, M> {
    fn deref_mut(&mut self) -> &mut M::Conn {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl<M: ManageConnection> Drop for PooledConn<'_, M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct StubConn {
        serial: usize,
        broken: bool,
    }

    struct StubManager {
        opened: AtomicUsize,
        fail_connect: AtomicBool,
    }

    impl StubManager {
        fn new() -> StubManager {
            StubManager {
                opened: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
            }
        }
    }

    impl ManageConnection for StubManager {
        type Conn = StubConn;

        fn connect(&self) -> Result<StubConn> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(FsError::Corrupt("refusing to connect".into()));
            }
            Ok(StubConn {
                serial: self.opened.fetch_add(1, Ordering::SeqCst),
                broken: false,
            })
        }

        fn is_broken(&self, conn: &mut StubConn) -> bool {
            conn.broken
        }
    }

    #[test]
    fn connections_are_reused() {
        let pool = Pool::new(StubManager::new(), 4);
        let serial = {
            let conn = pool.acquire().unwrap();
            conn.serial
        };
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.serial, serial);
        assert_eq!(pool.manager.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_exceeds_capacity_and_blocks_until_release() {
        let pool = Arc::new(Pool::new(StubManager::new(), 2));
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(pool.manager.opened.load(Ordering::SeqCst), 2);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let conn = pool.acquire().unwrap();
                tx.send(conn.serial).unwrap();
            })
        };

        // The third acquire must be parked while both connections are out.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(first);
        let serial = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(serial < 2);
        waiter.join().unwrap();
        drop(second);

        // Still only two connections ever opened.
        assert_eq!(pool.manager.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn broken_connections_are_replaced() {
        let pool = Pool::new(StubManager::new(), 1);
        {
            let mut conn = pool.acquire().unwrap();
            assert_eq!(conn.serial, 0);
            conn.broken = true;
        }
        // The poisoned connection was dropped on release; the next acquire
        // opens a fresh one without exceeding the cap.
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.serial, 1);
        assert_eq!(pool.manager.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_connect_frees_the_slot() {
        let pool = Pool::new(StubManager::new(), 1);
        pool.manager.fail_connect.store(true, Ordering::SeqCst);
        assert!(pool.acquire().is_err());

        pool.manager.fail_connect.store(false, Ordering::SeqCst);
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.serial, 0);
    }
}
