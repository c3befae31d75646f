use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use std_semaphore::Semaphore;

use crate::config::ConnectionParams;
use crate::error::Result;

use super::{Connection, Connector};

/// A bounded pool of database connections.
///
/// The semaphore caps the number of live connections handed out at any
/// moment; the queue keeps idle connections for reuse. A request borrows at
/// most one connection at a time and returns it on drop regardless of the
/// exit path.
pub struct ConnectionPool {
    params: ConnectionParams,
    connector: Connector,
    idle: ArrayQueue<Box<dyn Connection>>,
    slots: Semaphore,
}

impl ConnectionPool {
    pub fn new(params: ConnectionParams, connector: Connector, max_size: usize) -> Arc<Self> {
        let max_size = max_size.max(1);
        Arc::new(Self {
            params,
            connector,
            idle: ArrayQueue::new(max_size),
            slots: Semaphore::new(max_size as isize),
        })
    }

    /// Borrow a connection, blocking while the pool is exhausted.
    pub fn get(self: &Arc<Self>) -> Result<PooledConn> {
        self.slots.acquire();
        let conn = match self.idle.pop() {
            Some(conn) => conn,
            None => match (self.connector)(&self.params) {
                Ok(conn) => conn,
                Err(e) => {
                    self.slots.release();
                    return Err(e);
                }
            },
        };
        Ok(PooledConn { conn: ManuallyDrop::new(conn), pool: Arc::clone(self) })
    }

    fn check_in(&self, conn: Box<dyn Connection>) {
        if !conn.is_broken() {
            let _ = self.idle.push(conn);
        }
        self.slots.release();
    }
}

/// RAII handle over a pooled connection.
pub struct PooledConn {
    pool: Arc<ConnectionPool>,
    conn: ManuallyDrop<Box<dyn Connection>>,
}

impl Deref for PooledConn {
    type Target = Box<dyn Connection>;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // SAFETY: conn is never accessed after this
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.check_in(conn);
    }
}
