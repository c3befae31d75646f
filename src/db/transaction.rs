use tracing::warn;

use crate::error::Result;

use super::Connection;

/// Scoped ownership of an open transaction.
///
/// Construction issues `BEGIN`. If the scope is dropped while still active,
/// `ROLLBACK` is attempted and any error is logged but never propagated, so
/// no exit path leaves an open transaction behind. `commit` and `abort`
/// clear the active flag before talking to the server: a failed `COMMIT`
/// surfaces as an error without triggering a second rollback on drop.
pub struct TransactionScope<'a, C: Connection + ?Sized> {
    conn: &'a mut C,
    active: bool,
}

impl<'a, C: Connection + ?Sized> TransactionScope<'a, C> {
    pub fn begin(conn: &'a mut C) -> Result<Self> {
        conn.begin()?;
        Ok(Self { conn, active: true })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Access the underlying connection for statement execution within
    /// the transaction.
    pub fn conn(&mut self) -> &mut C {
        self.conn
    }

    pub fn commit(mut self) -> Result<()> {
        self.active = false;
        self.conn.commit()
    }

    pub fn abort(mut self) -> Result<()> {
        self.active = false;
        self.conn.rollback()
    }
}

impl<C: Connection + ?Sized> Drop for TransactionScope<'_, C> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.conn.rollback() {
                warn!("implicit rollback failed: {e}");
            }
        }
    }
}
