use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::StoreError;

/// Hands out contiguous blocks of notification ids, persisted so a restart
/// does not hand out an id already in flight. Ids wrap at 2^32, same as the
/// wire format's 32-bit id field.
pub struct IdentCounter {
    conn: Arc<Mutex<Connection>>,
}

impl IdentCounter {
    pub fn open(conn: Arc<Mutex<Connection>>) -> Result<Self, StoreError> {
        let c = conn.lock();
        c.execute_batch("CREATE TABLE IF NOT EXISTS ident (cur INTEGER NOT NULL)")?;
        let count: i64 = c.query_row("SELECT COUNT(*) FROM ident", [], |r| r.get(0))?;
        if count == 0 {
            c.execute("INSERT INTO ident (cur) VALUES (0)", [])?;
        }
        drop(c);
        Ok(Self { conn })
    }

    /// Reserves `n` contiguous ids, returning the first. The reservation is
    /// unconditional: a crash after this call but before the ids are used
    /// simply burns them, which is fine since ids only need to be unique
    /// within the correlation window, not globally.
    pub fn reserve(&self, n: u32) -> Result<u32, StoreError> {
        let c = self.conn.lock();
        let tx = c.unchecked_transaction()?;
        let cur: i64 = tx.query_row("SELECT cur FROM ident LIMIT 1", [], |r| r.get(0))?;
        let start = (cur as u64 % (1u64 << 32)) as u32;
        let next = (cur as u64 + n as u64) % (1u64 << 32);
        tx.execute("UPDATE ident SET cur = ?1", rusqlite::params![next as i64])?;
        tx.commit()?;
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Arc<Mutex<Connection>> {
        Arc::new(Mutex::new(Connection::open_in_memory().unwrap()))
    }

    #[test]
    fn reserves_contiguous_ids() {
        let ident = IdentCounter::open(memory_conn()).unwrap();
        let first = ident.reserve(3).unwrap();
        assert_eq!(first, 0);
        let second = ident.reserve(2).unwrap();
        assert_eq!(second, 3);
    }

    #[test]
    fn reservation_survives_reopen() {
        let conn = memory_conn();
        {
            let ident = IdentCounter::open(conn.clone()).unwrap();
            ident.reserve(10).unwrap();
        }
        let ident2 = IdentCounter::open(conn).unwrap();
        assert_eq!(ident2.reserve(1).unwrap(), 10);
    }
}
