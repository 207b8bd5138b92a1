//! Monitor lease: a single-row lock granting exclusive reconciliation
//! rights to one instance for a bounded TTL.

use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::{to_ts, Db};

pub const POSITION_MONITOR_LOCK: &str = "position_monitor";

impl Db {
    /// Starters always recycle expired leases first.
    pub fn gc_expired_locks(&self) -> Result<usize> {
        self.with(|conn| {
            conn.execute(
                "DELETE FROM monitor_locks WHERE expires_at < ?1",
                params![to_ts(Utc::now())],
            )
        })
    }

    /// Insert-or-ignore then read back: the lease belongs to whoever's
    /// instance id survives.
    pub fn try_acquire_lock(
        &self,
        lock_type: &str,
        instance_id: &str,
        ttl_secs: i64,
    ) -> Result<bool> {
        let now = Utc::now();
        self.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO monitor_locks
                    (lock_type, instance_id, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    lock_type,
                    instance_id,
                    to_ts(now),
                    to_ts(now + Duration::seconds(ttl_secs)),
                ],
            )?;
            let holder: Option<String> = conn
                .query_row(
                    "SELECT instance_id FROM monitor_locks WHERE lock_type = ?1",
                    params![lock_type],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(holder.as_deref() == Some(instance_id))
        })
    }

    /// Release only our own lease; someone else's is left alone.
    pub fn release_lock(&self, lock_type: &str, instance_id: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "DELETE FROM monitor_locks WHERE lock_type = ?1 AND instance_id = ?2",
                params![lock_type, instance_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_loses_the_race() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.try_acquire_lock(POSITION_MONITOR_LOCK, "a", 120).unwrap());
        assert!(!db.try_acquire_lock(POSITION_MONITOR_LOCK, "b", 120).unwrap());
        // Holder re-acquiring is fine.
        assert!(db.try_acquire_lock(POSITION_MONITOR_LOCK, "a", 120).unwrap());
    }

    #[test]
    fn release_frees_the_lease() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.try_acquire_lock(POSITION_MONITOR_LOCK, "a", 120).unwrap());
        db.release_lock(POSITION_MONITOR_LOCK, "a").unwrap();
        assert!(db.try_acquire_lock(POSITION_MONITOR_LOCK, "b", 120).unwrap());
    }

    #[test]
    fn release_ignores_foreign_lease() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.try_acquire_lock(POSITION_MONITOR_LOCK, "a", 120).unwrap());
        db.release_lock(POSITION_MONITOR_LOCK, "b").unwrap();
        assert!(!db.try_acquire_lock(POSITION_MONITOR_LOCK, "b", 120).unwrap());
    }

    #[test]
    fn expired_lease_is_recycled() {
        let db = Db::open_in_memory().unwrap();
        // TTL in the past: immediately expired.
        assert!(db.try_acquire_lock(POSITION_MONITOR_LOCK, "a", -1).unwrap());
        db.gc_expired_locks().unwrap();
        assert!(db.try_acquire_lock(POSITION_MONITOR_LOCK, "b", 120).unwrap());
    }
}
