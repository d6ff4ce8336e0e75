use chrono::Utc;
use rusqlite::params;
use tracing::instrument;

use crate::error::StoreError;
use crate::model::{Record, TestOutcome};
use crate::store::Store;

impl Store {
    /// Atomically claim up to `count` eligible records into batch
    /// `batch_id`, owned by `owner`, for up to `lock_timeout_secs` (§4.10
    /// step 1 "Reservation"). Eligible means: has a config, not invalid,
    /// not unsupported, not currently in use by another in-flight lock,
    /// and either never tested or whose previous lock has expired.
    /// Records are claimed oldest-tested-first so the whole population
    /// cycles through testing instead of starving.
    #[instrument(skip(self))]
    pub fn reserve_batch(
        &self,
        batch_id: &str,
        owner: &str,
        count: u32,
        lock_timeout_secs: i64,
    ) -> Result<Vec<Record>, StoreError> {
        let now = Utc::now().timestamp();
        let deadline = now + lock_timeout_secs;

        self.with_immediate_tx(|conn| {
            let ids: Vec<i64> = {
                let mut stmt = conn.prepare(
                    "SELECT id FROM links
                     WHERE is_primary = 1
                       AND config_json != ''
                       AND is_invalid = 0
                       AND is_unsupported = 0
                       AND is_in_use = 0
                       AND (test_lock_until IS NULL OR test_lock_until < ?1)
                     ORDER BY
                        CASE WHEN last_tested_at IS NULL THEN 0 ELSE 1 END,
                        last_tested_at ASC,
                        id ASC
                     LIMIT ?2",
                )?;
                stmt.query_map(params![now, count], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                conn.execute(
                    "UPDATE links SET
                        test_status = 'testing',
                        test_started_at = ?2,
                        test_lock_until = ?3,
                        test_lock_owner = ?4,
                        test_batch_id = ?5
                     WHERE id = ?1",
                    params![id, now, deadline, owner, batch_id],
                )?;
                claimed.push(conn.query_row(
                    "SELECT * FROM links WHERE id = ?1",
                    params![id],
                    Record::from_row,
                )?);
            }
            Ok(claimed)
        })
    }

    /// Write a completed test's outcome back onto its record and release
    /// the lock (§4.10 step 4 "Attribution"). Geolocation fields are only
    /// overwritten on success; a failed test preserves whatever the
    /// record's last successful probe found. Also clears `is_in_use`,
    /// `bound_port`, and `inbound_tag` so the record's slot can be
    /// reused by the next batch.
    #[instrument(skip(self, outcome))]
    pub fn attribute_result(&self, record_id: i64, outcome: TestOutcome) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        self.conn()?.execute(
            "UPDATE links SET
                test_status = 'idle',
                test_started_at = NULL,
                test_lock_until = NULL,
                test_lock_owner = NULL,
                test_batch_id = NULL,
                last_tested_at = ?2,
                last_test_ok = ?3,
                last_test_error = ?4,
                is_alive = ?3,
                ip = CASE WHEN ?3 = 1 THEN ?5 ELSE ip END,
                country = CASE WHEN ?3 = 1 THEN ?6 ELSE country END,
                city = CASE WHEN ?3 = 1 THEN ?7 ELSE city END,
                datacenter = CASE WHEN ?3 = 1 THEN ?8 ELSE datacenter END,
                is_in_use = 0,
                bound_port = NULL,
                inbound_tag = NULL
             WHERE id = ?1",
            params![
                record_id,
                now,
                outcome.ok,
                outcome.error,
                outcome.ip,
                outcome.country,
                outcome.city,
                outcome.datacenter,
            ],
        )?;
        Ok(())
    }

    /// Sweep locks whose deadline has passed without an attribution
    /// (worker crashed or was killed mid-test): return the record to
    /// `idle` so a later batch can retry it (§4.10 "expired lock sweep").
    #[instrument(skip(self))]
    pub fn release_expired_locks(&self) -> Result<u64, StoreError> {
        let now = Utc::now().timestamp();
        let changed = self.conn()?.execute(
            "UPDATE links SET
                test_status = 'idle',
                test_started_at = NULL,
                test_lock_until = NULL,
                test_lock_owner = NULL,
                test_batch_id = NULL
             WHERE test_status = 'testing' AND test_lock_until < ?1",
            params![now],
        )?;
        Ok(changed as u64)
    }

    /// Bind a reserved record to the socket it will be tested through,
    /// recording which local port and outbound/inbound tags are in play
    /// for the duration of the test (§4.10 step e "Wiring").
    pub fn bind_record_to_slot(
        &self,
        record_id: i64,
        bound_port: i64,
        inbound_tag: &str,
        outbound_tag: &str,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE links SET is_in_use = 1, bound_port = ?2, inbound_tag = ?3, outbound_tag = ?4 WHERE id = ?1",
            params![record_id, bound_port, inbound_tag, outbound_tag],
        )?;
        Ok(())
    }

    pub fn records_in_batch(&self, batch_id: &str) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM links WHERE test_batch_id = ?1")?;
        let rows = stmt
            .query_map(params![batch_id], Record::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Release a reservation made by [`Store::reserve_batch`] without
    /// recording a test outcome — used when a record was claimed but its
    /// pair (slot or prep step) never produced a probe job, e.g. the
    /// slot pool ran out or prep failed before the engine committed to a
    /// run (§4.10 "truncate the longer list").
    pub fn cancel_reservation(&self, record_id: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE links SET
                test_status = 'idle',
                test_started_at = NULL,
                test_lock_until = NULL,
                test_lock_owner = NULL,
                test_batch_id = NULL
             WHERE id = ?1",
            params![record_id],
        )?;
        Ok(())
    }

    /// Total records currently marked alive, surfaced in every batch
    /// report's summary (§4.10 "write_report"/"db_is_alive_1_total").
    pub fn count_alive(&self) -> Result<i64, StoreError> {
        self.conn()?
            .query_row("SELECT COUNT(*) FROM links WHERE is_alive = 1", [], |row| row.get(0))
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_record(store: &Store, uri: &str) -> i64 {
        let id = store.insert_or_ignore_uri(uri).unwrap();
        store.update_config_json(id, "{}").unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE links SET is_primary = 1 WHERE id = ?1", params![id])
            .unwrap();
        id
    }

    #[test]
    fn reserve_batch_claims_and_locks_records() {
        let store = Store::open_in_memory().unwrap();
        ready_record(&store, "vmess://a");
        ready_record(&store, "vmess://b");

        let claimed = store.reserve_batch("batch-1", "owner-1", 10, 60).unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|r| r.test_status == "testing"));

        // A second reservation before locks expire sees nothing eligible.
        let second = store.reserve_batch("batch-2", "owner-1", 10, 60).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn attribute_result_releases_lock_and_records_outcome() {
        let store = Store::open_in_memory().unwrap();
        let id = ready_record(&store, "vmess://a");
        store.reserve_batch("batch-1", "owner-1", 10, 60).unwrap();

        store
            .attribute_result(
                id,
                TestOutcome {
                    ok: true,
                    error: None,
                    ip: Some("1.2.3.4".into()),
                    country: Some("US".into()),
                    city: None,
                    datacenter: None,
                },
            )
            .unwrap();

        let rec = store.get_record(id).unwrap().unwrap();
        assert_eq!(rec.test_status, "idle");
        assert!(rec.test_lock_until.is_none());
        assert!(rec.is_alive);
        assert_eq!(rec.ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn failed_attribution_preserves_prior_geolocation() {
        let store = Store::open_in_memory().unwrap();
        let id = ready_record(&store, "vmess://a");
        store.reserve_batch("batch-1", "owner-1", 10, 60).unwrap();
        store
            .attribute_result(
                id,
                TestOutcome {
                    ok: true,
                    error: None,
                    ip: Some("1.2.3.4".into()),
                    country: Some("US".into()),
                    city: Some("NYC".into()),
                    datacenter: None,
                },
            )
            .unwrap();

        store.reserve_batch("batch-2", "owner-1", 10, 60).unwrap();
        store
            .attribute_result(
                id,
                TestOutcome {
                    ok: false,
                    error: Some("timeout".into()),
                    ip: None,
                    country: None,
                    city: None,
                    datacenter: None,
                },
            )
            .unwrap();

        let rec = store.get_record(id).unwrap().unwrap();
        assert!(!rec.is_alive);
        assert_eq!(rec.last_test_error.as_deref(), Some("timeout"));
        assert_eq!(rec.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(rec.city.as_deref(), Some("NYC"));
    }

    #[test]
    fn cancel_reservation_returns_record_to_idle_without_recording_a_result() {
        let store = Store::open_in_memory().unwrap();
        let id = ready_record(&store, "vmess://a");
        store.reserve_batch("batch-1", "owner-1", 10, 60).unwrap();

        store.cancel_reservation(id).unwrap();

        let rec = store.get_record(id).unwrap().unwrap();
        assert_eq!(rec.test_status, "idle");
        assert!(rec.test_lock_until.is_none());
        assert!(rec.last_test_error.is_none());
    }

    #[test]
    fn expired_locks_are_released_back_to_idle() {
        let store = Store::open_in_memory().unwrap();
        ready_record(&store, "vmess://a");
        // lock_timeout_secs = -1 so the lock is already expired relative to now.
        store.reserve_batch("batch-1", "owner-1", 10, -1).unwrap();

        let released = store.release_expired_locks().unwrap();
        assert_eq!(released, 1);
    }
}
