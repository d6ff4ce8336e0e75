use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use crate::error::StoreError;
use crate::model::Slot;
use crate::store::Store;

impl Store {
    /// Ensure at least `count` slots exist in `[port_start, port_start +
    /// count)` tagged `{tag_prefix}-{port}`, creating whichever are
    /// missing (§4.9: "the pool of inbound slots is provisioned once and
    /// reused across batches"). Idempotent: re-running with the same
    /// arguments is a no-op for ports that already have a slot.
    #[instrument(skip(self))]
    pub fn ensure_slots(
        &self,
        count: u32,
        port_start: u16,
        tag_prefix: &str,
        role: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        for i in 0..count as u32 {
            let port = port_start as u32 + i;
            let tag = format!("{tag_prefix}-{port}");
            conn.execute(
                "INSERT OR IGNORE INTO inbound_slots (port, tag, role, status)
                 VALUES (?1, ?2, ?3, 'new')",
                params![port, tag, role],
            )?;
        }
        Ok(())
    }

    /// Claim one free slot of `role` for `record_id`, marking it
    /// `in_use`. Returns `None` if the pool is exhausted (caller should
    /// back off, not error the whole batch).
    #[instrument(skip(self))]
    pub fn try_reserve_slot(&self, role: &str, record_id: i64) -> Result<Option<Slot>, StoreError> {
        self.with_immediate_tx(|conn| {
            let slot = conn
                .query_row(
                    "SELECT * FROM inbound_slots
                     WHERE role = ?1 AND status = 'new'
                     ORDER BY port ASC
                     LIMIT 1",
                    params![role],
                    Slot::from_row,
                )
                .optional()?;
            let Some(slot) = slot else {
                return Ok(None);
            };
            conn.execute(
                "UPDATE inbound_slots SET status = 'in_use', link_id = ?2 WHERE id = ?1",
                params![slot.id, record_id],
            )?;
            Ok(Some(Slot {
                status: "in_use".to_string(),
                link_id: Some(record_id),
                ..slot
            }))
        })
    }

    /// Provision (if needed), reset, and fetch the full pool of slots for
    /// one batch's port range in a single transaction (§4.10 step 2:
    /// "ensure slots exist; clear link_id/outbound_tag/status on all
    /// slots in the range; read them back"). Unlike [`Store::ensure_slots`]
    /// this always resets existing slots in range to `new` first, so a
    /// batch never inherits a stale binding from a crashed predecessor.
    #[instrument(skip(self))]
    pub fn prepare_batch_slots(
        &self,
        role: &str,
        port_start: u16,
        count: u32,
        tag_prefix: &str,
    ) -> Result<Vec<Slot>, StoreError> {
        self.ensure_slots(count, port_start, tag_prefix, role)?;
        let port_start = port_start as i64;
        let port_end = port_start + count as i64;
        self.with_immediate_tx(|conn| {
            conn.execute(
                "UPDATE inbound_slots SET status = 'new', link_id = NULL, outbound_tag = NULL
                 WHERE role = ?1 AND port >= ?2 AND port < ?3",
                params![role, port_start, port_end],
            )?;
            let mut stmt = conn.prepare(
                "SELECT * FROM inbound_slots WHERE role = ?1 AND port >= ?2 AND port < ?3 ORDER BY port ASC",
            )?;
            let rows = stmt
                .query_map(params![role, port_start, port_end], Slot::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Bind a reserved slot to the record and outbound tag it's running
    /// for the duration of a test (§4.10 step e).
    #[instrument(skip(self))]
    pub fn bind_slot(&self, slot_id: i64, link_id: i64, outbound_tag: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE inbound_slots SET status = 'in_use', link_id = ?2, outbound_tag = ?3 WHERE id = ?1",
            params![slot_id, link_id, outbound_tag],
        )?;
        Ok(())
    }

    pub fn release_slot(&self, slot_id: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE inbound_slots SET status = 'new', link_id = NULL, outbound_tag = NULL
             WHERE id = ?1",
            params![slot_id],
        )?;
        Ok(())
    }

    pub fn get_slot(&self, id: i64) -> Result<Option<Slot>, StoreError> {
        self.conn()?
            .query_row("SELECT * FROM inbound_slots WHERE id = ?1", params![id], Slot::from_row)
            .optional()
            .map_err(StoreError::from)
    }

    pub fn count_slots(&self, role: &str) -> Result<i64, StoreError> {
        self.conn()?.query_row(
            "SELECT COUNT(*) FROM inbound_slots WHERE role = ?1",
            params![role],
            |row| row.get(0),
        ).map_err(StoreError::from)
    }
}
