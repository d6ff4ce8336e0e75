use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use crate::error::StoreError;
use crate::model::Record;
use crate::store::Store;

const TAG_RAND_LEN: usize = 6;
const TAG_MAX_ATTEMPTS: u32 = 6;

impl Store {
    /// Insert a newly-collected URI, ignoring it if already present
    /// (`uri` is unique) — the collector's dedup-by-uri step (§4.2, §4.3).
    /// Returns the row id whether it was freshly inserted or already
    /// existed.
    #[instrument(skip(self))]
    pub fn insert_or_ignore_uri(&self, uri: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO links (uri, config_json) VALUES (?1, '')",
            params![uri],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM links WHERE uri = ?1",
            params![uri],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_record(&self, id: i64) -> Result<Option<Record>, StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM links WHERE id = ?1", params![id], |row| {
            Record::from_row(row)
        })
        .optional()
        .map_err(StoreError::from)
    }

    /// Records not yet checked for concatenated multi-link URIs (§4.3,
    /// ported from `importer.py`'s link normalizer). Singleton URIs stay
    /// eligible every pass — the check is cheap and idempotent — but
    /// records already split apart (marked invalid) or already built drop
    /// out of scope.
    pub fn records_needing_split(&self, limit: i64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM links
             WHERE is_invalid = 0 AND config_json = ''
             ORDER BY id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Record::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Records still missing an `outbound_tag` (§4.4, input to the tag
    /// allocator).
    pub fn records_needing_outbound_tag(&self, limit: i64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM links
             WHERE is_invalid = 0 AND is_unsupported = 0
               AND (outbound_tag IS NULL OR outbound_tag = '')
             ORDER BY id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Record::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fresh, tagged records with no `config_json` yet — input to the
    /// bridge-first JSON builder (§4.5, ported from `json_updater.py`'s
    /// `update_missing_json`). The raw `uri` is tried directly; no local
    /// repair is attempted at this stage.
    pub fn records_needing_build(&self, limit: i64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM links
             WHERE is_invalid = 0
               AND is_unsupported = 0
               AND config_json = ''
               AND outbound_tag IS NOT NULL AND outbound_tag != ''
             ORDER BY id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Record::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Records the bridge-first build stage couldn't convert, now eligible
    /// for local repair + bridge retry (§4.6, ported from
    /// `json_repair_updater.py`'s `repair_and_fill_json`). Scheme-level
    /// unsupported records (`is_unsupported = 1`) are excluded — that's a
    /// terminal state, not a repair candidate.
    pub fn records_awaiting_repair(&self, limit: i64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM links
             WHERE is_invalid = 1 AND is_unsupported = 0
             ORDER BY id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Record::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Records with a built config but no fingerprint yet (§4.7).
    pub fn records_needing_fingerprint(&self, limit: i64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM links
             WHERE config_json != '' AND fingerprint IS NULL
             ORDER BY id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Record::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Startup cleanup for the repair stage (§4.6): a `repaired_uri` only
    /// means anything while its record is still invalid. Clears it off any
    /// record that's since become valid again, so stale diagnostics don't
    /// linger.
    pub fn clear_stale_repaired_uri(&self) -> Result<u64, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE links SET repaired_uri = NULL
             WHERE repaired_uri IS NOT NULL AND TRIM(repaired_uri) != '' AND is_invalid = 0",
            [],
        )?;
        Ok(changed as u64)
    }

    pub fn update_repaired_uri(&self, id: i64, repaired: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE links SET repaired_uri = ?2 WHERE id = ?1",
            params![id, repaired],
        )?;
        Ok(())
    }

    pub fn update_config_json(&self, id: i64, config_json: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE links SET config_json = ?2 WHERE id = ?1",
            params![id, config_json],
        )?;
        Ok(())
    }

    pub fn update_fingerprint(&self, id: i64, fingerprint: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE links SET fingerprint = ?2 WHERE id = ?1",
            params![id, fingerprint],
        )?;
        Ok(())
    }

    pub fn mark_invalid(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE links SET is_invalid = 1, last_test_error = ?2 WHERE id = ?1",
            params![id, reason],
        )?;
        Ok(())
    }

    pub fn mark_unsupported(&self, id: i64) -> Result<(), StoreError> {
        self.conn()?
            .execute("UPDATE links SET is_unsupported = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Clear the invalid flag and any stashed `repaired_uri` diagnostics
    /// once a record is valid again — either the repair stage recovered
    /// it, or its scheme turned out to be one we never support and
    /// there's nothing left to retry (§4.6).
    pub fn clear_invalid_flag(&self, id: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE links SET is_invalid = 0, repaired_uri = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Assign a random collision-free tag to a column guarded by a
    /// partial-unique index (`outbound_tag` or `inbound_tag`). Generates a
    /// fresh `<prefix><6 random alphanumeric chars>` candidate on each
    /// attempt — not a predictable sequential suffix — retrying up to
    /// [`TAG_MAX_ATTEMPTS`] times on a uniqueness collision (§4.4, ported
    /// from `tag_updater.py`'s `generate_tag`). Exhausting the retry
    /// budget is not meant to wedge the caller: the batch-local
    /// `fill_missing_outbound_tags` loop this mirrors just leaves the
    /// record for the next pass.
    #[instrument(skip(self))]
    pub fn allocate_tag(&self, column: TagColumn, record_id: i64, prefix: &str) -> Result<String, StoreError> {
        let column_name = column.column_name();
        let conn = self.conn()?;
        for _ in 0..TAG_MAX_ATTEMPTS {
            let candidate = generate_tag(prefix);
            let sql = format!("UPDATE links SET {column_name} = ?2 WHERE id = ?1");
            match conn.execute(&sql, params![record_id, candidate]) {
                Ok(_) => return Ok(candidate),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::TagAllocationExhausted(TAG_MAX_ATTEMPTS))
    }
}

fn generate_tag(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TAG_RAND_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

#[derive(Debug, Clone, Copy)]
pub enum TagColumn {
    Outbound,
    Inbound,
}

impl TagColumn {
    fn column_name(self) -> &'static str {
        match self {
            TagColumn::Outbound => "outbound_tag",
            TagColumn::Inbound => "inbound_tag",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_or_ignore_is_idempotent_by_uri() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_or_ignore_uri("vmess://a").unwrap();
        let b = store.insert_or_ignore_uri("vmess://a").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pipeline_stage_queries_filter_correctly() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_or_ignore_uri("vmess://a").unwrap();
        assert_eq!(store.records_needing_split(10).unwrap().len(), 1);
        assert_eq!(store.records_needing_outbound_tag(10).unwrap().len(), 1);

        store.allocate_tag(TagColumn::Outbound, id, "x_").unwrap();
        assert_eq!(store.records_needing_outbound_tag(10).unwrap().len(), 0);
        assert_eq!(store.records_needing_build(10).unwrap().len(), 1);

        store.update_config_json(id, "{\"a\":1}").unwrap();
        assert_eq!(store.records_needing_build(10).unwrap().len(), 0);
        assert_eq!(store.records_needing_fingerprint(10).unwrap().len(), 1);

        store.update_fingerprint(id, "deadbeef").unwrap();
        assert_eq!(store.records_needing_fingerprint(10).unwrap().len(), 0);
    }

    #[test]
    fn records_awaiting_repair_excludes_unsupported() {
        let store = Store::open_in_memory().unwrap();
        let invalid = store.insert_or_ignore_uri("vmess://a").unwrap();
        store.mark_invalid(invalid, "bridge_conversion_failed").unwrap();
        let unsupported = store.insert_or_ignore_uri("wireguard://b").unwrap();
        store.mark_invalid(unsupported, "unsupported_scheme").unwrap();
        store.mark_unsupported(unsupported).unwrap();

        let awaiting = store.records_awaiting_repair(10).unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].id, invalid);
    }

    #[test]
    fn clear_stale_repaired_uri_only_touches_valid_records() {
        let store = Store::open_in_memory().unwrap();
        let still_invalid = store.insert_or_ignore_uri("vmess://a").unwrap();
        store.mark_invalid(still_invalid, "x").unwrap();
        store.update_repaired_uri(still_invalid, "vmess://a-repaired").unwrap();

        let now_valid = store.insert_or_ignore_uri("vmess://b").unwrap();
        store.update_repaired_uri(now_valid, "vmess://b-repaired").unwrap();

        let changed = store.clear_stale_repaired_uri().unwrap();
        assert_eq!(changed, 1);
        assert_eq!(store.get_record(now_valid).unwrap().unwrap().repaired_uri, None);
        assert_eq!(
            store.get_record(still_invalid).unwrap().unwrap().repaired_uri,
            Some("vmess://a-repaired".to_string())
        );
    }

    #[test]
    fn allocate_tag_produces_prefixed_random_tags_of_expected_shape() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_or_ignore_uri("vmess://a").unwrap();
        let tag = store.allocate_tag(TagColumn::Outbound, a, "x_").unwrap();
        assert!(tag.starts_with("x_"));
        assert_eq!(tag.len(), "x_".len() + 6);
        assert!(tag[2..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn allocate_tag_gives_distinct_tags_to_distinct_records() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_or_ignore_uri("vmess://a").unwrap();
        let b = store.insert_or_ignore_uri("vmess://b").unwrap();
        let tag_a = store.allocate_tag(TagColumn::Outbound, a, "x_").unwrap();
        let tag_b = store.allocate_tag(TagColumn::Outbound, b, "x_").unwrap();
        assert_ne!(tag_a, tag_b);
    }
}
