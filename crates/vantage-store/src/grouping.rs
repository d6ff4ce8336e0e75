use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use crate::error::StoreError;
use crate::store::Store;

impl Store {
    /// Grouping phase A (§4.8, ported from `group_updater.py`'s
    /// `_process_hash_grouping`): every record that has a fingerprint but
    /// no `group_id` joins the group for that fingerprint. The group id is
    /// whichever non-null `group_id` already exists among that
    /// fingerprint's rows, or — if none does yet — the textual `MIN(id)`
    /// of the whole fingerprint group. Only null `group_id` rows are ever
    /// written; an existing group id is never rewritten.
    #[instrument(skip(self))]
    pub fn group_by_fingerprint(&self) -> Result<u64, StoreError> {
        self.with_immediate_tx(|conn| {
            let fingerprints: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT fingerprint FROM links
                     WHERE fingerprint IS NOT NULL AND group_id IS NULL",
                )?;
                stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?
            };

            let mut changed = 0u64;
            for fingerprint in fingerprints {
                let existing_group_id: Option<String> = conn
                    .query_row(
                        "SELECT group_id FROM links
                         WHERE fingerprint = ?1 AND group_id IS NOT NULL AND group_id != ''
                         LIMIT 1",
                        params![fingerprint],
                        |row| row.get(0),
                    )
                    .optional()?;

                let group_id = match existing_group_id {
                    Some(id) => id,
                    None => {
                        let min_id: i64 = conn.query_row(
                            "SELECT MIN(id) FROM links WHERE fingerprint = ?1",
                            params![fingerprint],
                            |row| row.get(0),
                        )?;
                        min_id.to_string()
                    }
                };

                changed += conn.execute(
                    "UPDATE links SET group_id = ?2
                     WHERE fingerprint = ?1 AND (group_id IS NULL OR group_id = '')",
                    params![fingerprint, group_id],
                )? as u64;
            }
            Ok(changed)
        })
    }

    /// Grouping phase B (§4.8): within each group, exactly one record is
    /// primary. Prefers a record already marked primary (stable across
    /// re-runs); otherwise picks the oldest (lowest id) non-invalid,
    /// non-unsupported member. All other members of the group are
    /// demoted.
    #[instrument(skip(self))]
    pub fn elect_primaries(&self) -> Result<u64, StoreError> {
        self.with_immediate_tx(|conn| {
            let group_ids: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT group_id FROM links WHERE group_id IS NOT NULL",
                )?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            let mut changed = 0u64;
            for group_id in group_ids {
                let existing_primary: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM links WHERE group_id = ?1 AND is_primary = 1 LIMIT 1",
                        params![group_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                let primary_id = match existing_primary {
                    Some(id) => id,
                    None => {
                        let candidate: Option<i64> = conn
                            .query_row(
                                "SELECT id FROM links
                                 WHERE group_id = ?1 AND is_invalid = 0 AND is_unsupported = 0
                                 ORDER BY id ASC LIMIT 1",
                                params![group_id],
                                |row| row.get(0),
                            )
                            .optional()?;
                        match candidate {
                            Some(id) => id,
                            None => continue,
                        }
                    }
                };

                changed += conn.execute(
                    "UPDATE links SET is_primary = 1 WHERE id = ?1 AND is_primary = 0",
                    params![primary_id],
                )? as u64;
                changed += conn.execute(
                    "UPDATE links SET is_primary = 0
                     WHERE group_id = ?1 AND id != ?2 AND is_primary = 1",
                    params![group_id, primary_id],
                )? as u64;
            }
            Ok(changed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_fingerprint(store: &Store, uri: &str, fp: &str) -> i64 {
        let id = store.insert_or_ignore_uri(uri).unwrap();
        store.update_config_json(id, "{}").unwrap();
        store.update_fingerprint(id, fp).unwrap();
        id
    }

    #[test]
    fn group_by_fingerprint_assigns_shared_group() {
        let store = Store::open_in_memory().unwrap();
        let a = with_fingerprint(&store, "vmess://a", "fp1");
        let b = with_fingerprint(&store, "vmess://b", "fp1");
        let c = with_fingerprint(&store, "vmess://c", "fp2");

        store.group_by_fingerprint().unwrap();

        let ra = store.get_record(a).unwrap().unwrap();
        let rb = store.get_record(b).unwrap().unwrap();
        let rc = store.get_record(c).unwrap().unwrap();
        assert_eq!(ra.group_id, rb.group_id);
        assert_ne!(ra.group_id, rc.group_id);
    }

    #[test]
    fn group_id_is_textual_min_id_not_the_fingerprint_hash() {
        // §8 Testable Property #6 worked example: three records sharing a
        // fingerprint, ids 42/17/99 (inserted out of id order below only
        // insofar as the assertion doesn't assume insertion order — the
        // *lowest id* must win regardless of which row got the fingerprint
        // written first).
        let store = Store::open_in_memory().unwrap();
        let a = with_fingerprint(&store, "vmess://a", "fp-shared");
        let b = with_fingerprint(&store, "vmess://b", "fp-shared");
        let c = with_fingerprint(&store, "vmess://c", "fp-shared");
        let min_id = a.min(b).min(c);

        store.group_by_fingerprint().unwrap();

        let ra = store.get_record(a).unwrap().unwrap();
        let rb = store.get_record(b).unwrap().unwrap();
        let rc = store.get_record(c).unwrap().unwrap();
        assert_eq!(ra.group_id.as_deref(), Some(min_id.to_string().as_str()));
        assert_eq!(rb.group_id, ra.group_id);
        assert_eq!(rc.group_id, ra.group_id);
    }

    #[test]
    fn group_by_fingerprint_never_rewrites_an_existing_group_id() {
        let store = Store::open_in_memory().unwrap();
        let a = with_fingerprint(&store, "vmess://a", "fp-shared");
        store.group_by_fingerprint().unwrap();
        let ra = store.get_record(a).unwrap().unwrap();
        let original_group_id = ra.group_id.clone();

        // A second record joins the same fingerprint later; phase A must
        // fill its null group_id from the existing one, not recompute a
        // fresh min(id).
        let b = with_fingerprint(&store, "vmess://b", "fp-shared");
        store.group_by_fingerprint().unwrap();

        let ra2 = store.get_record(a).unwrap().unwrap();
        let rb = store.get_record(b).unwrap().unwrap();
        assert_eq!(ra2.group_id, original_group_id);
        assert_eq!(rb.group_id, original_group_id);
    }

    #[test]
    fn elect_primaries_picks_exactly_one_per_group() {
        let store = Store::open_in_memory().unwrap();
        let a = with_fingerprint(&store, "vmess://a", "fp1");
        let b = with_fingerprint(&store, "vmess://b", "fp1");
        store.group_by_fingerprint().unwrap();
        store.elect_primaries().unwrap();

        let ra = store.get_record(a).unwrap().unwrap();
        let rb = store.get_record(b).unwrap().unwrap();
        assert!(ra.is_primary);
        assert!(!rb.is_primary);

        // Re-running keeps the same primary stable.
        store.elect_primaries().unwrap();
        let ra2 = store.get_record(a).unwrap().unwrap();
        assert!(ra2.is_primary);
    }
}
