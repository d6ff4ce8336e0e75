use rusqlite::Row;

/// A row of the `links` table: one subscription-derived proxy URI and
/// everything discovered about it over its lifetime (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: i64,
    pub uri: String,
    pub repaired_uri: Option<String>,
    pub config_json: String,
    pub fingerprint: Option<String>,
    pub group_id: Option<String>,
    pub is_primary: bool,
    pub is_invalid: bool,
    pub is_unsupported: bool,
    pub outbound_tag: Option<String>,
    pub inbound_tag: Option<String>,
    pub test_status: String,
    pub test_started_at: Option<i64>,
    pub test_lock_until: Option<i64>,
    pub test_lock_owner: Option<String>,
    pub test_batch_id: Option<String>,
    pub last_tested_at: Option<i64>,
    pub last_test_ok: Option<bool>,
    pub last_test_error: Option<String>,
    pub is_alive: bool,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub datacenter: Option<String>,
    pub is_in_use: bool,
    pub bound_port: Option<i64>,
}

impl Record {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Record {
            id: row.get("id")?,
            uri: row.get("uri")?,
            repaired_uri: row.get("repaired_uri")?,
            config_json: row.get("config_json")?,
            fingerprint: row.get("fingerprint")?,
            group_id: row.get("group_id")?,
            is_primary: row.get::<_, i64>("is_primary")? != 0,
            is_invalid: row.get::<_, i64>("is_invalid")? != 0,
            is_unsupported: row.get::<_, i64>("is_unsupported")? != 0,
            outbound_tag: row.get("outbound_tag")?,
            inbound_tag: row.get("inbound_tag")?,
            test_status: row.get("test_status")?,
            test_started_at: row.get("test_started_at")?,
            test_lock_until: row.get("test_lock_until")?,
            test_lock_owner: row.get("test_lock_owner")?,
            test_batch_id: row.get("test_batch_id")?,
            last_tested_at: row.get("last_tested_at")?,
            last_test_ok: row
                .get::<_, Option<i64>>("last_test_ok")?
                .map(|v| v != 0),
            last_test_error: row.get("last_test_error")?,
            is_alive: row.get::<_, i64>("is_alive")? != 0,
            ip: row.get("ip")?,
            country: row.get("country")?,
            city: row.get("city")?,
            datacenter: row.get("datacenter")?,
            is_in_use: row.get::<_, i64>("is_in_use")? != 0,
            bound_port: row.get("bound_port")?,
        })
    }
}

/// A row of the `inbound_slots` table: one reusable local SOCKS/HTTP
/// inbound port that the tester binds a link's outbound to (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: i64,
    pub port: i64,
    pub tag: String,
    pub role: String,
    pub link_id: Option<i64>,
    pub outbound_tag: Option<String>,
    pub status: String,
}

impl Slot {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Slot {
            id: row.get("id")?,
            port: row.get("port")?,
            tag: row.get("tag")?,
            role: row.get("role")?,
            link_id: row.get("link_id")?,
            outbound_tag: row.get("outbound_tag")?,
            status: row.get("status")?,
        })
    }
}

/// Outcome of a single proxy test, as attributed back onto a [`Record`]
/// (§4.10 step 4).
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub ok: bool,
    pub error: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub datacenter: Option<String>,
}
