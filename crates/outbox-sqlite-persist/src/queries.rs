//! Standalone query functions over `outbox_entries`.
//!
//! Each function takes a `&Connection` as its first parameter and runs in
//! whatever transaction that connection has open. Every state change is a
//! single conditional statement on the row's current version, which is what
//! keeps concurrent claimants from both owning an entry.

use chrono::{DateTime, Utc};
use outbox_engine::{EntryId, EntryStatus, OutboxEntry};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, warn};

use crate::{DatabaseError, DatabaseResult, EntryCounts, EntryFilter};

// ==========================================
// Row mapping
// ==========================================

fn from_millis(index: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(index, millis))
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let invocation: String = row.get(2)?;
    let invocation = serde_json::from_str(&invocation)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(OutboxEntry {
        id: EntryId::from_string(row.get::<_, String>(0)?),
        unique_request_id: row.get(1)?,
        invocation,
        created_at: from_millis(3, row.get(3)?)?,
        last_attempt_at: row
            .get::<_, Option<i64>>(4)?
            .map(|millis| from_millis(4, millis))
            .transpose()?,
        next_attempt_at: from_millis(5, row.get(5)?)?,
        attempts: row.get(6)?,
        blacklisted: row.get(7)?,
        processed: row.get(8)?,
        version: row.get(9)?,
    })
}

fn status_clause(status: Option<EntryStatus>) -> &'static str {
    match status {
        None => "1 = 1",
        Some(EntryStatus::Pending) => "processed = 0 AND blacklisted = 0",
        Some(EntryStatus::Blacklisted) => "processed = 0 AND blacklisted = 1",
        Some(EntryStatus::Processed) => "processed = 1",
    }
}

// ==========================================
// Entries
// ==========================================

/// Insert a new entry.
///
/// A taken `unique_request_id` surfaces as [`DatabaseError::Duplicate`].
pub fn insert_entry(conn: &Connection, entry: &OutboxEntry) -> DatabaseResult<()> {
    let invocation = serde_json::to_string(&entry.invocation)?;
    let result = conn.execute(
        "INSERT INTO outbox_entries (id, unique_request_id, invocation, created_at, last_attempt_at, next_attempt_at, attempts, blacklisted, processed, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.id.as_str(),
            entry.unique_request_id,
            invocation,
            entry.created_at.timestamp_millis(),
            entry.last_attempt_at.map(|at| at.timestamp_millis()),
            entry.next_attempt_at.timestamp_millis(),
            entry.attempts,
            entry.blacklisted,
            entry.processed,
            entry.version,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, Some(message)))
            if err.code == ErrorCode::ConstraintViolation
                && message.contains("unique_request_id") =>
        {
            Err(DatabaseError::Duplicate(
                entry.unique_request_id.clone().unwrap_or_default(),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// Get an entry by ID.
pub fn get_entry(conn: &Connection, id: &EntryId) -> DatabaseResult<Option<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, unique_request_id, invocation, created_at, last_attempt_at, next_attempt_at, attempts, blacklisted, processed, version
         FROM outbox_entries WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id.as_str()], entry_from_row);

    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write an entry's mutable fields if the stored version still matches.
/// Returns the new version.
pub fn update_entry(conn: &Connection, entry: &OutboxEntry) -> DatabaseResult<i64> {
    let changed = conn.execute(
        "UPDATE outbox_entries
         SET last_attempt_at = ?1, next_attempt_at = ?2, attempts = ?3, blacklisted = ?4, processed = ?5, version = version + 1
         WHERE id = ?6 AND version = ?7",
        params![
            entry.last_attempt_at.map(|at| at.timestamp_millis()),
            entry.next_attempt_at.timestamp_millis(),
            entry.attempts,
            entry.blacklisted,
            entry.processed,
            entry.id.as_str(),
            entry.version,
        ],
    )?;

    if changed == 0 {
        return Err(DatabaseError::Conflict(entry.id.to_string()));
    }
    Ok(entry.version + 1)
}

/// Delete an entry if the stored version still matches.
pub fn delete_entry(conn: &Connection, id: &EntryId, version: i64) -> DatabaseResult<()> {
    let changed = conn.execute(
        "DELETE FROM outbox_entries WHERE id = ?1 AND version = ?2",
        params![id.as_str(), version],
    )?;

    if changed == 0 {
        return Err(DatabaseError::Conflict(id.to_string()));
    }
    Ok(())
}

/// True when the entry is still pending at `version`.
pub fn is_pending_at_version(conn: &Connection, id: &EntryId, version: i64) -> DatabaseResult<bool> {
    let pending: bool = conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM outbox_entries
             WHERE id = ?1 AND version = ?2 AND processed = 0 AND blacklisted = 0
         )",
        params![id.as_str(), version],
        |row| row.get(0),
    )?;
    Ok(pending)
}

/// Clear the blacklist flag and reset attempts.
/// Returns false when the entry is missing or not blacklisted.
pub fn whitelist_entry(conn: &Connection, id: &EntryId) -> DatabaseResult<bool> {
    let changed = conn.execute(
        "UPDATE outbox_entries
         SET attempts = 0, blacklisted = 0, version = version + 1
         WHERE id = ?1 AND blacklisted = 1 AND processed = 0",
        params![id.as_str()],
    )?;
    Ok(changed == 1)
}

/// Move a pending entry's next attempt to `at`, if its version still matches.
fn reschedule_entry(
    conn: &Connection,
    id: &EntryId,
    version: i64,
    at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let mut stmt = conn.prepare_cached(
        "UPDATE outbox_entries
         SET next_attempt_at = ?1, version = version + 1
         WHERE id = ?2 AND version = ?3 AND processed = 0 AND blacklisted = 0",
    )?;
    let changed = stmt.execute(params![at.timestamp_millis(), id.as_str(), version])?;
    Ok(changed == 1)
}

// ==========================================
// Claiming
// ==========================================

/// A due row as read back from the table.
#[derive(Debug)]
pub enum DueEntry {
    Ready(OutboxEntry),
    /// The row's invocation no longer decodes, so it can never run.
    Undecodable {
        id: EntryId,
        version: i64,
        error: rusqlite::Error,
    },
}

/// List pending entries due at `now`, earliest due first.
pub fn select_due_entries(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<Vec<DueEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, unique_request_id, invocation, created_at, last_attempt_at, next_attempt_at, attempts, blacklisted, processed, version
         FROM outbox_entries
         WHERE processed = 0 AND blacklisted = 0 AND next_attempt_at <= ?1
         ORDER BY next_attempt_at ASC, created_at ASC
         LIMIT ?2",
    )?;

    let entries = stmt
        .query_map(params![now.timestamp_millis(), limit as i64], |row| {
            let id: String = row.get(0)?;
            let version: i64 = row.get(9)?;
            Ok(match entry_from_row(row) {
                Ok(entry) => DueEntry::Ready(entry),
                Err(error) => DueEntry::Undecodable {
                    id: EntryId::from_string(id),
                    version,
                    error,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Claim up to `limit` due entries, leasing each until `lease_until`.
///
/// Entries whose version moved between the select and the claim are skipped.
/// Rows that fail to decode are blacklisted in place so they stop occupying
/// the batch; the rest of the batch is still claimed.
pub fn claim_due_entries(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
    lease_until: DateTime<Utc>,
) -> DatabaseResult<Vec<OutboxEntry>> {
    let due = select_due_entries(conn, now, limit)?;
    let mut claimed = Vec::with_capacity(due.len());

    for row in due {
        let mut entry = match row {
            DueEntry::Ready(entry) => entry,
            DueEntry::Undecodable { id, version, error } => {
                if blacklist_entry(conn, &id, version)? {
                    warn!(entry_id = %id, error = %error, "Blacklisted entry that cannot be decoded");
                }
                continue;
            }
        };
        if reschedule_entry(conn, &entry.id, entry.version, lease_until)? {
            entry.version += 1;
            entry.next_attempt_at = lease_until;
            claimed.push(entry);
        } else {
            debug!(entry_id = %entry.id, "Entry claimed elsewhere, skipping");
        }
    }
    Ok(claimed)
}

fn blacklist_entry(conn: &Connection, id: &EntryId, version: i64) -> DatabaseResult<bool> {
    let mut stmt = conn.prepare_cached(
        "UPDATE outbox_entries
         SET blacklisted = 1, version = version + 1
         WHERE id = ?1 AND version = ?2 AND processed = 0 AND blacklisted = 0",
    )?;
    Ok(stmt.execute(params![id.as_str(), version])? == 1)
}

/// Give back a claim, making the entry due at `due_at`.
pub fn release_entry(
    conn: &Connection,
    id: &EntryId,
    version: i64,
    due_at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    reschedule_entry(conn, id, version, due_at)
}

// ==========================================
// Housekeeping
// ==========================================

/// Delete up to `limit` processed entries whose retention ended before `now`.
pub fn delete_processed_and_expired(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM outbox_entries WHERE id IN (
             SELECT id FROM outbox_entries
             WHERE processed = 1 AND next_attempt_at < ?1
             LIMIT ?2
         )",
        params![now.timestamp_millis(), limit as i64],
    )?;
    Ok(deleted)
}

/// Delete every processed entry whose retention ends before `before`,
/// regardless of batch size.
pub fn purge_processed(conn: &Connection, before: DateTime<Utc>) -> DatabaseResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM outbox_entries WHERE processed = 1 AND next_attempt_at < ?1",
        params![before.timestamp_millis()],
    )?;
    Ok(deleted)
}

/// Delete every entry.
pub fn clear_entries(conn: &Connection) -> DatabaseResult<usize> {
    Ok(conn.execute("DELETE FROM outbox_entries", [])?)
}

// ==========================================
// Operator queries
// ==========================================

/// List entries matching `filter`, oldest first.
pub fn list_entries(conn: &Connection, filter: &EntryFilter) -> DatabaseResult<Vec<OutboxEntry>> {
    let sql = format!(
        "SELECT id, unique_request_id, invocation, created_at, last_attempt_at, next_attempt_at, attempts, blacklisted, processed, version
         FROM outbox_entries
         WHERE {}
         ORDER BY created_at ASC, id ASC
         LIMIT ?1",
        status_clause(filter.status)
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let entries = stmt
        .query_map(params![filter.limit as i64], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Count entries per state.
pub fn count_entries(conn: &Connection) -> DatabaseResult<EntryCounts> {
    let mut stmt = conn.prepare_cached(
        "SELECT processed, blacklisted, COUNT(*) FROM outbox_entries GROUP BY processed, blacklisted",
    )?;

    let mut counts = EntryCounts::default();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, bool>(0)?, row.get::<_, bool>(1)?, row.get::<_, i64>(2)?))
    })?;
    for row in rows {
        let (processed, blacklisted, count) = row?;
        let count = count as u64;
        match (processed, blacklisted) {
            (true, _) => counts.processed += count,
            (false, true) => counts.blacklisted += count,
            (false, false) => counts.pending += count,
        }
    }
    Ok(counts)
}

/// Find an entry by its unique request id.
pub fn find_by_request_id(conn: &Connection, request_id: &str) -> DatabaseResult<Option<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, unique_request_id, invocation, created_at, last_attempt_at, next_attempt_at, attempts, blacklisted, processed, version
         FROM outbox_entries WHERE unique_request_id = ?1",
    )?;
    Ok(stmt.query_row(params![request_id], entry_from_row).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use chrono::Duration;
    use outbox_engine::{Argument, Invocation};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
    }

    fn entry(due: DateTime<Utc>) -> OutboxEntry {
        let invocation = Invocation::new(
            "Inserter",
            "insert",
            vec![Argument::Int(3), Argument::from("Whee"), Argument::Transaction],
        );
        OutboxEntry::new(invocation, None, due, due)
    }

    #[test]
    fn test_insert_and_get_round_trips_every_column() {
        let conn = setup();
        let mut original = entry(now());
        original.unique_request_id = Some("req-1".to_string());
        original.last_attempt_at = Some(original.created_at - Duration::seconds(3));
        original.attempts = 2;
        insert_entry(&conn, &original).unwrap();

        let loaded = get_entry(&conn, &original.id).unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(get_entry(&conn, &EntryId::new()).unwrap().is_none());
        assert_eq!(
            find_by_request_id(&conn, "req-1").unwrap().map(|e| e.id),
            Some(original.id)
        );
    }

    #[test]
    fn test_duplicate_request_id() {
        let conn = setup();
        let mut first = entry(now());
        first.unique_request_id = Some("req-1".to_string());
        let mut second = entry(now());
        second.unique_request_id = Some("req-1".to_string());

        insert_entry(&conn, &first).unwrap();
        let err = insert_entry(&conn, &second).unwrap_err();
        assert!(matches!(err, DatabaseError::Duplicate(id) if id == "req-1"));

        // Entries without a request id never collide.
        insert_entry(&conn, &entry(now())).unwrap();
        insert_entry(&conn, &entry(now())).unwrap();
    }

    #[test]
    fn test_update_is_version_gated() {
        let conn = setup();
        let mut stored = entry(now());
        insert_entry(&conn, &stored).unwrap();

        let stale = stored.clone();
        stored.attempts = 1;
        stored.version = update_entry(&conn, &stored).unwrap();
        assert_eq!(stored.version, 2);

        let err = update_entry(&conn, &stale).unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
        assert!(matches!(
            delete_entry(&conn, &stale.id, stale.version),
            Err(DatabaseError::Conflict(_))
        ));

        delete_entry(&conn, &stored.id, stored.version).unwrap();
        assert!(get_entry(&conn, &stored.id).unwrap().is_none());
    }

    #[test]
    fn test_claim_orders_by_due_time_and_skips_future_entries() {
        let conn = setup();
        let now = now();
        let late = entry(now);
        let early = entry(now - Duration::seconds(10));
        let future = entry(now + Duration::seconds(10));
        for e in [&late, &early, &future] {
            insert_entry(&conn, e).unwrap();
        }

        let lease = now + Duration::seconds(30);
        let claimed = claim_due_entries(&conn, now, 10, lease).unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![early.id.clone(), late.id.clone()]);
        assert!(claimed.iter().all(|e| e.version == 2 && e.next_attempt_at == lease));

        assert!(claim_due_entries(&conn, now, 10, lease).unwrap().is_empty());
        assert_eq!(get_entry(&conn, &early.id).unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_claim_respects_limit() {
        let conn = setup();
        let now = now();
        for i in 0..5 {
            insert_entry(&conn, &entry(now - Duration::seconds(i))).unwrap();
        }
        let claimed = claim_due_entries(&conn, now, 2, now + Duration::seconds(5)).unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(select_due_entries(&conn, now, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_undecodable_entry_is_blacklisted_without_blocking_the_batch() {
        let conn = setup();
        let now = now();
        let broken = entry(now - Duration::seconds(10));
        let healthy = entry(now);
        insert_entry(&conn, &broken).unwrap();
        insert_entry(&conn, &healthy).unwrap();
        // A float written as null by an older writer.
        conn.execute(
            "UPDATE outbox_entries SET invocation = ?1 WHERE id = ?2",
            params![
                r#"{"class_name":"Calc","method_name":"apply","args":[{"type":"float","value":null}]}"#,
                broken.id.as_str()
            ],
        )
        .unwrap();

        let claimed = claim_due_entries(&conn, now, 10, now + Duration::seconds(5)).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, healthy.id);

        let counts = count_entries(&conn).unwrap();
        assert_eq!(counts.blacklisted, 1);
        assert_eq!(counts.pending, 1);
        assert!(claim_due_entries(&conn, now, 10, now).unwrap().is_empty());
    }

    #[test]
    fn test_blacklisted_and_processed_are_never_due() {
        let conn = setup();
        let now = now();
        let mut blacklisted = entry(now);
        blacklisted.blacklisted = true;
        let mut processed = entry(now);
        processed.processed = true;
        insert_entry(&conn, &blacklisted).unwrap();
        insert_entry(&conn, &processed).unwrap();

        assert!(select_due_entries(&conn, now, 10).unwrap().is_empty());
        assert!(!is_pending_at_version(&conn, &blacklisted.id, 1).unwrap());
        assert!(!release_entry(&conn, &processed.id, 1, now).unwrap());
    }

    #[test]
    fn test_release_and_lock_check() {
        let conn = setup();
        let now = now();
        let stored = entry(now);
        insert_entry(&conn, &stored).unwrap();

        assert!(is_pending_at_version(&conn, &stored.id, 1).unwrap());
        assert!(release_entry(&conn, &stored.id, 1, now + Duration::seconds(1)).unwrap());
        assert!(!is_pending_at_version(&conn, &stored.id, 1).unwrap());
        assert!(!release_entry(&conn, &stored.id, 1, now).unwrap(), "stale version");
        assert!(is_pending_at_version(&conn, &stored.id, 2).unwrap());
    }

    #[test]
    fn test_whitelist_only_blacklisted() {
        let conn = setup();
        let mut stored = entry(now());
        stored.blacklisted = true;
        stored.attempts = 5;
        insert_entry(&conn, &stored).unwrap();

        assert!(whitelist_entry(&conn, &stored.id).unwrap());
        let loaded = get_entry(&conn, &stored.id).unwrap().unwrap();
        assert!(!loaded.blacklisted);
        assert_eq!(loaded.attempts, 0);
        assert_eq!(loaded.version, 2);

        assert!(!whitelist_entry(&conn, &stored.id).unwrap());
        assert!(!whitelist_entry(&conn, &EntryId::new()).unwrap());
    }

    #[test]
    fn test_expired_processed_entries_are_purged() {
        let conn = setup();
        let now = now();
        let mut expired = entry(now - Duration::seconds(1));
        expired.processed = true;
        let mut retained = entry(now + Duration::days(1));
        retained.processed = true;
        let pending = entry(now - Duration::seconds(1));
        for e in [&expired, &retained, &pending] {
            insert_entry(&conn, e).unwrap();
        }

        assert_eq!(delete_processed_and_expired(&conn, now, 10).unwrap(), 1);
        assert!(get_entry(&conn, &expired.id).unwrap().is_none());
        assert!(get_entry(&conn, &pending.id).unwrap().is_some());

        assert_eq!(purge_processed(&conn, now + Duration::days(2)).unwrap(), 1);
        assert_eq!(count_entries(&conn).unwrap().total(), 1);
    }

    #[test]
    fn test_list_and_count_by_status() {
        let conn = setup();
        let now = now();
        let mut blacklisted = entry(now);
        blacklisted.blacklisted = true;
        let mut processed = entry(now);
        processed.processed = true;
        insert_entry(&conn, &entry(now)).unwrap();
        insert_entry(&conn, &entry(now)).unwrap();
        insert_entry(&conn, &blacklisted).unwrap();
        insert_entry(&conn, &processed).unwrap();

        let counts = count_entries(&conn).unwrap();
        assert_eq!(
            counts,
            EntryCounts {
                pending: 2,
                blacklisted: 1,
                processed: 1
            }
        );

        let listed = list_entries(&conn, &EntryFilter::with_status(EntryStatus::Blacklisted)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, blacklisted.id);
        assert_eq!(list_entries(&conn, &EntryFilter::all()).unwrap().len(), 4);
        assert_eq!(list_entries(&conn, &EntryFilter::all().limit(3)).unwrap().len(), 3);

        assert_eq!(clear_entries(&conn).unwrap(), 4);
        assert_eq!(count_entries(&conn).unwrap(), EntryCounts::default());
    }
}
