#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use achievement_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, sort_history, sort_references, AchievementDetail,
    AchievementReference, AchievementStatus, Attachment, DetailId, DetailPatch, DetailStore,
    NewAchievement, NewStatusHistoryEntry, ReferenceFilter, ReferenceId, ReferenceStore,
    StatusChange, StatusCounts, StatusHistoryEntry, StatusHistoryRecorder, StatusWrite, StudentId,
    UserId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;
use uuid::Uuid;

const REFERENCE_MIGRATION_VERSION: i64 = 1;
const DETAIL_MIGRATION_VERSION: i64 = 1;

const SCHEMA_REFERENCES_V1: &str = r"
CREATE TABLE IF NOT EXISTS students (
  student_id TEXT PRIMARY KEY,
  advisor_id TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS achievement_references (
  reference_id TEXT PRIMARY KEY,
  student_id TEXT NOT NULL,
  detail_id TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL CHECK (
    status IN ('draft', 'submitted', 'verified', 'rejected', 'deleted')
  ),
  submitted_at TEXT,
  verified_at TEXT,
  verified_by TEXT,
  rejection_note TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (
    status <> 'rejected'
    OR (rejection_note IS NOT NULL AND length(trim(rejection_note)) > 0)
  ),
  CHECK (
    status NOT IN ('verified', 'rejected')
    OR (verified_by IS NOT NULL AND verified_at IS NOT NULL)
  )
);

CREATE INDEX IF NOT EXISTS idx_achievement_references_student
  ON achievement_references(student_id, status);
CREATE INDEX IF NOT EXISTS idx_achievement_references_status
  ON achievement_references(status);

CREATE TABLE IF NOT EXISTS achievement_status_history (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  reference_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN ('draft', 'submitted', 'verified', 'rejected', 'deleted')
  ),
  note TEXT NOT NULL DEFAULT '',
  actor TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_achievement_status_history_no_update
BEFORE UPDATE ON achievement_status_history
BEGIN
  SELECT RAISE(FAIL, 'achievement_status_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_achievement_status_history_no_delete
BEFORE DELETE ON achievement_status_history
BEGIN
  SELECT RAISE(FAIL, 'achievement_status_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_achievement_status_history_reference
  ON achievement_status_history(reference_id, seq);
";

const SCHEMA_DETAILS_V1: &str = r"
CREATE TABLE IF NOT EXISTS achievement_details (
  detail_id TEXT PRIMARY KEY CHECK (length(detail_id) = 24),
  student_id TEXT NOT NULL,
  document_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_achievement_details_student
  ON achievement_details(student_id);
";

const REFERENCE_COLUMNS: &str = "reference_id, student_id, detail_id, status,
    submitted_at, verified_at, verified_by, rejection_note, created_at, updated_at";

const HISTORY_COLUMNS: &str = "seq, entry_id, reference_id, status, note, actor, recorded_at";

/// Relational side of the achievement split: workflow status, ownership,
/// the student/advisor relation and the status audit trail.
pub struct SqliteReferenceStore {
    conn: Connection,
}

impl SqliteReferenceStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        ensure_schema_migrations(&self.conn)?;

        // An identity schema may already own `students`; reuse it when it has what we join on.
        if table_exists(&self.conn, "students")? {
            ensure_table_has_columns(&self.conn, "students", &["student_id", "advisor_id"])?;
        }

        self.conn
            .execute_batch(SCHEMA_REFERENCES_V1)
            .context("failed to apply achievement reference schema")?;

        register_migration(&self.conn, REFERENCE_MIGRATION_VERSION)
    }

    /// Sets or clears the advisor of a student.
    pub fn assign_advisor(&self, student_id: &StudentId, advisor_id: Option<&UserId>) -> Result<()> {
        let now = sql_timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO students(student_id, advisor_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(student_id) DO UPDATE SET
                   advisor_id = excluded.advisor_id,
                   updated_at = excluded.updated_at",
                params![student_id.as_str(), advisor_id.map(UserId::as_str), now],
            )
            .with_context(|| format!("failed to assign advisor for student {student_id}"))?;

        debug!(student_id = %student_id, advisor_id = ?advisor_id.map(UserId::as_str), "advisor assigned");
        Ok(())
    }

    pub fn advisor_of(&self, student_id: &StudentId) -> Result<Option<UserId>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT advisor_id FROM students WHERE student_id = ?1",
                params![student_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query student advisor")?;

        raw.flatten()
            .map(|value| UserId::parse(&value).map_err(|err| anyhow!(err.to_string())))
            .transpose()
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StatusHistoryRecorder for SqliteReferenceStore {
    fn append_history(&self, entry: &NewStatusHistoryEntry) -> Result<StatusHistoryEntry> {
        insert_history(&self.conn, entry)
    }

    fn list_history(&self, reference_id: ReferenceId) -> Result<Vec<StatusHistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS}
             FROM achievement_status_history
             WHERE reference_id = ?1
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![reference_id.to_string()], parse_history_row)?;

        let mut entries = collect_rows(rows)?;
        sort_history(&mut entries);
        Ok(entries)
    }
}

impl ReferenceStore for SqliteReferenceStore {
    fn create(
        &self,
        student_id: &StudentId,
        detail_id: &DetailId,
        actor: Option<&UserId>,
    ) -> Result<AchievementReference> {
        let now = now_utc();
        let reference =
            AchievementReference::draft(ReferenceId::new(), student_id.clone(), detail_id.clone(), now);

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start reference create transaction")?;

        tx.execute(
            "INSERT INTO achievement_references(
                reference_id, student_id, detail_id, status,
                submitted_at, verified_at, verified_by, rejection_note,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, NULL, ?5, ?5)",
            params![
                reference.id.to_string(),
                reference.student_id.as_str(),
                reference.detail_id.as_str(),
                reference.status.as_str(),
                sql_timestamp(now)?,
            ],
        )
        .context("failed to insert achievement reference")?;

        insert_history(
            &tx,
            &NewStatusHistoryEntry {
                reference_id: reference.id,
                status: AchievementStatus::Draft,
                note: String::new(),
                actor: actor.cloned(),
                recorded_at: now,
            },
        )?;

        tx.commit()
            .context("failed to commit reference create transaction")?;

        debug!(reference_id = %reference.id, detail_id = %reference.detail_id, "reference created");
        Ok(reference)
    }

    fn get(&self, id: ReferenceId) -> Result<Option<AchievementReference>> {
        select_reference(&self.conn, id)
    }

    fn list(&self, filter: &ReferenceFilter) -> Result<Vec<AchievementReference>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REFERENCE_COLUMNS}
             FROM achievement_references
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR student_id = ?2)
               AND (?1 IS NOT NULL OR ?3 = 1 OR status <> 'deleted')"
        ))?;
        let (status, student_id, include_deleted) = filter_values(filter);
        let rows = stmt.query_map(
            params![status, student_id, include_deleted],
            parse_reference_row,
        )?;

        let mut references = collect_rows(rows)?;
        sort_references(&mut references);
        Ok(references)
    }

    fn list_for_advisor(&self, advisor_id: &UserId) -> Result<Vec<AchievementReference>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.reference_id, r.student_id, r.detail_id, r.status,
                    r.submitted_at, r.verified_at, r.verified_by, r.rejection_note,
                    r.created_at, r.updated_at
             FROM achievement_references r
             JOIN students s ON s.student_id = r.student_id
             WHERE s.advisor_id = ?1 AND r.status <> 'deleted'",
        )?;
        let rows = stmt.query_map(params![advisor_id.as_str()], parse_reference_row)?;

        let mut references = collect_rows(rows)?;
        sort_references(&mut references);
        Ok(references)
    }

    fn update_status(&self, change: &StatusChange) -> Result<StatusWrite> {
        // IMMEDIATE takes the write lock up front so the status check and the
        // update cannot interleave with another writer.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start status transaction")?;

        let current_raw: Option<String> = tx
            .query_row(
                "SELECT status FROM achievement_references WHERE reference_id = ?1",
                params![change.reference_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read current status")?;

        let Some(current_raw) = current_raw else {
            return Ok(StatusWrite::NotFound);
        };
        let current = AchievementStatus::parse(&current_raw)
            .ok_or_else(|| anyhow!("invalid stored status: {current_raw}"))?;
        if current != change.expected {
            debug!(
                reference_id = %change.reference_id,
                expected = %change.expected,
                current = %current,
                "status compare-and-set lost"
            );
            return Ok(StatusWrite::Conflict(current));
        }

        tx.execute(
            "UPDATE achievement_references
             SET status = ?2,
                 submitted_at = ?3,
                 verified_at = ?4,
                 verified_by = ?5,
                 rejection_note = ?6,
                 updated_at = ?7
             WHERE reference_id = ?1 AND status = ?8",
            params![
                change.reference_id.to_string(),
                change.status.as_str(),
                change.submitted_at.map(sql_timestamp).transpose()?,
                change.verified_at.map(sql_timestamp).transpose()?,
                change.verified_by.as_ref().map(UserId::as_str),
                change.rejection_note,
                sql_timestamp(change.changed_at)?,
                change.expected.as_str(),
            ],
        )
        .context("failed to update achievement status")?;

        insert_history(&tx, &change.history_entry())?;

        let updated = select_reference(&tx, change.reference_id)?
            .ok_or_else(|| anyhow!("reference {} vanished during update", change.reference_id))?;

        tx.commit().context("failed to commit status transaction")?;

        debug!(
            reference_id = %change.reference_id,
            from = %change.expected,
            to = %change.status,
            "status updated"
        );
        Ok(StatusWrite::Applied(updated))
    }

    fn touch_updated_at(&self, id: ReferenceId, at: OffsetDateTime) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE achievement_references SET updated_at = ?2 WHERE reference_id = ?1",
                params![id.to_string(), sql_timestamp(at)?],
            )
            .context("failed to touch reference updated_at")?;
        Ok(changed > 0)
    }

    fn delete(&self, id: ReferenceId, expected: AchievementStatus) -> Result<StatusWrite> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start delete transaction")?;

        let Some(current) = select_reference(&tx, id)? else {
            return Ok(StatusWrite::NotFound);
        };
        if current.status != expected {
            debug!(
                reference_id = %id,
                expected = %expected,
                current = %current.status,
                "delete compare-and-set lost"
            );
            return Ok(StatusWrite::Conflict(current.status));
        }

        tx.execute(
            "DELETE FROM achievement_references WHERE reference_id = ?1 AND status = ?2",
            params![id.to_string(), expected.as_str()],
        )
        .context("failed to delete achievement reference")?;
        tx.commit().context("failed to commit delete transaction")?;

        debug!(reference_id = %id, status = %expected, "reference deleted");
        Ok(StatusWrite::Applied(current))
    }

    fn status_counts(&self, filter: &ReferenceFilter) -> Result<StatusCounts> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*)
             FROM achievement_references
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR student_id = ?2)
               AND (?1 IS NOT NULL OR ?3 = 1 OR status <> 'deleted')
             GROUP BY status",
        )?;
        let (status, student_id, include_deleted) = filter_values(filter);
        let mut rows = stmt.query(params![status, student_id, include_deleted])?;

        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let status = AchievementStatus::parse(&raw)
                .ok_or_else(|| anyhow!("invalid stored status: {raw}"))?;
            let count = u64::try_from(count).with_context(|| format!("invalid count: {count}"))?;
            counts.record(status, count);
        }
        Ok(counts)
    }
}

/// Document side of the split: one JSON document per detail id, kept in its
/// own database so it shares no transaction with the reference store.
pub struct SqliteDetailStore {
    conn: Connection,
}

impl SqliteDetailStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        ensure_schema_migrations(&self.conn)?;
        self.conn
            .execute_batch(SCHEMA_DETAILS_V1)
            .context("failed to apply achievement detail schema")?;
        register_migration(&self.conn, DETAIL_MIGRATION_VERSION)
    }

    /// Read-modify-write of one document under the database write lock.
    fn modify(
        &self,
        id: &DetailId,
        mutate: impl FnOnce(&mut AchievementDetail, OffsetDateTime),
    ) -> Result<Option<AchievementDetail>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start detail transaction")?;

        let Some(mut detail) = select_detail(&tx, id)? else {
            return Ok(None);
        };
        mutate(&mut detail, now_utc());

        tx.execute(
            "UPDATE achievement_details
             SET document_json = ?2, updated_at = ?3
             WHERE detail_id = ?1",
            params![
                id.as_str(),
                serde_json::to_string(&detail).context("failed to serialize detail document")?,
                sql_timestamp(detail.updated_at)?,
            ],
        )
        .context("failed to write detail document")?;

        tx.commit().context("failed to commit detail transaction")?;
        Ok(Some(detail))
    }
}

impl DetailStore for SqliteDetailStore {
    fn create(&self, input: &NewAchievement) -> Result<AchievementDetail> {
        let detail = AchievementDetail::from_new(DetailId::generate(), input, now_utc());
        let created_at = sql_timestamp(detail.created_at)?;

        self.conn
            .execute(
                "INSERT INTO achievement_details(
                    detail_id, student_id, document_json, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    detail.id.as_str(),
                    detail.student_id.as_str(),
                    serde_json::to_string(&detail)
                        .context("failed to serialize detail document")?,
                    created_at,
                ],
            )
            .context("failed to insert detail document")?;

        debug!(detail_id = %detail.id, "detail created");
        Ok(detail)
    }

    fn get(&self, id: &DetailId) -> Result<Option<AchievementDetail>> {
        select_detail(&self.conn, id)
    }

    fn update(&self, id: &DetailId, patch: &DetailPatch) -> Result<Option<AchievementDetail>> {
        self.modify(id, |detail, at| patch.apply(detail, at))
    }

    fn delete(&self, id: &DetailId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM achievement_details WHERE detail_id = ?1",
                params![id.as_str()],
            )
            .context("failed to delete detail document")?;
        Ok(changed > 0)
    }

    fn append_attachment(
        &self,
        id: &DetailId,
        attachment: &Attachment,
    ) -> Result<Option<AchievementDetail>> {
        self.modify(id, |detail, at| {
            detail.attachments.push(attachment.clone());
            detail.updated_at = at;
        })
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn ensure_schema_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")
}

fn register_migration(conn: &Connection, version: i64) -> Result<()> {
    let now = sql_timestamp(now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .context("failed to register schema migration")?;
    Ok(())
}

fn insert_history(conn: &Connection, entry: &NewStatusHistoryEntry) -> Result<StatusHistoryEntry> {
    let entry_id = Ulid::new();
    conn.execute(
        "INSERT INTO achievement_status_history(
            entry_id, reference_id, status, note, actor, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry_id.to_string(),
            entry.reference_id.to_string(),
            entry.status.as_str(),
            entry.note,
            entry.actor.as_ref().map(UserId::as_str),
            sql_timestamp(entry.recorded_at)?,
        ],
    )
    .context("failed to append status history entry")?;

    Ok(StatusHistoryEntry {
        seq: conn.last_insert_rowid(),
        entry_id,
        reference_id: entry.reference_id,
        status: entry.status,
        note: entry.note.clone(),
        actor: entry.actor.clone(),
        recorded_at: entry.recorded_at,
    })
}

fn select_reference(conn: &Connection, id: ReferenceId) -> Result<Option<AchievementReference>> {
    conn.query_row(
        &format!("SELECT {REFERENCE_COLUMNS} FROM achievement_references WHERE reference_id = ?1"),
        params![id.to_string()],
        parse_reference_row,
    )
    .optional()
    .with_context(|| format!("failed to load reference {id}"))
}

fn select_detail(conn: &Connection, id: &DetailId) -> Result<Option<AchievementDetail>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT document_json FROM achievement_details WHERE detail_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to load detail {id}"))?;

    raw.map(|json| {
        serde_json::from_str::<AchievementDetail>(&json)
            .with_context(|| format!("invalid stored detail document {id}"))
    })
    .transpose()
}

fn filter_values(filter: &ReferenceFilter) -> (Option<&'static str>, Option<&str>, i64) {
    (
        filter.status.map(AchievementStatus::as_str),
        filter.student_id.as_ref().map(StudentId::as_str),
        bool_to_sql(filter.include_deleted),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn parse_reference_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AchievementReference> {
    let reference_id_raw: String = row.get(0)?;
    let student_id_raw: String = row.get(1)?;
    let detail_id_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let verified_by_raw: Option<String> = row.get(6)?;

    let reference_id = Uuid::parse_str(&reference_id_raw)
        .map(ReferenceId)
        .map_err(|_| invalid_column(0, format!("invalid reference_id: {reference_id_raw}")))?;
    let student_id = StudentId::parse(&student_id_raw)
        .map_err(|err| invalid_column(1, err.to_string()))?;
    let detail_id =
        DetailId::parse(&detail_id_raw).map_err(|err| invalid_column(2, err.to_string()))?;
    let status = AchievementStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(3, format!("invalid status: {status_raw}")))?;
    let verified_by = verified_by_raw
        .as_deref()
        .map(|raw| UserId::parse(raw).map_err(|err| invalid_column(6, err.to_string())))
        .transpose()?;

    Ok(AchievementReference {
        id: reference_id,
        student_id,
        detail_id,
        status,
        submitted_at: optional_timestamp(row, 4)?,
        verified_at: optional_timestamp(row, 5)?,
        verified_by,
        rejection_note: row.get(7)?,
        created_at: required_timestamp(row, 8)?,
        updated_at: required_timestamp(row, 9)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatusHistoryEntry> {
    let entry_id_raw: String = row.get(1)?;
    let reference_id_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let actor_raw: Option<String> = row.get(5)?;

    let entry_id = Ulid::from_string(&entry_id_raw)
        .map_err(|_| invalid_column(1, format!("invalid entry_id: {entry_id_raw}")))?;
    let reference_id = Uuid::parse_str(&reference_id_raw)
        .map(ReferenceId)
        .map_err(|_| invalid_column(2, format!("invalid reference_id: {reference_id_raw}")))?;
    let status = AchievementStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(3, format!("invalid status: {status_raw}")))?;
    let actor = actor_raw
        .as_deref()
        .map(|raw| UserId::parse(raw).map_err(|err| invalid_column(5, err.to_string())))
        .transpose()?;

    Ok(StatusHistoryEntry {
        seq: row.get(0)?,
        entry_id,
        reference_id,
        status,
        note: row.get(4)?,
        actor,
        recorded_at: required_timestamp(row, 6)?,
    })
}

fn required_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(idx, err.to_string()))
}

fn optional_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref()
        .map(|value| parse_rfc3339_utc(value).map_err(|err| invalid_column(idx, err.to_string())))
        .transpose()
}

fn sql_timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "existing schema is incompatible: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
