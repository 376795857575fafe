use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use cashcard_core::{
    AuditEntry, AuditEntryId, Card, CardId, LedgerError, LedgerStore, PageSpec, SortDirection,
    SortKey, SortSpec, WriteOutcome, CARD_SUBJECT_TYPE,
};
use rusqlite::{params, Connection, DatabaseName, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS cards (
  card_id TEXT PRIMARY KEY,
  amount REAL NOT NULL,
  owner TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_entries (
  audit_entry_id TEXT PRIMARY KEY,
  subject_type TEXT NOT NULL CHECK (subject_type IN ('Card')),
  subject_id TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE (subject_type, subject_id),
  FOREIGN KEY (subject_id) REFERENCES cards(card_id)
);

CREATE INDEX IF NOT EXISTS idx_cards_owner_active ON cards(owner, active);
CREATE INDEX IF NOT EXISTS idx_audit_entries_subject ON audit_entries(subject_type, subject_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Outcome of the startup audit reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inactive_cards: usize,
    pub repaired_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed card ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations, then reconcile the audit trail. Runs at
    /// every startup; both steps are idempotent, so an interrupted previous
    /// run is repaired rather than repeated.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<ReconcileSummary> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        self.reconcile_audit_trail()
    }

    /// Repair the deactivation invariant: every inactive card must have
    /// exactly one audit entry. A card that went inactive without one (a
    /// crash between flip and append under a weaker engine, or external
    /// tampering) gets the missing entry appended with the current time.
    /// Cards are never reactivated here, in either direction of mismatch.
    ///
    /// # Errors
    /// Returns an error when the reconciliation queries or writes fail.
    pub fn reconcile_audit_trail(&mut self) -> Result<ReconcileSummary> {
        let tx = self.conn.transaction().context("failed to start reconciliation transaction")?;

        let inactive_cards: usize = tx
            .query_row("SELECT COUNT(*) FROM cards WHERE active = 0", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count inactive cards")?
            .try_into()
            .unwrap_or(0);

        let mut repaired_entries = 0_usize;
        {
            let mut stmt = tx.prepare(
                "SELECT card_id FROM cards
                 WHERE active = 0
                   AND card_id NOT IN (
                     SELECT subject_id FROM audit_entries WHERE subject_type = ?1
                   )
                 ORDER BY card_id ASC",
            )?;
            let rows = stmt.query_map(params![CARD_SUBJECT_TYPE], |row| row.get::<_, String>(0))?;

            for row in rows {
                let card_id = row?;
                tx.execute(
                    "INSERT INTO audit_entries(audit_entry_id, subject_type, subject_id, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        AuditEntryId::new().to_string(),
                        CARD_SUBJECT_TYPE,
                        card_id,
                        now_rfc3339()?
                    ],
                )
                .context("failed to append reconciliation audit entry")?;
                repaired_entries += 1;
            }
        }

        tx.commit().context("failed to commit reconciliation transaction")?;
        Ok(ReconcileSummary { inactive_cards, repaired_entries })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl LedgerStore for SqliteStore {
    fn get_card(&mut self, id: CardId) -> Result<Option<Card>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT card_id, amount, owner, active FROM cards WHERE card_id = ?1")
            .map_err(ledger_err)?;
        stmt.query_row(params![id.to_string()], card_from_row)
            .optional()
            .map_err(ledger_err)
    }

    fn insert_card(&mut self, card: &Card) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "INSERT INTO cards(card_id, amount, owner, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    card.id.to_string(),
                    card.amount,
                    card.owner,
                    i64::from(card.active),
                    now_rfc3339().map_err(|err| LedgerError::Storage(err.to_string()))?
                ],
            )
            .map_err(ledger_err)?;
        Ok(())
    }

    fn find_by_owner(
        &mut self,
        owner: &str,
        page: &PageSpec,
        sort: &SortSpec,
    ) -> Result<Vec<Card>, LedgerError> {
        // The ordering fragment comes from a closed enum, never caller text.
        let query = format!(
            "SELECT card_id, amount, owner, active FROM cards
             WHERE owner = ?1 AND active = 1
             ORDER BY {} LIMIT ?2 OFFSET ?3",
            order_by_fragment(sort)
        );
        let mut stmt = self.conn.prepare(&query).map_err(ledger_err)?;
        let rows = stmt
            .query_map(
                params![owner, i64::from(page.size), i64::try_from(page.offset()).unwrap_or(i64::MAX)],
                card_from_row,
            )
            .map_err(ledger_err)?;

        let mut cards = Vec::new();
        for row in rows {
            cards.push(row.map_err(ledger_err)?);
        }
        Ok(cards)
    }

    fn update_amount(
        &mut self,
        id: CardId,
        owner: &str,
        amount: f64,
    ) -> Result<WriteOutcome, LedgerError> {
        // Compare-and-set: the WHERE clause re-checks visibility at commit
        // time, so a row won by a concurrent deactivation is simply missed.
        let affected = self
            .conn
            .execute(
                "UPDATE cards SET amount = ?1
                 WHERE card_id = ?2 AND owner = ?3 AND active = 1",
                params![amount, id.to_string(), owner],
            )
            .map_err(ledger_err)?;

        if affected == 0 {
            Ok(WriteOutcome::NotVisible)
        } else {
            Ok(WriteOutcome::Applied)
        }
    }

    fn deactivate_with_audit(
        &mut self,
        id: CardId,
        owner: &str,
        entry: &AuditEntry,
    ) -> Result<WriteOutcome, LedgerError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| LedgerError::Storage(err.to_string()))?;

        let affected = tx
            .execute(
                "UPDATE cards SET active = 0
                 WHERE card_id = ?1 AND owner = ?2 AND active = 1",
                params![id.to_string(), owner],
            )
            .map_err(ledger_err)?;

        if affected == 0 {
            // Nothing flipped, so nothing to audit; the transaction is
            // dropped unfinished and rolls back.
            return Ok(WriteOutcome::NotVisible);
        }

        tx.execute(
            "INSERT INTO audit_entries(audit_entry_id, subject_type, subject_id, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id.to_string(),
                entry.subject_type,
                entry.subject_id.to_string(),
                rfc3339(entry.recorded_at).map_err(|err| LedgerError::Storage(err.to_string()))?
            ],
        )
        .map_err(ledger_err)?;

        tx.commit()
            .map_err(|err| LedgerError::Storage(err.to_string()))?;
        Ok(WriteOutcome::Applied)
    }

    fn find_audit_by_subject(
        &mut self,
        subject_type: &str,
        subject_id: CardId,
    ) -> Result<Option<AuditEntry>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT audit_entry_id, subject_type, subject_id, recorded_at
                 FROM audit_entries
                 WHERE subject_type = ?1 AND subject_id = ?2",
            )
            .map_err(ledger_err)?;
        stmt.query_row(params![subject_type, subject_id.to_string()], audit_from_row)
            .optional()
            .map_err(ledger_err)
    }
}

fn order_by_fragment(sort: &SortSpec) -> &'static str {
    match (sort.key, sort.direction) {
        (SortKey::Amount, SortDirection::Asc) => "amount ASC, card_id ASC",
        (SortKey::Amount, SortDirection::Desc) => "amount DESC, card_id ASC",
        (SortKey::Id, SortDirection::Asc) => "card_id ASC",
        (SortKey::Id, SortDirection::Desc) => "card_id DESC",
    }
}

fn card_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Card> {
    let id_raw: String = row.get(0)?;
    let id = CardId::parse(&id_raw).ok_or_else(|| invalid_ulid(0, &id_raw))?;
    Ok(Card {
        id,
        amount: row.get(1)?,
        owner: row.get(2)?,
        active: row.get::<_, i64>(3)? == 1,
    })
}

fn audit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let entry_id_raw: String = row.get(0)?;
    let entry_id = AuditEntryId::parse(&entry_id_raw).ok_or_else(|| invalid_ulid(0, &entry_id_raw))?;
    let subject_id_raw: String = row.get(2)?;
    let subject_id = CardId::parse(&subject_id_raw).ok_or_else(|| invalid_ulid(2, &subject_id_raw))?;
    let recorded_at_raw: String = row.get(3)?;
    let recorded_at =
        OffsetDateTime::parse(&recorded_at_raw, &time::format_description::well_known::Rfc3339)
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;

    Ok(AuditEntry {
        id: entry_id,
        subject_type: row.get(1)?,
        subject_id,
        recorded_at,
    })
}

fn invalid_ulid(column: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid ULID in row: {raw}"),
        )),
    )
}

/// Busy and locked outcomes are retryable conflicts; everything else is a
/// plain storage fault.
fn ledger_err(err: rusqlite::Error) -> LedgerError {
    match &err {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            LedgerError::Conflict(err.to_string())
        }
        _ => LedgerError::Storage(err.to_string()),
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
