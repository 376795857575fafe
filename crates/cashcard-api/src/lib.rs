use std::path::{Path, PathBuf};

use anyhow::Result;
use cashcard_core::{
    AuditEntry, Card, CardId, Identity, LedgerError, LifecycleEngine, PageSpec, SortDirection,
    SortKey, SortSpec,
};
use cashcard_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Card creation input as supplied by an untrusted caller. Only the amount
/// is honored; a caller-supplied id, owner, or active flag is silently
/// dropped at deserialization because no field exists to bind it to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct CreateCardRequest {
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct UpdateCardRequest {
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
    pub repaired_audit_entries: Option<usize>,
}

/// Parse a `key,direction` sort expression such as `amount,desc`. A bare
/// key defaults to ascending; an empty expression yields the default sort.
#[must_use]
pub fn parse_sort(value: &str) -> Option<SortSpec> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(SortSpec::default());
    }

    let mut parts = trimmed.splitn(2, ',');
    let key = SortKey::parse(parts.next()?.trim())?;
    let direction = match parts.next() {
        Some(raw) => SortDirection::parse(raw.trim())?,
        None => SortDirection::Asc,
    };
    Some(SortSpec { key, direction })
}

#[derive(Debug, Clone)]
pub struct CashCardApi {
    db_path: PathBuf,
}

impl CashCardApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_engine(&self) -> Result<LifecycleEngine<SqliteStore>> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(LifecycleEngine::new(store))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations and the audit reconciliation pass, or return
    /// planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
                repaired_audit_entries: None,
            });
        }

        let planned_versions = before.pending_versions;
        let summary = store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
            repaired_audit_entries: Some(summary.repaired_entries),
        })
    }

    /// Run database health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = SqliteStore::open(&self.db_path)?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = SqliteStore::open(&self.db_path)?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the restore or post-restore migration fails.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.restore_database(in_file)
    }

    /// List the caller's active cards, sorted and paged.
    ///
    /// # Errors
    /// Returns a [`LedgerError`] from the lifecycle engine, or a storage setup error.
    pub fn list_cards(
        &self,
        identity: &Identity,
        page: &PageSpec,
        sort: &SortSpec,
    ) -> Result<Vec<Card>> {
        let mut engine = self.open_engine()?;
        engine.list(identity, page, sort).map_err(anyhow::Error::new)
    }

    /// # Errors
    /// Returns a [`LedgerError`] from the lifecycle engine, or a storage setup error.
    pub fn get_card(&self, identity: &Identity, id: CardId) -> Result<Card> {
        let mut engine = self.open_engine()?;
        engine.get(identity, id).map_err(anyhow::Error::new)
    }

    /// Create a card owned by the caller.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the amount is missing or not
    /// finite, other [`LedgerError`] variants from the engine, or a storage
    /// setup error.
    pub fn create_card(&self, identity: &Identity, input: CreateCardRequest) -> Result<Card> {
        let amount = input
            .amount
            .ok_or(LedgerError::Validation("amount MUST be provided".to_string()))?;
        let mut engine = self.open_engine()?;
        engine.create(identity, amount).map_err(anyhow::Error::new)
    }

    /// # Errors
    /// Returns a [`LedgerError`] from the lifecycle engine, or a storage setup error.
    pub fn update_card(
        &self,
        identity: &Identity,
        id: CardId,
        input: UpdateCardRequest,
    ) -> Result<Card> {
        let amount = input
            .amount
            .ok_or(LedgerError::Validation("amount MUST be provided".to_string()))?;
        let mut engine = self.open_engine()?;
        engine.update(identity, id, amount).map_err(anyhow::Error::new)
    }

    /// # Errors
    /// Returns a [`LedgerError`] from the lifecycle engine, or a storage setup error.
    pub fn deactivate_card(&self, identity: &Identity, id: CardId) -> Result<AuditEntry> {
        let mut engine = self.open_engine()?;
        engine.deactivate(identity, id).map_err(anyhow::Error::new)
    }

    /// # Errors
    /// Returns a [`LedgerError`] from the lifecycle engine, or a storage setup error.
    pub fn audit_entry(&self, identity: &Identity, subject_id: CardId) -> Result<AuditEntry> {
        let mut engine = self.open_engine()?;
        engine.audit_entry(identity, subject_id).map_err(anyhow::Error::new)
    }
}
