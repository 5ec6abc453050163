//! Journal entry lifecycle: create, edit, post, unpost, reverse and delete

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::posting::{PostingEngine, PostingPlan};
use crate::changeset::{commit_with_retry, Changeset};
use crate::config::LedgerConfig;
use crate::numbering::DocumentNumberAllocator;
use crate::traits::*;
use crate::types::*;

/// Fields that may change on a draft entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalEntryUpdate {
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
    pub entry_type: Option<JournalEntryType>,
    pub lines: Option<Vec<JournalLine>>,
}

/// Outcome of a post or unpost
#[derive(Debug, Clone)]
pub struct PostingOutcome {
    pub entry: JournalEntry,
    /// Ledger entries created (post) or empty (unpost)
    pub ledger_entries: Vec<LedgerEntry>,
    /// Parent accounts recomputed by the aggregation pass
    pub parents_updated: usize,
}

/// Journal manager driving the entry state machine
///
/// Every balance-affecting operation is planned against a snapshot and then
/// committed as one [`Changeset`]. When the company's revision moved in the
/// meantime the plan is discarded and rebuilt.
#[derive(Clone)]
pub struct JournalManager<S: LedgerStorage> {
    pub(crate) storage: S,
    allocator: DocumentNumberAllocator<S>,
    engine: PostingEngine,
    validator: Arc<dyn JournalValidator>,
    tolerance: BigDecimal,
    max_commit_attempts: u32,
}

impl<S: LedgerStorage + Clone> JournalManager<S> {
    /// Create a new journal manager
    pub fn new(storage: S, config: &LedgerConfig) -> Self {
        Self::with_validator(storage, config, Arc::new(DefaultJournalValidator))
    }

    /// Create a new journal manager with custom validator
    pub fn with_validator(
        storage: S,
        config: &LedgerConfig,
        validator: Arc<dyn JournalValidator>,
    ) -> Self {
        Self {
            allocator: DocumentNumberAllocator::new(storage.clone(), config),
            storage,
            engine: PostingEngine::new(config.aggregation_scope),
            validator,
            tolerance: config.balance_tolerance.clone(),
            max_commit_attempts: config.max_commit_attempts,
        }
    }
}

impl<S: LedgerStorage> JournalManager<S> {
    /// Get a journal entry by ID, returning an error if not found
    pub async fn get_entry(&self, entry_id: Uuid) -> LedgerResult<JournalEntry> {
        self.storage
            .get_journal_entry(entry_id)
            .await?
            .ok_or_else(|| LedgerError::JournalEntryNotFound(entry_id.to_string()))
    }

    pub async fn find_entry_by_number(
        &self,
        company_id: &str,
        entry_number: &str,
    ) -> LedgerResult<Option<JournalEntry>> {
        self.storage
            .find_journal_entry_by_number(company_id, entry_number)
            .await
    }

    pub async fn list_entries(
        &self,
        company_id: &str,
        filter: &JournalEntryFilter,
    ) -> LedgerResult<Vec<JournalEntry>> {
        self.storage.list_journal_entries(company_id, filter).await
    }

    /// Ledger entries produced by a posted journal entry
    pub async fn ledger_entries(&self, entry_id: Uuid) -> LedgerResult<Vec<LedgerEntry>> {
        self.storage.list_journal_ledger_entries(entry_id).await
    }

    /// Store a new draft entry under a reserved number and mark the number used
    #[instrument(
        skip_all,
        fields(company_id = %entry.company_id, entry_number = %entry.entry_number)
    )]
    pub async fn create_entry(&self, mut entry: JournalEntry) -> LedgerResult<JournalEntry> {
        if entry.status != JournalEntryStatus::Draft {
            return Err(LedgerError::Validation(format!(
                "New journal entries start as draft, got {}",
                entry.status
            )));
        }
        entry.refresh_totals();
        self.validator.validate_entry(&entry, &self.tolerance)?;

        if self
            .storage
            .find_journal_entry_by_number(&entry.company_id, &entry.entry_number)
            .await?
            .is_some()
        {
            return Err(LedgerError::Conflict(format!(
                "Journal entry number {} already exists",
                entry.entry_number
            )));
        }

        let mut reservation = self
            .storage
            .find_active_reservation(&entry.company_id, &entry.entry_number)
            .await?
            .filter(|r| r.status == ReservationStatus::Reserved)
            .ok_or_else(|| {
                LedgerError::Validation(format!(
                    "Number {} is not a reserved document number",
                    entry.entry_number
                ))
            })?;
        reservation.mark_used(entry.id)?;
        entry.document_type_id = entry.document_type_id.or(Some(reservation.document_type_id));

        let mut changeset = Changeset::new(entry.company_id.clone());
        changeset.put_journal_entry(entry.clone());
        changeset.put_reservation(reservation);
        self.storage.commit(changeset).await?;

        info!(entry_id = %entry.id, "Journal entry created");
        Ok(entry)
    }

    /// Edit a draft entry
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn update_entry(
        &self,
        entry_id: Uuid,
        update: JournalEntryUpdate,
    ) -> LedgerResult<JournalEntry> {
        let entry = commit_with_retry(&self.storage, self.max_commit_attempts, "update", move || {
            self.plan_update(entry_id, update.clone())
        })
        .await?;
        info!(entry_number = %entry.entry_number, "Journal entry updated");
        Ok(entry)
    }

    async fn plan_update(
        &self,
        entry_id: Uuid,
        update: JournalEntryUpdate,
    ) -> LedgerResult<(Changeset, JournalEntry)> {
        let (revision, mut entry) = self.snapshot_entry(entry_id).await?;
        entry.require_status(JournalEntryStatus::Draft, "update")?;

        if let Some(date) = update.date {
            entry.date = date;
        }
        if let Some(description) = update.description {
            entry.description = description;
        }
        if let Some(entry_type) = update.entry_type {
            entry.entry_type = entry_type;
        }
        if let Some(lines) = update.lines {
            entry.lines = lines;
        }
        entry.refresh_totals();
        self.validator.validate_entry(&entry, &self.tolerance)?;
        entry.updated_at = chrono::Utc::now().naive_utc();

        let mut changeset = Changeset::new(entry.company_id.clone()).with_revision(revision);
        changeset.put_journal_entry(entry.clone());
        Ok((changeset, entry))
    }

    /// Create a draft duplicate of an entry under another reserved number
    #[instrument(skip_all, fields(entry_id = %entry_id, entry_number = %entry_number))]
    pub async fn copy_entry(
        &self,
        entry_id: Uuid,
        entry_number: &str,
        created_by: Option<String>,
    ) -> LedgerResult<JournalEntry> {
        let original = self.get_entry(entry_id).await?;

        let mut copy = JournalEntry::new(
            original.company_id.clone(),
            entry_number.to_string(),
            original.date,
            format!("COPY - {}", original.description),
            original.lines.clone(),
        );
        copy.entry_type = original.entry_type;
        copy.created_by = created_by;

        self.create_entry(copy).await
    }

    /// Remove a draft entry; its number stays consumed
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn delete_entry(&self, entry_id: Uuid) -> LedgerResult<JournalEntry> {
        let entry = commit_with_retry(&self.storage, self.max_commit_attempts, "delete", move || {
            self.plan_delete(entry_id)
        })
        .await?;
        info!(entry_number = %entry.entry_number, "Journal entry deleted");
        Ok(entry)
    }

    async fn plan_delete(&self, entry_id: Uuid) -> LedgerResult<(Changeset, JournalEntry)> {
        let (revision, entry) = self.snapshot_entry(entry_id).await?;
        entry.require_status(JournalEntryStatus::Draft, "delete")?;

        let mut changeset = Changeset::new(entry.company_id.clone()).with_revision(revision);
        changeset.deleted_journal_entries.push(entry.id);
        Ok((changeset, entry))
    }

    /// Post a draft entry: write ledger entries, move leaf balances and
    /// re-aggregate parents in one unit of work
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn post_entry(&self, entry_id: Uuid) -> LedgerResult<PostingOutcome> {
        let outcome = commit_with_retry(&self.storage, self.max_commit_attempts, "post", move || {
            self.plan_post(entry_id)
        })
        .await?;
        info!(
            entry_number = %outcome.entry.entry_number,
            ledger_entries = outcome.ledger_entries.len(),
            parents_updated = outcome.parents_updated,
            "Journal entry posted"
        );
        Ok(outcome)
    }

    async fn plan_post(&self, entry_id: Uuid) -> LedgerResult<(Changeset, PostingOutcome)> {
        let (revision, mut entry) = self.snapshot_entry(entry_id).await?;
        entry.require_status(JournalEntryStatus::Draft, "post")?;
        entry.refresh_totals();
        self.validator.validate_entry(&entry, &self.tolerance)?;

        let plan = self.engine.plan_post(&self.storage, &entry, revision).await?;
        entry.transition(JournalEntryStatus::Posted)?;

        let PostingPlan {
            mut changeset,
            ledger_entries,
            corrections,
            ..
        } = plan;
        changeset.put_journal_entry(entry.clone());
        self.stage_mark_used(&mut changeset, &entry).await?;

        Ok((
            changeset,
            PostingOutcome {
                entry,
                ledger_entries,
                parents_updated: corrections.len(),
            },
        ))
    }

    /// Return a posted entry to draft, removing its ledger entries
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn unpost_entry(&self, entry_id: Uuid) -> LedgerResult<PostingOutcome> {
        let outcome = commit_with_retry(&self.storage, self.max_commit_attempts, "unpost", move || {
            self.plan_unpost(entry_id)
        })
        .await?;
        info!(
            entry_number = %outcome.entry.entry_number,
            parents_updated = outcome.parents_updated,
            "Journal entry unposted"
        );
        Ok(outcome)
    }

    async fn plan_unpost(&self, entry_id: Uuid) -> LedgerResult<(Changeset, PostingOutcome)> {
        let (revision, mut entry) = self.snapshot_entry(entry_id).await?;
        entry.require_status(JournalEntryStatus::Posted, "unpost")?;

        let plan = self.engine.plan_unpost(&self.storage, &entry, revision).await?;
        entry.transition(JournalEntryStatus::Draft)?;

        let mut changeset = plan.changeset;
        changeset.put_journal_entry(entry.clone());
        Ok((
            changeset,
            PostingOutcome {
                entry,
                ledger_entries: Vec::new(),
                parents_updated: plan.corrections.len(),
            },
        ))
    }

    /// Reverse a posted entry with a new, immediately posted mirror entry.
    ///
    /// The reversal takes a number from the original's document type when it
    /// has one, otherwise `REV-{original number}`. Returns the reversal.
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn reverse_entry(
        &self,
        entry_id: Uuid,
        date: Option<NaiveDate>,
        created_by: Option<String>,
    ) -> LedgerResult<JournalEntry> {
        let original = self.get_entry(entry_id).await?;
        original.require_status(JournalEntryStatus::Posted, "reverse")?;

        let allocated = match original.document_type_id {
            Some(document_type_id) => Some(
                self.allocator
                    .allocate(&original.company_id, document_type_id, created_by.clone())
                    .await?,
            ),
            None => None,
        };
        let number = allocated
            .as_ref()
            .map(|a| a.number.clone())
            .unwrap_or_else(|| format!("REV-{}", original.entry_number));
        let reservation_id = allocated.and_then(|a| a.reservation_id);

        let reversal_id = Uuid::new_v4();
        let date = date.unwrap_or_else(|| chrono::Utc::now().date_naive());
        let result = commit_with_retry(&self.storage, self.max_commit_attempts, "reverse", move || {
            self.plan_reverse(
                entry_id,
                reversal_id,
                number.clone(),
                date,
                created_by.clone(),
                reservation_id,
            )
        })
        .await;

        match result {
            Ok(reversal) => {
                info!(
                    entry_number = %original.entry_number,
                    reversal_number = %reversal.entry_number,
                    "Journal entry reversed"
                );
                Ok(reversal)
            }
            Err(e) => {
                if let Some(reservation_id) = reservation_id {
                    if let Err(cancel_error) = self.allocator.cancel(reservation_id).await {
                        warn!(error = %cancel_error, "Could not release reversal number");
                    }
                }
                Err(e)
            }
        }
    }

    async fn plan_reverse(
        &self,
        entry_id: Uuid,
        reversal_id: Uuid,
        number: String,
        date: NaiveDate,
        created_by: Option<String>,
        reservation_id: Option<Uuid>,
    ) -> LedgerResult<(Changeset, JournalEntry)> {
        let (revision, mut original) = self.snapshot_entry(entry_id).await?;
        original.require_status(JournalEntryStatus::Posted, "reverse")?;

        let lines = original
            .lines
            .iter()
            .map(|line| {
                let mut mirrored = line.swapped();
                mirrored.description = format!("REV: {}", line.description);
                mirrored.reference = Some(format!(
                    "REV-{}",
                    line.reference.as_deref().unwrap_or(&original.entry_number)
                ));
                mirrored
            })
            .collect();

        let mut reversal = JournalEntry::new(
            original.company_id.clone(),
            number,
            date,
            format!("REVERSAL: {}", original.description),
            lines,
        );
        reversal.id = reversal_id;
        reversal.entry_type = original.entry_type;
        reversal.document_type_id = original.document_type_id;
        reversal.reversal_of = Some(original.id);
        reversal.created_by = created_by;
        self.validator.validate_entry(&reversal, &self.tolerance)?;

        let plan = self.engine.plan_post(&self.storage, &reversal, revision).await?;
        reversal.transition(JournalEntryStatus::Posted)?;
        original.transition(JournalEntryStatus::Reversed)?;
        original.reversed_by = Some(reversal.id);

        let mut changeset = plan.changeset;
        changeset.put_journal_entry(original);
        changeset.put_journal_entry(reversal.clone());
        if let Some(reservation_id) = reservation_id {
            let mut reservation = self.allocator.get_reservation(reservation_id).await?;
            if reservation.mark_used(reversal.id)? {
                changeset.put_reservation(reservation);
            }
        }

        Ok((changeset, reversal))
    }

    /// Read the company revision, then the entry, so a concurrent write to the
    /// entry after this point always moves the revision
    async fn snapshot_entry(&self, entry_id: Uuid) -> LedgerResult<(u64, JournalEntry)> {
        let company_id = self.get_entry(entry_id).await?.company_id;
        let revision = self.storage.company_revision(&company_id).await?;
        let entry = self.get_entry(entry_id).await?;
        Ok((revision, entry))
    }

    /// Mark the entry's reservation used if it is not already
    async fn stage_mark_used(
        &self,
        changeset: &mut Changeset,
        entry: &JournalEntry,
    ) -> LedgerResult<()> {
        let reservation = self
            .storage
            .find_active_reservation(&entry.company_id, &entry.entry_number)
            .await?;
        if let Some(mut reservation) = reservation {
            if reservation.mark_used(entry.id)? {
                changeset.put_reservation(reservation);
            }
        }
        Ok(())
    }
}

/// Builder for journal entries
#[derive(Debug)]
pub struct JournalEntryBuilder {
    entry: JournalEntry,
}

impl JournalEntryBuilder {
    /// Create a new builder for a draft entry
    pub fn new(
        company_id: impl Into<String>,
        entry_number: impl Into<String>,
        date: NaiveDate,
        description: impl Into<String>,
    ) -> Self {
        Self {
            entry: JournalEntry::new(
                company_id.into(),
                entry_number.into(),
                date,
                description.into(),
                Vec::new(),
            ),
        }
    }

    pub fn entry_type(mut self, entry_type: JournalEntryType) -> Self {
        self.entry.entry_type = entry_type;
        self
    }

    pub fn document_type(mut self, document_type_id: Uuid) -> Self {
        self.entry.document_type_id = Some(document_type_id);
        self
    }

    pub fn created_by(mut self, user: impl Into<String>) -> Self {
        self.entry.created_by = Some(user.into());
        self
    }

    /// Add a debit line
    pub fn debit(
        mut self,
        account_code: impl Into<String>,
        amount: BigDecimal,
        description: impl Into<String>,
    ) -> Self {
        self.entry
            .lines
            .push(JournalLine::debit(account_code, amount, description));
        self
    }

    /// Add a credit line
    pub fn credit(
        mut self,
        account_code: impl Into<String>,
        amount: BigDecimal,
        description: impl Into<String>,
    ) -> Self {
        self.entry
            .lines
            .push(JournalLine::credit(account_code, amount, description));
        self
    }

    /// Add a custom line
    pub fn line(mut self, line: JournalLine) -> Self {
        self.entry.lines.push(line);
        self
    }

    /// Build the entry, checking lines and balance at the standard tolerance
    pub fn build(mut self) -> LedgerResult<JournalEntry> {
        self.entry.refresh_totals();
        self.entry
            .validate(&LedgerConfig::default().balance_tolerance)?;
        Ok(self.entry)
    }
}

/// Common journal entry patterns
pub mod patterns {
    use super::*;
    use crate::utils::validation::validate_positive_amount;

    /// Pay an expense from cash (debit expense, credit cash)
    pub fn expense_payment(
        company_id: &str,
        entry_number: &str,
        date: NaiveDate,
        description: &str,
        expense_code: &str,
        cash_code: &str,
        amount: BigDecimal,
    ) -> LedgerResult<JournalEntry> {
        validate_positive_amount(&amount)?;
        JournalEntryBuilder::new(company_id, entry_number, date, description)
            .debit(expense_code, amount.clone(), description)
            .credit(cash_code, amount, description)
            .build()
    }

    /// Record a cash sale (debit cash, credit income)
    pub fn cash_sale(
        company_id: &str,
        entry_number: &str,
        date: NaiveDate,
        description: &str,
        cash_code: &str,
        income_code: &str,
        amount: BigDecimal,
    ) -> LedgerResult<JournalEntry> {
        validate_positive_amount(&amount)?;
        JournalEntryBuilder::new(company_id, entry_number, date, description)
            .debit(cash_code, amount.clone(), description)
            .credit(income_code, amount, description)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::account::{utils::create_standard_chart, AccountManager};
    use crate::utils::memory_storage::MemoryStorage;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    async fn setup() -> (JournalManager<MemoryStorage>, MemoryStorage, JournalEntry) {
        let storage = MemoryStorage::new();
        let config = LedgerConfig::default();
        create_standard_chart(&AccountManager::new(storage.clone(), &config), "acme")
            .await
            .unwrap();
        let journal = JournalManager::new(storage.clone(), &config);
        let doc = journal
            .allocator
            .create_document_type("acme", "CE", "Egreso", None)
            .await
            .unwrap();
        let number = journal.allocator.allocate("acme", doc.id, None).await.unwrap();
        let entry = patterns::expense_payment(
            "acme",
            &number.number,
            date(),
            "Rent",
            "50101",
            "10101",
            BigDecimal::from(100),
        )
        .unwrap();
        let entry = journal.create_entry(entry).await.unwrap();
        (journal, storage, entry)
    }

    #[tokio::test]
    async fn test_post_planned_before_delete_is_rejected() {
        let (journal, storage, entry) = setup().await;
        let (stale, _) = journal.plan_post(entry.id).await.unwrap();

        journal.delete_entry(entry.id).await.unwrap();

        let err = storage.commit(stale).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(storage.get_journal_entry(entry.id).await.unwrap().is_none());
        assert_eq!(storage.ledger_entry_count().unwrap(), 0);

        let err = journal.post_entry(entry.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_update_planned_before_post_is_rejected() {
        let (journal, storage, entry) = setup().await;
        let update = JournalEntryUpdate {
            description: Some("Rent, corrected".to_string()),
            ..Default::default()
        };
        let (stale, _) = journal.plan_update(entry.id, update.clone()).await.unwrap();

        journal.post_entry(entry.id).await.unwrap();

        let err = storage.commit(stale).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let stored = journal.get_entry(entry.id).await.unwrap();
        assert_eq!(stored.status, JournalEntryStatus::Posted);
        assert_eq!(stored.description, "Rent");

        let err = journal.update_entry(entry.id, update).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn test_create_cannot_use_number_cancelled_meanwhile() {
        let (journal, storage, _) = setup().await;
        let doc = journal
            .allocator
            .find_document_type_by_code("acme", "CE")
            .await
            .unwrap()
            .unwrap();
        let number = journal.allocator.allocate("acme", doc.id, None).await.unwrap();
        let reservation_id = number.reservation_id.unwrap();

        let stale = storage
            .find_active_reservation("acme", &number.number)
            .await
            .unwrap()
            .unwrap();
        journal.allocator.cancel(reservation_id).await.unwrap();

        let mut used = stale;
        used.mark_used(Uuid::new_v4()).unwrap();
        let mut changeset = Changeset::new("acme");
        changeset.put_reservation(used);
        let err = storage.commit(changeset).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let stored = journal.allocator.get_reservation(reservation_id).await.unwrap();
        assert_eq!(stored.status, ReservationStatus::Cancelled);
    }

    #[test]
    fn test_builder_computes_totals() {
        let entry = JournalEntryBuilder::new("acme", "CE-00001", date(), "Rent")
            .entry_type(JournalEntryType::Adjustment)
            .debit("50101", BigDecimal::from(250), "Rent")
            .credit("10101", BigDecimal::from(250), "Cash")
            .build()
            .unwrap();

        assert_eq!(entry.status, JournalEntryStatus::Draft);
        assert_eq!(entry.total_debit, BigDecimal::from(250));
        assert_eq!(entry.total_credit, BigDecimal::from(250));
        assert_eq!(entry.entry_type, JournalEntryType::Adjustment);
    }

    #[test]
    fn test_builder_rejects_unbalanced() {
        let err = JournalEntryBuilder::new("acme", "CE-00001", date(), "Rent")
            .debit("50101", BigDecimal::from(100), "Rent")
            .credit("10101", BigDecimal::from(90), "Cash")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_patterns() {
        let entry = patterns::expense_payment(
            "acme",
            "CE-00001",
            date(),
            "Office supplies",
            "50101",
            "10101",
            BigDecimal::from(100),
        )
        .unwrap();
        assert_eq!(entry.lines.len(), 2);
        assert_eq!(entry.lines[0].debit, BigDecimal::from(100));
        assert_eq!(entry.lines[1].credit, BigDecimal::from(100));

        let zero = patterns::cash_sale(
            "acme",
            "CI-00001",
            date(),
            "Nothing sold",
            "10101",
            "401",
            BigDecimal::from(0),
        );
        assert!(zero.is_err());
    }
}
