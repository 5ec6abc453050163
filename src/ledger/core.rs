//! Main ledger orchestrator that coordinates accounts, journal entries and numbering

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::ledger::{
    AccountLedger, AccountManager, HierarchyRepairReport, IntegrityReport, JournalEntryUpdate,
    JournalManager, NewAccount, ParentCodeBackfill, PostingOutcome,
};
use crate::numbering::{DocumentNumberAllocator, ReservationUpdate, SequenceReset};
use crate::traits::*;
use crate::types::*;

/// Main ledger system that orchestrates all posting-core operations
///
/// Cloning is cheap when the storage is; clones share the same books and can
/// be used from concurrent tasks.
#[derive(Clone)]
pub struct Ledger<S: LedgerStorage> {
    account_manager: AccountManager<S>,
    journal_manager: JournalManager<S>,
    allocator: DocumentNumberAllocator<S>,
    audit: Arc<dyn AuditSink>,
    config: LedgerConfig,
}

impl<S: LedgerStorage + Clone> Ledger<S> {
    /// Create a new ledger with the given storage backend and default settings
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, LedgerConfig::default())
    }

    /// Create a new ledger with explicit configuration
    pub fn with_config(storage: S, config: LedgerConfig) -> Self {
        Self::with_validator(storage, config, Arc::new(DefaultJournalValidator))
    }

    /// Create a new ledger with a custom journal validator
    pub fn with_validator(
        storage: S,
        config: LedgerConfig,
        validator: Arc<dyn JournalValidator>,
    ) -> Self {
        Self {
            account_manager: AccountManager::new(storage.clone(), &config),
            journal_manager: JournalManager::with_validator(storage.clone(), &config, validator),
            allocator: DocumentNumberAllocator::new(storage, &config),
            audit: Arc::new(TracingAuditSink),
            config,
        }
    }
}

impl<S: LedgerStorage> Ledger<S> {
    /// Replace the audit collaborator
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Hand an event to the audit sink; failures never reach the caller
    async fn audit(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, ?action, "Audit record failed");
        }
    }

    // Account operations
    /// Create a new account
    pub async fn create_account(
        &self,
        company_id: &str,
        new_account: NewAccount,
    ) -> LedgerResult<Account> {
        let account = self
            .account_manager
            .create_account(company_id, new_account)
            .await?;
        self.audit(AuditEvent::new(
            company_id,
            AuditAction::Create,
            "account",
            account.id,
            format!("Account {} created", account.code),
        ))
        .await;
        Ok(account)
    }

    /// Get an account by code
    pub async fn get_account(&self, company_id: &str, code: &str) -> LedgerResult<Account> {
        self.account_manager.get_account(company_id, code).await
    }

    /// List all accounts of a company
    pub async fn list_accounts(&self, company_id: &str) -> LedgerResult<Vec<Account>> {
        self.account_manager.list_accounts(company_id).await
    }

    /// Replace a leaf account's opening balance
    pub async fn set_opening_balance(
        &self,
        company_id: &str,
        code: &str,
        debit: BigDecimal,
        credit: BigDecimal,
    ) -> LedgerResult<Account> {
        let account = self
            .account_manager
            .set_opening_balance(company_id, code, debit, credit)
            .await?;
        self.audit(AuditEvent::new(
            company_id,
            AuditAction::Update,
            "account",
            account.id,
            format!(
                "Opening balance of {} set to D:{} C:{}",
                code, account.initial_debit_balance, account.initial_credit_balance
            ),
        ))
        .await;
        Ok(account)
    }

    /// Setup a small hierarchical chart of accounts
    pub async fn setup_standard_chart_of_accounts(
        &self,
        company_id: &str,
    ) -> LedgerResult<Vec<Account>> {
        crate::ledger::account::utils::create_standard_chart(&self.account_manager, company_id)
            .await
    }

    /// Movements of one account with totals
    pub async fn account_ledger(
        &self,
        company_id: &str,
        code: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> LedgerResult<AccountLedger> {
        self.account_manager
            .account_ledger(company_id, code, start_date, end_date)
            .await
    }

    /// Account ledgers of every active account
    pub async fn general_ledger(
        &self,
        company_id: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> LedgerResult<Vec<AccountLedger>> {
        self.account_manager
            .general_ledger(company_id, start_date, end_date)
            .await
    }

    // Document numbering
    /// Register a document type
    pub async fn create_document_type(
        &self,
        company_id: &str,
        code: &str,
        name: &str,
        padding: Option<usize>,
    ) -> LedgerResult<DocumentType> {
        let document_type = self
            .allocator
            .create_document_type(company_id, code, name, padding)
            .await?;
        self.audit(AuditEvent::new(
            company_id,
            AuditAction::Create,
            "document_type",
            document_type.id,
            format!("Document type {} created", document_type.code),
        ))
        .await;
        Ok(document_type)
    }

    pub async fn get_document_type(&self, document_type_id: Uuid) -> LedgerResult<DocumentType> {
        self.allocator.get_document_type(document_type_id).await
    }

    pub async fn list_document_types(&self, company_id: &str) -> LedgerResult<Vec<DocumentType>> {
        self.allocator.list_document_types(company_id).await
    }

    pub async fn find_document_type(
        &self,
        company_id: &str,
        code: &str,
    ) -> LedgerResult<Option<DocumentType>> {
        self.allocator.find_document_type_by_code(company_id, code).await
    }

    /// Reserve the next free number of a document type
    pub async fn allocate_number(
        &self,
        company_id: &str,
        document_type_id: Uuid,
        reserved_by: Option<String>,
    ) -> LedgerResult<AllocatedNumber> {
        let allocated = self
            .allocator
            .allocate(company_id, document_type_id, reserved_by)
            .await?;
        self.audit(AuditEvent::new(
            company_id,
            AuditAction::Allocate,
            "document_reservation",
            allocated.reservation_id.map(|id| id.to_string()).unwrap_or_default(),
            format!("Number {} reserved", allocated.number),
        ))
        .await;
        Ok(allocated)
    }

    /// Preview the next free number without reserving it
    pub async fn peek_next_number(&self, document_type_id: Uuid) -> LedgerResult<AllocatedNumber> {
        let document_type = self.allocator.get_document_type(document_type_id).await?;
        self.allocator
            .peek(&document_type.company_id, document_type_id)
            .await
    }

    /// Mark a reserved number used by a journal entry
    pub async fn mark_number_used(
        &self,
        company_id: &str,
        number: &str,
        journal_entry_id: Uuid,
    ) -> LedgerResult<DocumentNumberReservation> {
        self.allocator
            .mark_used(company_id, number, journal_entry_id)
            .await
    }

    /// Cancel a reserved number, making it available again
    pub async fn cancel_reservation(
        &self,
        reservation_id: Uuid,
    ) -> LedgerResult<DocumentNumberReservation> {
        let reservation = self.allocator.cancel(reservation_id).await?;
        self.audit(AuditEvent::new(
            reservation.company_id.clone(),
            AuditAction::Cancel,
            "document_reservation",
            reservation.id,
            format!("Number {} cancelled", reservation.number),
        ))
        .await;
        Ok(reservation)
    }

    /// Edit a reservation's status or number
    pub async fn update_reservation(
        &self,
        reservation_id: Uuid,
        update: ReservationUpdate,
    ) -> LedgerResult<DocumentNumberReservation> {
        let reservation = self
            .allocator
            .update_reservation(reservation_id, update)
            .await?;
        self.audit(AuditEvent::new(
            reservation.company_id.clone(),
            AuditAction::Update,
            "document_reservation",
            reservation.id,
            format!("Number {} is now {}", reservation.number, reservation.status),
        ))
        .await;
        Ok(reservation)
    }

    pub async fn list_reservations(
        &self,
        company_id: &str,
        document_type_id: Option<Uuid>,
        status: Option<ReservationStatus>,
    ) -> LedgerResult<Vec<DocumentNumberReservation>> {
        self.allocator
            .list_reservations(company_id, document_type_id, status)
            .await
    }

    /// Clear the advisory counters of every document type
    pub async fn reset_sequences(&self, company_id: &str) -> LedgerResult<Vec<SequenceReset>> {
        let resets = self.allocator.reset_sequences(company_id).await?;
        self.audit(AuditEvent::new(
            company_id,
            AuditAction::Update,
            "document_type",
            company_id,
            format!("Advisory sequences reset for {} document types", resets.len()),
        ))
        .await;
        Ok(resets)
    }

    // Journal entry operations
    /// Store a new draft entry under a reserved number
    pub async fn create_journal_entry(&self, entry: JournalEntry) -> LedgerResult<JournalEntry> {
        let entry = self.journal_manager.create_entry(entry).await?;
        self.audit(AuditEvent::new(
            entry.company_id.clone(),
            AuditAction::Create,
            "journal_entry",
            entry.id,
            format!("Journal entry {} created", entry.entry_number),
        ))
        .await;
        Ok(entry)
    }

    /// Get a journal entry by ID
    pub async fn get_journal_entry(&self, entry_id: Uuid) -> LedgerResult<JournalEntry> {
        self.journal_manager.get_entry(entry_id).await
    }

    /// Find a journal entry by number
    pub async fn find_journal_entry(
        &self,
        company_id: &str,
        entry_number: &str,
    ) -> LedgerResult<Option<JournalEntry>> {
        self.journal_manager
            .find_entry_by_number(company_id, entry_number)
            .await
    }

    /// List journal entries matching a filter
    pub async fn list_journal_entries(
        &self,
        company_id: &str,
        filter: &JournalEntryFilter,
    ) -> LedgerResult<Vec<JournalEntry>> {
        self.journal_manager.list_entries(company_id, filter).await
    }

    /// Ledger entries produced by a journal entry
    pub async fn journal_ledger_entries(&self, entry_id: Uuid) -> LedgerResult<Vec<LedgerEntry>> {
        self.journal_manager.ledger_entries(entry_id).await
    }

    /// Edit a draft entry
    pub async fn update_journal_entry(
        &self,
        entry_id: Uuid,
        update: JournalEntryUpdate,
    ) -> LedgerResult<JournalEntry> {
        let entry = self.journal_manager.update_entry(entry_id, update).await?;
        self.audit(AuditEvent::new(
            entry.company_id.clone(),
            AuditAction::Update,
            "journal_entry",
            entry.id,
            format!("Journal entry {} updated", entry.entry_number),
        ))
        .await;
        Ok(entry)
    }

    /// Copy an entry into a new draft under another reserved number
    pub async fn copy_journal_entry(
        &self,
        entry_id: Uuid,
        entry_number: &str,
        created_by: Option<String>,
    ) -> LedgerResult<JournalEntry> {
        let copy = self
            .journal_manager
            .copy_entry(entry_id, entry_number, created_by)
            .await?;
        self.audit(AuditEvent::new(
            copy.company_id.clone(),
            AuditAction::Create,
            "journal_entry",
            copy.id,
            format!("Journal entry {} copied from {}", copy.entry_number, entry_id),
        ))
        .await;
        Ok(copy)
    }

    /// Delete a draft entry
    pub async fn delete_journal_entry(&self, entry_id: Uuid) -> LedgerResult<()> {
        let entry = self.journal_manager.delete_entry(entry_id).await?;
        self.audit(AuditEvent::new(
            entry.company_id.clone(),
            AuditAction::Delete,
            "journal_entry",
            entry.id,
            format!("Journal entry {} deleted", entry.entry_number),
        ))
        .await;
        Ok(())
    }

    /// Post a draft entry
    pub async fn post_journal_entry(&self, entry_id: Uuid) -> LedgerResult<JournalEntry> {
        let PostingOutcome { entry, .. } = self.post_journal_entry_detailed(entry_id).await?;
        Ok(entry)
    }

    /// Post a draft entry and return the ledger entries it produced
    pub async fn post_journal_entry_detailed(
        &self,
        entry_id: Uuid,
    ) -> LedgerResult<PostingOutcome> {
        let outcome = self.journal_manager.post_entry(entry_id).await?;
        self.audit(AuditEvent::new(
            outcome.entry.company_id.clone(),
            AuditAction::Post,
            "journal_entry",
            outcome.entry.id,
            format!("Journal entry {} posted", outcome.entry.entry_number),
        ))
        .await;
        Ok(outcome)
    }

    /// Return a posted entry to draft
    pub async fn unpost_journal_entry(&self, entry_id: Uuid) -> LedgerResult<JournalEntry> {
        let outcome = self.journal_manager.unpost_entry(entry_id).await?;
        self.audit(AuditEvent::new(
            outcome.entry.company_id.clone(),
            AuditAction::Unpost,
            "journal_entry",
            outcome.entry.id,
            format!("Journal entry {} unposted", outcome.entry.entry_number),
        ))
        .await;
        Ok(outcome.entry)
    }

    /// Reverse a posted entry; returns the new reversal entry
    pub async fn reverse_journal_entry(
        &self,
        entry_id: Uuid,
        date: Option<NaiveDate>,
        created_by: Option<String>,
    ) -> LedgerResult<JournalEntry> {
        let reversal = self
            .journal_manager
            .reverse_entry(entry_id, date, created_by)
            .await?;
        self.audit(AuditEvent::new(
            reversal.company_id.clone(),
            AuditAction::Reverse,
            "journal_entry",
            entry_id,
            format!("Journal entry reversed by {}", reversal.entry_number),
        ))
        .await;
        Ok(reversal)
    }

    // Maintenance and integrity
    /// Recompute every parent balance of a company
    pub async fn repair_hierarchy(&self, company_id: &str) -> LedgerResult<HierarchyRepairReport> {
        let report = self.account_manager.repair_hierarchy(company_id).await?;
        self.audit(AuditEvent::new(
            company_id,
            AuditAction::Repair,
            "account",
            company_id,
            format!("Hierarchy repaired, {} parents corrected", report.corrections.len()),
        ))
        .await;
        Ok(report)
    }

    /// Write code-derived parent codes onto legacy accounts
    pub async fn backfill_parent_codes(
        &self,
        company_id: &str,
    ) -> LedgerResult<Vec<ParentCodeBackfill>> {
        let filled = self.account_manager.backfill_parent_codes(company_id).await?;
        self.audit(AuditEvent::new(
            company_id,
            AuditAction::Repair,
            "account",
            company_id,
            format!("Parent codes backfilled on {} accounts", filled.len()),
        ))
        .await;
        Ok(filled)
    }

    /// Report parent mismatches, trial balance and unbalanced posted entries
    pub async fn validate_integrity(&self, company_id: &str) -> LedgerResult<IntegrityReport> {
        self.account_manager.validate_integrity(company_id).await
    }

    /// Fail with `Integrity` unless the books are consistent
    pub async fn ensure_integrity(&self, company_id: &str) -> LedgerResult<IntegrityReport> {
        self.account_manager.ensure_integrity(company_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::journal::patterns;
    use crate::utils::memory_storage::MemoryStorage;

    #[tokio::test]
    async fn test_ledger_basic_operations() {
        let ledger = Ledger::new(MemoryStorage::new());
        ledger.setup_standard_chart_of_accounts("acme").await.unwrap();
        let doc = ledger
            .create_document_type("acme", "CI", "Comprobante de ingreso", None)
            .await
            .unwrap();

        let number = ledger.allocate_number("acme", doc.id, None).await.unwrap();
        let sale = patterns::cash_sale(
            "acme",
            &number.number,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            "Sale of goods",
            "10101",
            "401",
            BigDecimal::from(1000),
        )
        .unwrap();

        let entry = ledger.create_journal_entry(sale).await.unwrap();
        assert_eq!(entry.document_type_id, Some(doc.id));
        let posted = ledger.post_journal_entry(entry.id).await.unwrap();
        assert_eq!(posted.status, JournalEntryStatus::Posted);

        let cash = ledger.get_account("acme", "10101").await.unwrap();
        let sales = ledger.get_account("acme", "401").await.unwrap();
        let income = ledger.get_account("acme", "4").await.unwrap();
        assert_eq!(cash.current_debit_balance, BigDecimal::from(1000));
        assert_eq!(sales.current_credit_balance, BigDecimal::from(1000));
        assert_eq!(income.current_credit_balance, BigDecimal::from(1000));

        let report = ledger.ensure_integrity("acme").await.unwrap();
        assert!(report.is_consistent());

        let cash_ledger = ledger.account_ledger("acme", "10101", None, None).await.unwrap();
        assert_eq!(cash_ledger.entry_count(), 1);
        assert_eq!(cash_ledger.net_balance, BigDecimal::from(1000));
    }
}
