//! Traits for storage abstraction and extensibility

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::changeset::Changeset;
use crate::types::*;

/// Filter for listing journal entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalEntryFilter {
    pub status: Option<JournalEntryStatus>,
    pub entry_type: Option<JournalEntryType>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl JournalEntryFilter {
    /// Whether `entry` passes this filter
    pub fn matches(&self, entry: &JournalEntry) -> bool {
        self.status.is_none_or(|s| entry.status == s)
            && self.entry_type.is_none_or(|t| entry.entry_type == t)
            && self.start_date.is_none_or(|d| entry.date >= d)
            && self.end_date.is_none_or(|d| entry.date <= d)
    }
}

/// Storage abstraction for the posting core
///
/// Reads return owned snapshots. Every balance-affecting write goes through
/// [`LedgerStorage::commit`], which must apply a [`Changeset`] atomically:
/// either all of it becomes visible or none of it does. Implementations keep a
/// per-company revision counter; a changeset carrying an expected revision is
/// rejected with [`LedgerError::Conflict`] when the revision moved.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Get an account by ID
    async fn get_account(&self, account_id: Uuid) -> LedgerResult<Option<Account>>;

    /// Get an account by its code within a company
    async fn get_account_by_code(
        &self,
        company_id: &str,
        code: &str,
    ) -> LedgerResult<Option<Account>>;

    /// List every account of a company, active or not
    async fn list_accounts(&self, company_id: &str) -> LedgerResult<Vec<Account>>;

    /// Get a journal entry by ID
    async fn get_journal_entry(&self, entry_id: Uuid) -> LedgerResult<Option<JournalEntry>>;

    /// Find a journal entry by its number within a company
    async fn find_journal_entry_by_number(
        &self,
        company_id: &str,
        entry_number: &str,
    ) -> LedgerResult<Option<JournalEntry>>;

    /// List journal entries of a company matching `filter`, ordered by date then number
    async fn list_journal_entries(
        &self,
        company_id: &str,
        filter: &JournalEntryFilter,
    ) -> LedgerResult<Vec<JournalEntry>>;

    /// Entry numbers of a company starting with `prefix`
    async fn list_entry_numbers(&self, company_id: &str, prefix: &str)
        -> LedgerResult<Vec<String>>;

    /// Ledger entries produced by one journal entry
    async fn list_journal_ledger_entries(
        &self,
        journal_entry_id: Uuid,
    ) -> LedgerResult<Vec<LedgerEntry>>;

    /// Ledger entries of one account ordered by `(date, sequence)`
    async fn list_account_ledger_entries(
        &self,
        account_id: Uuid,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> LedgerResult<Vec<LedgerEntry>>;

    /// Current revision of a company's balance state
    async fn company_revision(&self, company_id: &str) -> LedgerResult<u64>;

    /// Apply a changeset atomically
    async fn commit(&self, changeset: Changeset) -> LedgerResult<()>;

    /// Save a new document type; duplicate codes within a company conflict
    async fn save_document_type(&self, document_type: &DocumentType) -> LedgerResult<()>;

    /// Get a document type by ID
    async fn get_document_type(&self, document_type_id: Uuid)
        -> LedgerResult<Option<DocumentType>>;

    /// List document types of a company ordered by code
    async fn list_document_types(&self, company_id: &str) -> LedgerResult<Vec<DocumentType>>;

    /// Replace an existing document type
    async fn update_document_type(&self, document_type: &DocumentType) -> LedgerResult<()>;

    /// Insert a reservation
    ///
    /// Must fail with [`LedgerError::Conflict`] when another reserved or used
    /// reservation already holds the same `(company, number)`.
    async fn insert_reservation(&self, reservation: &DocumentNumberReservation)
        -> LedgerResult<()>;

    /// Get a reservation by ID
    async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> LedgerResult<Option<DocumentNumberReservation>>;

    /// The reserved or used reservation holding `number`, if any
    async fn find_active_reservation(
        &self,
        company_id: &str,
        number: &str,
    ) -> LedgerResult<Option<DocumentNumberReservation>>;

    /// Reservations of a company, newest first
    async fn list_reservations(
        &self,
        company_id: &str,
        document_type_id: Option<Uuid>,
        status: Option<ReservationStatus>,
    ) -> LedgerResult<Vec<DocumentNumberReservation>>;

    /// Replace an existing reservation, enforcing the same uniqueness rule as insert
    async fn update_reservation(&self, reservation: &DocumentNumberReservation)
        -> LedgerResult<()>;
}

/// Trait for implementing custom journal entry validation rules
pub trait JournalValidator: Send + Sync {
    /// Validate an entry before it is created, updated or posted
    fn validate_entry(&self, entry: &JournalEntry, tolerance: &BigDecimal) -> LedgerResult<()>;
}

/// Default validator with the basic double-entry rules
pub struct DefaultJournalValidator;

impl JournalValidator for DefaultJournalValidator {
    fn validate_entry(&self, entry: &JournalEntry, tolerance: &BigDecimal) -> LedgerResult<()> {
        entry.validate(tolerance)
    }
}

/// Actions reported to the audit collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Post,
    Unpost,
    Reverse,
    Allocate,
    Cancel,
    Repair,
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub company_id: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub description: String,
}

impl AuditEvent {
    pub fn new(
        company_id: impl Into<String>,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl ToString,
        description: impl Into<String>,
    ) -> Self {
        Self {
            company_id: company_id.into(),
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.to_string(),
            description: description.into(),
        }
    }
}

/// External audit-log collaborator
///
/// Failures are reported back but never undo or block the operation that
/// produced the event.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> LedgerResult<()>;
}

/// Audit sink that emits a structured tracing event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> LedgerResult<()> {
        tracing::info!(
            target: "audit",
            company_id = %event.company_id,
            action = ?event.action,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            "{}",
            event.description
        );
        Ok(())
    }
}
