//! Unit of work applied atomically by storage

use std::future::Future;
use tracing::warn;
use uuid::Uuid;

use crate::traits::LedgerStorage;
use crate::types::*;

/// Writes produced by one core operation.
///
/// Storage applies a changeset all-or-nothing. When `expected_revision` is set
/// the commit only succeeds if the company's revision still equals it. Any
/// changeset that writes balances or journal entries moves the revision.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub company_id: String,
    pub expected_revision: Option<u64>,
    /// Accounts to insert or replace
    pub accounts: Vec<Account>,
    /// Journal entries to insert or replace
    pub journal_entries: Vec<JournalEntry>,
    pub deleted_journal_entries: Vec<Uuid>,
    pub inserted_ledger_entries: Vec<LedgerEntry>,
    /// Existing ledger entries whose running balances were resequenced
    pub updated_ledger_entries: Vec<LedgerEntry>,
    pub deleted_ledger_entries: Vec<Uuid>,
    /// Reservations to replace
    pub reservations: Vec<DocumentNumberReservation>,
}

impl Changeset {
    pub fn new(company_id: impl Into<String>) -> Self {
        Self {
            company_id: company_id.into(),
            ..Default::default()
        }
    }

    /// Require the company revision to be unchanged at commit time
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }

    /// Whether this changeset alters balances or ledger entries
    pub fn touches_balances(&self) -> bool {
        !self.accounts.is_empty()
            || !self.inserted_ledger_entries.is_empty()
            || !self.updated_ledger_entries.is_empty()
            || !self.deleted_ledger_entries.is_empty()
    }

    /// Whether committing this changeset moves the company revision
    pub fn bumps_revision(&self) -> bool {
        self.touches_balances()
            || !self.journal_entries.is_empty()
            || !self.deleted_journal_entries.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.bumps_revision() && self.reservations.is_empty()
    }

    pub fn put_journal_entry(&mut self, entry: JournalEntry) {
        self.journal_entries.retain(|e| e.id != entry.id);
        self.journal_entries.push(entry);
    }

    pub fn put_reservation(&mut self, reservation: DocumentNumberReservation) {
        self.reservations.retain(|r| r.id != reservation.id);
        self.reservations.push(reservation);
    }
}

/// Commit the changeset produced by `plan`, re-planning while the company
/// revision keeps moving underneath.
///
/// A conflict that is not explained by a revision change (a duplicate number,
/// for instance) is returned at once.
pub(crate) async fn commit_with_retry<S, T, F, Fut>(
    storage: &S,
    max_attempts: u32,
    operation: &str,
    mut plan: F,
) -> LedgerResult<T>
where
    S: LedgerStorage + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<(Changeset, T)>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let (changeset, value) = plan().await?;
        let company_id = changeset.company_id.clone();
        let expected = changeset.expected_revision;

        match storage.commit(changeset).await {
            Ok(()) => return Ok(value),
            Err(e @ LedgerError::Conflict(_)) => {
                let current = storage.company_revision(&company_id).await?;
                let raced = expected.is_some_and(|rev| rev != current);
                if !raced || attempt >= max_attempts {
                    return Err(e);
                }
                warn!(error = %e, operation, attempt, "Concurrent change detected, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
